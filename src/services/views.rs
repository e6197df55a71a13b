//! Views service: legacy map-reduce index querying, sharing the same
//! row-streaming HTTP shape as the other three services.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::ServiceType;
use crate::error::Result;
use crate::http::HttpConnectionManager;

use super::{execute_row_stream, RowResultStream};

#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub key: Option<String>,
    pub limit: Option<u32>,
    pub descending: bool,
    pub reduce: bool,
}

pub struct ViewsService {
    http: Arc<HttpConnectionManager>,
    remote: SocketAddr,
}

impl ViewsService {
    pub fn new(http: Arc<HttpConnectionManager>, remote: SocketAddr) -> Self {
        ViewsService { http, remote }
    }

    pub async fn execute(&self, design_doc: &str, view: &str, options: ViewOptions) -> Result<RowResultStream> {
        let mut query: Vec<String> = Vec::new();
        if let Some(key) = &options.key {
            query.push(format!("key={key}"));
        }
        if let Some(limit) = options.limit {
            query.push(format!("limit={limit}"));
        }
        if options.descending {
            query.push("descending=true".to_string());
        }
        query.push(format!("reduce={}", options.reduce));

        let path = format!(
            "/_design/{design_doc}/_view/{view}?{}",
            query.join("&")
        );

        execute_row_stream(
            &self.http,
            ServiceType::Views,
            self.remote,
            &path,
            bytes::Bytes::new(),
            &[],
            "/rows/^",
        )
        .await
    }
}
