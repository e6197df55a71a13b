//! Full-Text Search service: index query execution over the same
//! row-streaming HTTP shape, with facet results folded into the metadata
//! trailer rather than the row stream.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::common::ServiceType;
use crate::error::{Error, Result};
use crate::http::HttpConnectionManager;

use super::{execute_row_stream, RowResultStream};

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub fields: Vec<String>,
    pub limit: Option<u32>,
    pub facets: Option<Value>,
}

pub struct SearchService {
    http: Arc<HttpConnectionManager>,
    remote: SocketAddr,
}

impl SearchService {
    pub fn new(http: Arc<HttpConnectionManager>, remote: SocketAddr) -> Self {
        SearchService { http, remote }
    }

    pub async fn execute(&self, index: &str, query: Value, options: SearchOptions) -> Result<RowResultStream> {
        let mut body = json!({ "query": query, "fields": options.fields });
        if let Some(limit) = options.limit {
            body["size"] = json!(limit);
        }
        if let Some(facets) = options.facets {
            body["facets"] = facets;
        }
        let body = serde_json::to_vec(&body).map_err(Error::from)?;

        execute_row_stream(
            &self.http,
            ServiceType::Search,
            self.remote,
            &format!("/api/index/{index}/query"),
            body.into(),
            &[],
            "/hits/^",
        )
        .await
    }
}
