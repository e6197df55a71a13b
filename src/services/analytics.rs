//! Columnar Analytics service: SQL++-for-analytics statement execution
//! over the same row-streaming HTTP shape as Query, without a prepared
//! plan cache (the analytics engine compiles per request).

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use crate::common::ServiceType;
use crate::error::{Error, Result};
use crate::http::HttpConnectionManager;

use super::{execute_row_stream, RowResultStream};

#[derive(Debug, Clone, Default)]
pub struct AnalyticsOptions {
    pub positional_params: Vec<serde_json::Value>,
    pub priority: bool,
}

pub struct AnalyticsService {
    http: Arc<HttpConnectionManager>,
    remote: SocketAddr,
}

impl AnalyticsService {
    pub fn new(http: Arc<HttpConnectionManager>, remote: SocketAddr) -> Self {
        AnalyticsService { http, remote }
    }

    pub async fn execute(&self, statement: &str, options: AnalyticsOptions) -> Result<RowResultStream> {
        let body = serde_json::to_vec(&json!({
            "statement": statement,
            "args": options.positional_params,
        }))
        .map_err(Error::from)?;

        let headers: &[(&str, &str)] = if options.priority {
            &[("Analytics-Priority", "-1")]
        } else {
            &[]
        };

        execute_row_stream(
            &self.http,
            ServiceType::Analytics,
            self.remote,
            "/analytics/service",
            body.into(),
            headers,
            "/results/^",
        )
        .await
    }
}
