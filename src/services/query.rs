//! SQL-like Query service: ad-hoc and prepared statement execution, with a
//! cache of server-assigned prepared plan names keyed by statement text.
//! A response carrying error code 4040, 4050, or 4070 means the server
//! forgot or rejected the cached plan; on any of those the client evicts
//! the entry and retries once as a fresh `PREPARE`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use crate::common::{ScanConsistency, ServiceType};
use crate::error::{Error, ErrorKind, Result};
use crate::http::HttpConnectionManager;

use super::{execute_row_stream, RowResultStream};

/// Statement text -> server-assigned plan name. Invalidated wholesale or
/// per-entry when the server signals the plan is stale.
#[derive(Default)]
pub struct PreparedStatementCache {
    entries: Mutex<HashMap<String, String>>,
}

impl PreparedStatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, statement: &str) -> Option<String> {
        self.entries.lock().await.get(statement).cloned()
    }

    async fn insert(&self, statement: &str, name: String) {
        self.entries.lock().await.insert(statement.to_string(), name);
    }

    pub async fn invalidate(&self, statement: &str) {
        self.entries.lock().await.remove(statement);
    }
}

/// Error codes the server uses to say "your prepared plan is no longer
/// valid"; retried once as a fresh prepare rather than surfaced.
const STALE_PREPARED_PLAN_CODES: [u32; 3] = [4040, 4050, 4070];

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub positional_params: Vec<serde_json::Value>,
    pub named_params: HashMap<String, serde_json::Value>,
    pub scan_consistency: ScanConsistency,
    pub adhoc: bool,
    pub timeout: Option<Duration>,
}

pub struct QueryService {
    http: Arc<HttpConnectionManager>,
    prepared: Arc<PreparedStatementCache>,
    remote: SocketAddr,
}

impl QueryService {
    pub fn new(http: Arc<HttpConnectionManager>, remote: SocketAddr) -> Self {
        QueryService {
            http,
            prepared: Arc::new(PreparedStatementCache::new()),
            remote,
        }
    }

    pub async fn execute(&self, statement: &str, options: QueryOptions) -> Result<RowResultStream> {
        if options.adhoc {
            return self.execute_adhoc(statement, &options).await;
        }

        match self.prepared.get(statement).await {
            Some(name) => match self.execute_prepared(&name, &options).await {
                Ok(stream) => Ok(stream),
                Err(e) if is_stale_plan_error(&e) => {
                    self.prepared.invalidate(statement).await;
                    self.prepare_and_execute(statement, &options).await
                }
                Err(e) => Err(e),
            },
            None => self.prepare_and_execute(statement, &options).await,
        }
    }

    async fn prepare_and_execute(&self, statement: &str, options: &QueryOptions) -> Result<RowResultStream> {
        let prepare_body = serde_json::to_vec(&json!({
            "statement": format!("PREPARE {statement}"),
        }))
        .map_err(Error::from)?;

        // The PREPARE call itself returns a single-row result whose row
        // carries the plan name; drain it before executing the plan.
        let mut prep_stream = execute_row_stream(
            &self.http,
            ServiceType::Query,
            self.remote,
            "/query/service",
            prepare_body.into(),
            &[],
            "/results/^",
        )
        .await?;

        let plan_name = match prep_stream.next_row().await {
            Some(Ok(row)) => extract_plan_name(&row)?,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::new(ErrorKind::PreparedStatementFailure, "PREPARE returned no rows")),
        };

        self.prepared.insert(statement, plan_name.clone()).await;
        self.execute_prepared(&plan_name, options).await
    }

    async fn execute_prepared(&self, plan_name: &str, options: &QueryOptions) -> Result<RowResultStream> {
        let body = serde_json::to_vec(&json!({
            "prepared": plan_name,
            "args": options.positional_params,
            "scan_consistency": scan_consistency_str(options.scan_consistency),
        }))
        .map_err(Error::from)?;
        execute_row_stream(
            &self.http,
            ServiceType::Query,
            self.remote,
            "/query/service",
            body.into(),
            &[],
            "/results/^",
        )
        .await
    }

    async fn execute_adhoc(&self, statement: &str, options: &QueryOptions) -> Result<RowResultStream> {
        let body = serde_json::to_vec(&json!({
            "statement": statement,
            "args": options.positional_params,
            "scan_consistency": scan_consistency_str(options.scan_consistency),
        }))
        .map_err(Error::from)?;
        execute_row_stream(
            &self.http,
            ServiceType::Query,
            self.remote,
            "/query/service",
            body.into(),
            &[],
            "/results/^",
        )
        .await
    }
}

fn scan_consistency_str(sc: ScanConsistency) -> &'static str {
    match sc {
        ScanConsistency::NotBounded => "not_bounded",
        ScanConsistency::RequestPlus => "request_plus",
    }
}

fn extract_plan_name(row: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(row).map_err(Error::from)?;
    value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::new(ErrorKind::PreparedStatementFailure, "PREPARE row missing plan name"))
}

fn is_stale_plan_error(error: &Error) -> bool {
    error
        .context
        .server_errors
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|c| c.as_u64())
        .map(|code| STALE_PREPARED_PLAN_CODES.contains(&(code as u32)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_returns_none_until_an_entry_is_inserted() {
        let cache = PreparedStatementCache::new();
        assert_eq!(cache.get("select 1").await, None);
        cache.insert("select 1", "plan-1".to_string()).await;
        assert_eq!(cache.get("select 1").await, Some("plan-1".to_string()));
        cache.invalidate("select 1").await;
        assert_eq!(cache.get("select 1").await, None);
    }

    #[test]
    fn extracts_plan_name_from_a_prepare_row() {
        let row = r#"{"name":"plan-42","operator":"..."}"#;
        assert_eq!(extract_plan_name(row).unwrap(), "plan-42");
    }

    #[test]
    fn stale_plan_error_codes_trigger_re_prepare() {
        let err = Error::new(ErrorKind::PreparedStatementFailure, "no such plan").with_context(
            crate::error::ErrorContext::new().with_server_errors(json!({"code": 4050})),
        );
        assert!(is_stale_plan_error(&err));

        let other = Error::new(ErrorKind::PreparedStatementFailure, "x").with_context(
            crate::error::ErrorContext::new().with_server_errors(json!({"code": 1065})),
        );
        assert!(!is_stale_plan_error(&other));
    }
}
