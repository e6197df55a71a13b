//! Columnar: a parallel, smaller Analytics-like component for clusters that
//! expose the columnar variant of the service. It reuses the same
//! row-streaming HTTP shape as `services::analytics` but carries its own,
//! much smaller error taxonomy rather than folding into the main one.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::common::ServiceType;
use crate::error::Error as CoreError;
use crate::http::HttpConnectionManager;
use crate::services::{execute_row_stream, RowResultStream};

/// The columnar sub-taxonomy: deliberately smaller than the main
/// `ErrorKind` enum, matching the server's own narrower error surface for
/// this variant of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnarErrorKind {
    Generic,
    InvalidCredential,
    Timeout,
    QueryError,
    Canceled,
    ClusterClosed,
    InvalidArgument,
}

#[derive(Debug, Clone)]
pub struct ColumnarError {
    pub kind: ColumnarErrorKind,
    pub message: String,
}

impl std::fmt::Display for ColumnarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ColumnarError {}

/// Maps a core error onto the columnar client-side taxonomy -- used when a
/// failure originates below the HTTP response (timeout, cancellation,
/// cluster-closed) rather than from a server error body.
pub fn from_core_error(e: &CoreError) -> ColumnarError {
    use crate::error::ErrorKind;
    let kind = match e.kind() {
        ErrorKind::UnambiguousTimeout | ErrorKind::AmbiguousTimeout => ColumnarErrorKind::Timeout,
        ErrorKind::RequestCanceled => ColumnarErrorKind::Canceled,
        ErrorKind::ClusterClosed => ColumnarErrorKind::ClusterClosed,
        ErrorKind::InvalidArgument => ColumnarErrorKind::InvalidArgument,
        _ => ColumnarErrorKind::Generic,
    };
    ColumnarError { kind, message: e.message.clone() }
}

/// Maps a server response code (found inside an `errors` array entry's
/// `code` field) onto the columnar taxonomy.
pub fn from_server_code(code: u32, message: impl Into<String>) -> ColumnarError {
    let kind = match code {
        20000 => ColumnarErrorKind::InvalidCredential,
        21002 => ColumnarErrorKind::Timeout,
        _ => ColumnarErrorKind::QueryError,
    };
    ColumnarError { kind, message: message.into() }
}

/// Picks the first error's `code` out of a server error-array body, if any.
pub fn first_server_error_code(errors: &Value) -> Option<(u32, String)> {
    let array = errors.as_array()?;
    let first = array.first()?;
    let code = first.get("code")?.as_u64()? as u32;
    let message = first.get("msg").and_then(Value::as_str).unwrap_or("columnar query error").to_string();
    Some((code, message))
}

#[derive(Debug, Clone, Default)]
pub struct ColumnarQueryOptions {
    pub positional_params: Vec<Value>,
    pub scan_consistency: Option<String>,
}

pub struct ColumnarService {
    http: Arc<HttpConnectionManager>,
    remote: SocketAddr,
}

impl ColumnarService {
    pub fn new(http: Arc<HttpConnectionManager>, remote: SocketAddr) -> Self {
        ColumnarService { http, remote }
    }

    pub async fn execute(&self, statement: &str, options: ColumnarQueryOptions) -> Result<RowResultStream, ColumnarError> {
        let mut body = json!({ "statement": statement, "args": options.positional_params });
        if let Some(consistency) = &options.scan_consistency {
            body["scan_consistency"] = json!(consistency);
        }
        let body = serde_json::to_vec(&body).map_err(|e| ColumnarError { kind: ColumnarErrorKind::InvalidArgument, message: e.to_string() })?;

        execute_row_stream(&self.http, ServiceType::Analytics, self.remote, "/analytics/service", body.into(), &[], "/results/^")
            .await
            .map_err(|e| from_core_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_code_20000_is_invalid_credential() {
        let err = from_server_code(20000, "bad creds");
        assert_eq!(err.kind, ColumnarErrorKind::InvalidCredential);
    }

    #[test]
    fn server_code_21002_is_timeout() {
        let err = from_server_code(21002, "too slow");
        assert_eq!(err.kind, ColumnarErrorKind::Timeout);
    }

    #[test]
    fn unrecognized_code_falls_back_to_query_error() {
        let err = from_server_code(99999, "something else");
        assert_eq!(err.kind, ColumnarErrorKind::QueryError);
    }

    #[test]
    fn first_server_error_code_reads_the_first_array_entry() {
        let errors = json!([{"code": 21002, "msg": "timed out"}, {"code": 1, "msg": "other"}]);
        let (code, message) = first_server_error_code(&errors).unwrap();
        assert_eq!(code, 21002);
        assert_eq!(message, "timed out");
    }
}
