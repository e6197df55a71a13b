//! Flat error taxonomy shared by every component in the pipeline.
//!
//! The taxonomy is intentionally flat (one enum, not one type per service):
//! callers branch on `kind()`, not on `TypeId`. Every error still
//! carries as much structured context as the call site had available (last
//! dispatched-to/from endpoint, HTTP status, server error array,
//! correlation id) so nothing is silently flattened to a string.

use std::fmt;

use serde_json::Value;

/// One flat taxonomy of error kinds, grouped by originating area for
/// documentation purposes only -- the enum itself has no sub-typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // --- Common ---
    UnambiguousTimeout,
    AmbiguousTimeout,
    RequestCanceled,
    InvalidArgument,
    ServiceNotAvailable,
    InternalServerFailure,
    AuthenticationFailure,
    BucketNotFound,
    CollectionNotFound,
    IndexNotFound,
    CasMismatch,
    ParsingFailure,
    DecodingFailure,
    UnsupportedOperation,
    FeatureNotAvailable,

    // --- KV ---
    DocumentNotFound,
    DocumentExists,
    DocumentLocked,
    DocumentNotLocked,
    ValueTooLarge,
    DurabilityImpossible,
    DurabilityAmbiguous,
    RangeScanCompleted,

    // --- Query ---
    PlanningFailure,
    IndexFailure,
    PreparedStatementFailure,
    DmlFailure,

    // --- Analytics ---
    CompilationFailure,
    JobQueueFull,
    DatasetNotFound,
    DataverseNotFound,
    DatasetExists,
    DataverseExists,
    LinkNotFound,

    // --- Streaming lexer ---
    LexerGarbageTrailing,
    LexerStrayToken,
    LexerBracketMismatch,
    LexerInvalidEscape,
    LexerDepthExceeded,
    LexerBadJsonPointer,
    LexerOutOfMemory,

    // --- Network ---
    ClusterClosed,
    ResolveFailure,
    HandshakeFailure,
}

impl ErrorKind {
    /// Whether a request carrying this error kind is safe to retry
    /// regardless of the idempotency flag (used by the retry engine as a
    /// fast path before consulting idempotency at all).
    pub fn is_always_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServiceNotAvailable | ErrorKind::ClusterClosed | ErrorKind::ResolveFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Structured context threaded through every error so that a user callback
/// always receives as much detail as the failing component had, without the
/// taxonomy itself growing per-component variants.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Endpoint the client last dispatched to or received from, if any.
    pub last_dispatched_to: Option<String>,
    pub last_dispatched_from: Option<String>,
    /// HTTP status code, when the error originated from an HTTP response.
    pub http_status: Option<u16>,
    /// Raw server-reported error array/object, when present.
    pub server_errors: Option<Value>,
    /// Client-assigned correlation id of the request that failed.
    pub correlation_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, remote: impl Into<String>) -> Self {
        self.last_dispatched_to = Some(remote.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_server_errors(mut self, errors: Value) -> Self {
        self.server_errors = Some(errors);
        self
    }
}

/// The crate's single error type. Flat by `kind`, rich by `context`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}{context_suffix}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn context_suffix(&self) -> String {
        if self.context.correlation_id.is_none() && self.context.last_dispatched_to.is_none() {
            return String::new();
        }
        format!(
            " (to={:?} corr_id={:?})",
            self.context.last_dispatched_to, self.context.correlation_id
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::TimedOut => ErrorKind::UnambiguousTimeout,
            IoKind::ConnectionReset | IoKind::ConnectionAborted | IoKind::BrokenPipe => {
                ErrorKind::ServiceNotAvailable
            }
            _ => ErrorKind::ServiceNotAvailable,
        };
        Error::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::ParsingFailure, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::new(ErrorKind::DocumentNotFound, "no such key");
        let rendered = err.to_string();
        assert!(rendered.contains("DocumentNotFound"));
        assert!(rendered.contains("no such key"));
    }

    #[test]
    fn always_transient_kinds() {
        assert!(ErrorKind::ServiceNotAvailable.is_always_transient());
        assert!(!ErrorKind::CasMismatch.is_always_transient());
    }
}
