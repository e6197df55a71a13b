//! Retry engine: maps an error + request idempotency to
//! `{retry-after-delay | do-not-retry | fail}`.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    DoNotRetry,
    Fail,
}

/// Exponential backoff with a ceiling, the common shape across the pack's
/// retrying clients.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_secs(2),
            max_attempts: 32,
        }
    }
}

impl BackoffPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let scaled = self.base.as_millis().saturating_mul(1u128 << shift);
        Duration::from_millis(scaled.min(self.max.as_millis()) as u64)
    }
}

pub struct RetryEngine {
    backoff: BackoffPolicy,
}

impl RetryEngine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        RetryEngine { backoff }
    }

    /// Decides what to do with `error` given whether the request is
    /// idempotent and how many times it has already been retried.
    pub fn classify(&self, error: &Error, idempotent: bool, attempt: u32) -> RetryDecision {
        if attempt >= self.backoff.max_attempts {
            return RetryDecision::Fail;
        }

        let retryable = error.kind().is_always_transient() || self.is_conditionally_retryable(error.kind(), idempotent);

        if !retryable {
            return RetryDecision::DoNotRetry;
        }

        RetryDecision::RetryAfter(self.backoff.delay_for(attempt))
    }

    fn is_conditionally_retryable(&self, kind: ErrorKind, idempotent: bool) -> bool {
        match kind {
            // Always safe: read-side / no-op-on-retry semantics.
            ErrorKind::UnambiguousTimeout
            | ErrorKind::DocumentNotFound
            | ErrorKind::CollectionNotFound
            | ErrorKind::PreparedStatementFailure => true,
            // Safe only when the caller marked the op idempotent, since a
            // blind retry could double-apply a mutation.
            ErrorKind::AmbiguousTimeout | ErrorKind::DurabilityAmbiguous => idempotent,
            _ => false,
        }
    }
}

/// Drives `op` to completion, consulting a fresh `RetryEngine` built from
/// `policy` after every failure. `idempotent` governs whether ambiguous
/// outcomes (timeouts, durability-ambiguous) are safe to retry blindly.
pub async fn call_with_retry<T, F, Fut>(policy: BackoffPolicy, idempotent: bool, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let engine = RetryEngine::new(policy);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match engine.classify(&e, idempotent, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::DoNotRetry | RetryDecision::Fail => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod retry_loop_tests {
    use super::*;
    use crate::error::ErrorContext;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn retries_a_transient_failure_until_it_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_attempts: 5,
        };
        let result = call_with_retry(policy, true, || async {
            if calls.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                Err(Error::new(ErrorKind::ServiceNotAvailable, "boom").with_context(ErrorContext::new()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_immediately_on_a_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retry(BackoffPolicy::default(), true, || async {
            calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(Error::new(ErrorKind::InvalidArgument, "nope"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    fn err(kind: ErrorKind) -> Error {
        Error::new(kind, "boom").with_context(ErrorContext::new())
    }

    #[test]
    fn service_not_available_always_retries() {
        let engine = RetryEngine::new(BackoffPolicy::default());
        let decision = engine.classify(&err(ErrorKind::ServiceNotAvailable), false, 0);
        assert!(matches!(decision, RetryDecision::RetryAfter(_)));
    }

    #[test]
    fn ambiguous_timeout_needs_idempotency() {
        let engine = RetryEngine::new(BackoffPolicy::default());
        assert_eq!(
            engine.classify(&err(ErrorKind::AmbiguousTimeout), false, 0),
            RetryDecision::DoNotRetry
        );
        assert!(matches!(
            engine.classify(&err(ErrorKind::AmbiguousTimeout), true, 0),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn exhausted_attempts_fail_outright() {
        let engine = RetryEngine::new(BackoffPolicy {
            max_attempts: 1,
            ..Default::default()
        });
        assert_eq!(
            engine.classify(&err(ErrorKind::ServiceNotAvailable), true, 1),
            RetryDecision::Fail
        );
    }

    #[test]
    fn invalid_argument_never_retries() {
        let engine = RetryEngine::new(BackoffPolicy::default());
        assert_eq!(
            engine.classify(&err(ErrorKind::InvalidArgument), true, 0),
            RetryDecision::DoNotRetry
        );
    }
}
