//! Transactions runtime: stages KV mutations under document-level metadata,
//! coordinates commit through a central Active Transaction Record, and
//! recovers mid-attempt failures via rollback or a background cleanup pass.

pub mod atr;
mod attempt;
pub mod cleanup;
mod staged_mutation;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::common::DocumentId;

pub use attempt::{AttemptContext, AttemptState, TransactionOperationFailed};
pub use staged_mutation::{StagedMutation, StagedMutationType};
pub use store::{DocumentStore, KvDocumentStore};

#[derive(Debug, Clone)]
pub struct TransactionsConfig {
    pub attempt_timeout: Duration,
    pub max_lambda_retries: u32,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        TransactionsConfig {
            attempt_timeout: Duration::from_secs(15),
            max_lambda_retries: 10,
        }
    }
}

/// Outcome of a fully resolved transaction: either it committed, or every
/// retry was exhausted and the last attempt's failure is returned verbatim.
#[derive(Debug)]
pub enum TransactionResult {
    Committed,
    Failed(TransactionOperationFailed),
}

/// Runs `lambda` to completion under ACID semantics, retrying the whole
/// lambda on transient attempt failures up to `config.max_lambda_retries`
/// times. `lambda` receives a fresh `AttemptContext` per try and stages its
/// mutations through it; this driver owns commit/rollback sequencing.
pub async fn run<F, Fut>(
    store: Arc<dyn DocumentStore>,
    atr_bucket: &str,
    config: &TransactionsConfig,
    mut lambda: F,
) -> TransactionResult
where
    F: FnMut(&mut AttemptContext) -> Fut,
    Fut: std::future::Future<Output = Result<(), TransactionOperationFailed>>,
{
    let transaction_id = Uuid::new_v4().to_string();

    for _ in 0..=config.max_lambda_retries {
        let atr_id = DocumentId::new(atr_bucket, format!("_txn:atr:{}", Uuid::new_v4()).into_bytes());
        let mut attempt = AttemptContext::new(transaction_id.clone(), atr_id, store.clone(), config.attempt_timeout);

        let lambda_result = lambda(&mut attempt).await;
        match lambda_result {
            Ok(()) => match attempt.commit().await {
                Ok(()) => return TransactionResult::Committed,
                Err(failure) if failure.should_retry => continue,
                Err(failure) => return TransactionResult::Failed(failure),
            },
            Err(failure) => {
                if !failure.should_not_rollback {
                    if let Err(rollback_failure) = attempt.rollback().await {
                        return TransactionResult::Failed(rollback_failure);
                    }
                }
                if failure.should_retry {
                    continue;
                }
                return TransactionResult::Failed(failure);
            }
        }
    }

    TransactionResult::Failed(TransactionOperationFailed::from(crate::error::Error::new(
        crate::error::ErrorKind::UnsupportedOperation,
        "transaction exhausted its retry budget",
    )))
}

impl From<crate::error::Error> for TransactionOperationFailed {
    fn from(cause: crate::error::Error) -> Self {
        TransactionOperationFailed {
            cause,
            should_not_rollback: true,
            should_retry: false,
            should_not_retry: true,
            failed_post_commit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::store::FetchedDocument;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        docs: Mutex<HashMap<Vec<u8>, (Value, u64)>>,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn get(&self, id: &DocumentId) -> crate::error::Result<Option<FetchedDocument>> {
            Ok(self.docs.lock().unwrap().get(&id.key).map(|(v, c)| FetchedDocument { content: v.clone(), cas: *c }))
        }
        async fn insert_staged(&self, id: &DocumentId, content: &Value) -> crate::error::Result<u64> {
            self.docs.lock().unwrap().insert(id.key.clone(), (content.clone(), 1));
            Ok(1)
        }
        async fn replace_staged(&self, id: &DocumentId, _cas: u64, content: &Value) -> crate::error::Result<u64> {
            self.docs.lock().unwrap().insert(id.key.clone(), (content.clone(), 2));
            Ok(2)
        }
        async fn remove_staged(&self, _id: &DocumentId, cas: u64) -> crate::error::Result<u64> {
            Ok(cas)
        }
        async fn commit_insert(&self, id: &DocumentId, content: &Value) -> crate::error::Result<()> {
            self.docs.lock().unwrap().insert(id.key.clone(), (content.clone(), 3));
            Ok(())
        }
        async fn commit_replace(&self, id: &DocumentId, content: &Value) -> crate::error::Result<()> {
            self.docs.lock().unwrap().insert(id.key.clone(), (content.clone(), 3));
            Ok(())
        }
        async fn commit_remove(&self, id: &DocumentId, _cas: u64) -> crate::error::Result<()> {
            self.docs.lock().unwrap().remove(&id.key);
            Ok(())
        }
        async fn rollback_insert(&self, id: &DocumentId, _cas: u64) -> crate::error::Result<()> {
            self.docs.lock().unwrap().remove(&id.key);
            Ok(())
        }
        async fn rollback_replace_or_remove(&self, id: &DocumentId, _cas: u64, original_content: &Value) -> crate::error::Result<()> {
            self.docs.lock().unwrap().insert(id.key.clone(), (original_content.clone(), 99));
            Ok(())
        }
        async fn write_atr_field(&self, _atr_id: &DocumentId, _path: &str, _value: &Value) -> crate::error::Result<()> {
            Ok(())
        }
        async fn read_atr(&self, _atr_id: &DocumentId) -> crate::error::Result<Option<Value>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn a_successful_lambda_commits_and_writes_the_final_body() {
        let store = Arc::new(FakeStore::default());
        let config = TransactionsConfig::default();
        let result = run(store.clone(), "travel-sample", &config, |attempt| {
            Box::pin(async move {
                attempt.insert(DocumentId::new("travel-sample", b"k1".to_vec()), serde_json::json!({"v": 1})).await
            })
        })
        .await;
        assert!(matches!(result, TransactionResult::Committed));
        assert_eq!(store.docs.lock().unwrap().get(b"k1".as_slice()).unwrap().0, serde_json::json!({"v": 1}));
    }

    #[tokio::test]
    async fn a_terminal_lambda_failure_rolls_back_and_is_not_retried() {
        let store = Arc::new(FakeStore::default());
        let config = TransactionsConfig::default();
        let result = run(store, "travel-sample", &config, |attempt| {
            Box::pin(async move { attempt.replace(DocumentId::new("travel-sample", b"missing".to_vec()), serde_json::json!({"v": 1})).await })
        })
        .await;
        match result {
            TransactionResult::Failed(failure) => assert!(failure.should_not_retry),
            TransactionResult::Committed => panic!("expected failure"),
        }
    }
}
