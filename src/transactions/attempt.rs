//! Per-attempt state machine: stages mutations against the document store,
//! then drives ATR-coordinated commit or rollback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::common::DocumentId;
use crate::error::{Error, ErrorKind};

use super::atr::{AtrEntry, AtrStatus, DocRecord};
use super::staged_mutation::{StagedMutation, StagedMutationQueue, StagedMutationType};
use super::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    Staging,
    Committing,
    Committed,
    Aborting,
    RolledBack,
    Completed,
}

/// A transaction error carries a retry/rollback classifier alongside the
/// underlying cause, per the operational-error contract: callers branch on
/// these booleans to decide whether to retry the lambda, surface the
/// error, or enter overtime -- not on the error's `kind()` alone.
#[derive(Debug, Clone)]
pub struct TransactionOperationFailed {
    pub cause: Error,
    pub should_not_rollback: bool,
    pub should_retry: bool,
    pub should_not_retry: bool,
    pub failed_post_commit: bool,
}

impl TransactionOperationFailed {
    fn retryable(cause: Error) -> Self {
        TransactionOperationFailed {
            cause,
            should_not_rollback: false,
            should_retry: true,
            should_not_retry: false,
            failed_post_commit: false,
        }
    }

    fn terminal(cause: Error) -> Self {
        TransactionOperationFailed {
            cause,
            should_not_rollback: false,
            should_retry: false,
            should_not_retry: true,
            failed_post_commit: false,
        }
    }

    fn post_commit(cause: Error) -> Self {
        TransactionOperationFailed {
            cause,
            should_not_rollback: true,
            should_retry: false,
            should_not_retry: true,
            failed_post_commit: true,
        }
    }
}

fn now_msecs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn doc_record_for(id: &DocumentId) -> DocRecord {
    DocRecord::new(id.bucket.clone(), id.scope.clone(), id.collection.clone(), String::from_utf8_lossy(&id.key).into_owned())
}

/// Drives one attempt of the user lambda: staging, then commit or rollback.
pub struct AttemptContext {
    pub transaction_id: String,
    pub attempt_id: String,
    pub atr_id: DocumentId,
    store: Arc<dyn DocumentStore>,
    state: AttemptState,
    queue: StagedMutationQueue,
    atr_created: bool,
    expiry: Duration,
    started_at: tokio::time::Instant,
    overtime: bool,
}

impl AttemptContext {
    pub fn new(transaction_id: String, atr_id: DocumentId, store: Arc<dyn DocumentStore>, expiry: Duration) -> Self {
        AttemptContext {
            transaction_id,
            attempt_id: Uuid::new_v4().to_string(),
            atr_id,
            store,
            state: AttemptState::NotStarted,
            queue: StagedMutationQueue::new(),
            atr_created: false,
            expiry,
            started_at: tokio::time::Instant::now(),
            overtime: false,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Once exceeded, further commit/rollback errors become non-retryable
    /// post-commit failures instead of lambda retries.
    fn check_overtime(&mut self) {
        if self.started_at.elapsed() >= self.expiry {
            self.overtime = true;
        }
    }

    async fn ensure_atr_created(&mut self) -> Result<(), TransactionOperationFailed> {
        if self.atr_created {
            return Ok(());
        }
        let entry = AtrEntry::pending(self.expiry.as_millis() as u64, now_msecs());
        self.store
            .write_atr_field(&self.atr_id, &super::atr::attempt_path(&self.attempt_id, ""), &entry.to_json())
            .await
            .map_err(TransactionOperationFailed::retryable)?;
        self.atr_created = true;
        self.state = AttemptState::Staging;
        Ok(())
    }

    pub async fn get(&self, id: &DocumentId) -> Result<Option<Value>, TransactionOperationFailed> {
        self.store
            .get(id)
            .await
            .map(|doc| doc.map(|d| d.content))
            .map_err(TransactionOperationFailed::retryable)
    }

    pub async fn insert(&mut self, id: DocumentId, content: Value) -> Result<(), TransactionOperationFailed> {
        self.ensure_atr_created().await?;
        let cas = self.store.insert_staged(&id, &content).await.map_err(TransactionOperationFailed::retryable)?;
        self.queue.stage(StagedMutation {
            document_id: id,
            kind: StagedMutationType::Insert,
            staged_content: Some(content),
            cas_before_staging: cas,
            original_content: None,
        });
        Ok(())
    }

    pub async fn replace(&mut self, id: DocumentId, content: Value) -> Result<(), TransactionOperationFailed> {
        self.ensure_atr_created().await?;
        let current = self.store.get(&id).await.map_err(TransactionOperationFailed::retryable)?;
        let (cas, original) = match current {
            Some(doc) => (doc.cas, doc.content),
            None => return Err(TransactionOperationFailed::terminal(Error::new(ErrorKind::DocumentNotFound, "replace target does not exist"))),
        };
        let new_cas = self
            .store
            .replace_staged(&id, cas, &content)
            .await
            .map_err(TransactionOperationFailed::retryable)?;
        self.queue.stage(StagedMutation {
            document_id: id,
            kind: StagedMutationType::Replace,
            staged_content: Some(content),
            cas_before_staging: new_cas,
            original_content: Some(original),
        });
        Ok(())
    }

    pub async fn remove(&mut self, id: DocumentId) -> Result<(), TransactionOperationFailed> {
        self.ensure_atr_created().await?;
        let current = self.store.get(&id).await.map_err(TransactionOperationFailed::retryable)?;
        let (cas, original) = match current {
            Some(doc) => (doc.cas, doc.content),
            None => return Err(TransactionOperationFailed::terminal(Error::new(ErrorKind::DocumentNotFound, "remove target does not exist"))),
        };
        self.store.remove_staged(&id, cas).await.map_err(TransactionOperationFailed::retryable)?;
        self.queue.stage(StagedMutation {
            document_id: id,
            kind: StagedMutationType::Remove,
            staged_content: None,
            cas_before_staging: cas,
            original_content: Some(original),
        });
        Ok(())
    }

    pub fn staged_count(&self) -> usize {
        self.queue.len()
    }

    /// Commit protocol: write the ATR's `committed` entry (with the three
    /// doc-record lists), rewrite every staged document, then mark the ATR
    /// `completed`.
    pub async fn commit(&mut self) -> Result<(), TransactionOperationFailed> {
        self.check_overtime();
        self.state = AttemptState::Committing;

        let mut by_kind: HashMap<&'static str, Vec<DocRecord>> = HashMap::new();
        for mutation in self.queue.iter() {
            by_kind.entry(mutation.kind.as_str()).or_default().push(doc_record_for(&mutation.document_id));
        }

        self.store
            .write_atr_field(&self.atr_id, &super::atr::attempt_path(&self.attempt_id, super::atr::FIELD_STATUS), &Value::String("committed".to_string()))
            .await
            .map_err(|e| self.classify_commit_phase_error(e))?;
        self.state = AttemptState::Committed;

        for mutation in self.queue.iter() {
            let result = match mutation.kind {
                StagedMutationType::Insert => {
                    self.store.commit_insert(&mutation.document_id, mutation.staged_content.as_ref().unwrap()).await
                }
                StagedMutationType::Replace => {
                    self.store.commit_replace(&mutation.document_id, mutation.staged_content.as_ref().unwrap()).await
                }
                StagedMutationType::Remove => self.store.commit_remove(&mutation.document_id, mutation.cas_before_staging).await,
            };
            result.map_err(|e| self.classify_commit_phase_error(e))?;
        }

        self.store
            .write_atr_field(&self.atr_id, &super::atr::attempt_path(&self.attempt_id, super::atr::FIELD_STATUS), &Value::String("completed".to_string()))
            .await
            .map_err(|e| self.classify_commit_phase_error(e))?;
        self.state = AttemptState::Completed;
        Ok(())
    }

    fn classify_commit_phase_error(&self, cause: Error) -> TransactionOperationFailed {
        if self.overtime || self.state == AttemptState::Committed {
            TransactionOperationFailed::post_commit(cause)
        } else {
            TransactionOperationFailed::retryable(cause)
        }
    }

    /// Rollback: write `aborted`, undo every staged mutation (deleting
    /// shadow inserts, restoring replaced/removed originals), then write
    /// `rolled-back`.
    pub async fn rollback(&mut self) -> Result<(), TransactionOperationFailed> {
        self.check_overtime();
        self.state = AttemptState::Aborting;

        if self.atr_created {
            self.store
                .write_atr_field(&self.atr_id, &super::atr::attempt_path(&self.attempt_id, super::atr::FIELD_STATUS), &Value::String("aborted".to_string()))
                .await
                .map_err(|e| self.classify_rollback_error(e))?;
        }

        for mutation in self.queue.iter() {
            let result = match mutation.kind {
                StagedMutationType::Insert => self.store.rollback_insert(&mutation.document_id, mutation.cas_before_staging).await,
                StagedMutationType::Replace | StagedMutationType::Remove => {
                    let original = mutation.original_content.as_ref().expect("replace/remove always records the pre-attempt body");
                    self.store.rollback_replace_or_remove(&mutation.document_id, mutation.cas_before_staging, original).await
                }
            };
            result.map_err(|e| self.classify_rollback_error(e))?;
        }

        if self.atr_created {
            self.store
                .write_atr_field(&self.atr_id, &super::atr::attempt_path(&self.attempt_id, super::atr::FIELD_STATUS), &Value::String("rolled_back".to_string()))
                .await
                .map_err(|e| self.classify_rollback_error(e))?;
        }
        self.state = AttemptState::RolledBack;
        Ok(())
    }

    fn classify_rollback_error(&self, cause: Error) -> TransactionOperationFailed {
        if self.overtime {
            TransactionOperationFailed::post_commit(cause)
        } else {
            TransactionOperationFailed::retryable(cause)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::store::FetchedDocument;
    use async_trait::async_trait;
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

    fn doc(key: &str) -> DocumentId {
        DocumentId::new("travel-sample", key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn insert_then_commit_writes_the_final_body() {
        let store = Arc::new(FakeStore::default());
        let mut attempt = AttemptContext::new("txn1".into(), doc("atr0"), store.clone(), Duration::from_secs(15));
        attempt.insert(doc("k1"), serde_json::json!({"v": 1})).await.unwrap();
        assert_eq!(attempt.state(), AttemptState::Staging);
        attempt.commit().await.unwrap();
        assert_eq!(attempt.state(), AttemptState::Completed);
        let got = store.docs.lock().unwrap().get(b"k1".as_slice()).cloned();
        assert_eq!(got.unwrap().0, serde_json::json!({"v": 1}));
    }

    #[tokio::test]
    async fn insert_then_rollback_deletes_the_shadow_document() {
        let store = Arc::new(FakeStore::default());
        let mut attempt = AttemptContext::new("txn1".into(), doc("atr0"), store.clone(), Duration::from_secs(15));
        attempt.insert(doc("k1"), serde_json::json!({"v": 1})).await.unwrap();
        attempt.rollback().await.unwrap();
        assert_eq!(attempt.state(), AttemptState::RolledBack);
        assert!(store.docs.lock().unwrap().get(b"k1".as_slice()).is_none());
    }

    #[tokio::test]
    async fn replace_on_a_missing_document_is_a_terminal_failure() {
        let store = Arc::new(FakeStore::default());
        let mut attempt = AttemptContext::new("txn1".into(), doc("atr0"), store, Duration::from_secs(15));
        let err = attempt.replace(doc("missing"), serde_json::json!({"v": 1})).await.unwrap_err();
        assert!(err.should_not_retry);
    }

    #[tokio::test]
    async fn replace_then_rollback_restores_the_original_body() {
        let store = Arc::new(FakeStore::default());
        store.docs.lock().unwrap().insert(b"k1".to_vec(), (serde_json::json!({"v": 0}), 5));
        let mut attempt = AttemptContext::new("txn1".into(), doc("atr0"), store.clone(), Duration::from_secs(15));
        attempt.replace(doc("k1"), serde_json::json!({"v": 1})).await.unwrap();
        attempt.rollback().await.unwrap();
        let got = store.docs.lock().unwrap().get(b"k1".as_slice()).cloned().unwrap();
        assert_eq!(got.0, serde_json::json!({"v": 0}));
    }

    #[tokio::test]
    async fn staging_twice_for_one_key_keeps_the_queue_at_one_entry() {
        let store = Arc::new(FakeStore::default());
        let mut attempt = AttemptContext::new("txn1".into(), doc("atr0"), store, Duration::from_secs(15));
        attempt.insert(doc("k1"), serde_json::json!({"v": 1})).await.unwrap();
        store_replace_over_insert(&mut attempt).await;
        assert_eq!(attempt.staged_count(), 1);
    }

    async fn store_replace_over_insert(attempt: &mut AttemptContext) {
        // Re-staging the same key as a replace is a same-attempt overwrite,
        // not a second queue entry.
        let _ = attempt.replace(DocumentId::new("travel-sample", b"k1".to_vec()), serde_json::json!({"v": 2})).await;
    }
}
