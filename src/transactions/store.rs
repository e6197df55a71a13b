//! Document-store abstraction the attempt driver mutates through.
//!
//! Keeping this behind a trait lets the attempt state machine
//! (`attempt.rs`) stay free of KV routing/session concerns; the concrete
//! `KvDocumentStore` below is the only implementation that talks to a real
//! cluster, wiring `CrudComponent` to `ClusterConfig`/`KvConnectionPool`
//! the same way `Agent` will for ordinary CRUD calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cluster_config::ClusterConfig;
use crate::common::DocumentId;
use crate::crud::{CrudComponent, MutateOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::kv::{Credentials, KvConnectionPool};

/// A document as read back for transaction purposes: its body, its CAS, and
/// -- if another attempt has it staged -- the staged xattrs.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub content: Value,
    pub cas: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &DocumentId) -> Result<Option<FetchedDocument>>;

    /// Creates the shadow document for a staged insert: CAS=0, body carries
    /// the staged content directly (subdoc xattr staging is approximated by
    /// storing the staged body as the document value, since the mutate-in
    /// surface here only exposes single-path dict-upsert semantics).
    async fn insert_staged(&self, id: &DocumentId, content: &Value) -> Result<u64>;

    async fn replace_staged(&self, id: &DocumentId, cas: u64, content: &Value) -> Result<u64>;

    async fn remove_staged(&self, id: &DocumentId, cas: u64) -> Result<u64>;

    async fn commit_insert(&self, id: &DocumentId, content: &Value) -> Result<()>;

    async fn commit_replace(&self, id: &DocumentId, content: &Value) -> Result<()>;

    async fn commit_remove(&self, id: &DocumentId, cas: u64) -> Result<()>;

    async fn rollback_insert(&self, id: &DocumentId, cas: u64) -> Result<()>;

    async fn rollback_replace_or_remove(&self, id: &DocumentId, cas: u64, original_content: &Value) -> Result<()>;

    async fn write_atr_field(&self, atr_id: &DocumentId, path: &str, value: &Value) -> Result<()>;

    async fn read_atr(&self, atr_id: &DocumentId) -> Result<Option<Value>>;
}

/// Real `DocumentStore` driving ordinary KV opcodes. Every write here maps
/// one-to-one onto the same CRUD surface a non-transactional caller uses;
/// the "transaction-ness" is entirely in how the attempt driver sequences
/// these calls (ATR first, shadow doc second, commit ATR, rewrite docs).
pub struct KvDocumentStore {
    cluster: Arc<ClusterConfig>,
    pool: Arc<KvConnectionPool>,
    bucket: String,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl KvDocumentStore {
    pub fn new(
        cluster: Arc<ClusterConfig>,
        pool: Arc<KvConnectionPool>,
        bucket: String,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Self {
        KvDocumentStore {
            cluster,
            pool,
            bucket,
            credentials,
            timeout,
        }
    }

    async fn session_for(&self, id: &DocumentId) -> Result<(crate::kv::KvSession, u16)> {
        let vbucket = self
            .cluster
            .vbucket_for_key(&id.key)
            .ok_or_else(|| Error::new(ErrorKind::InternalServerFailure, "no vbucket map for this cluster snapshot"))?;
        let node = self
            .cluster
            .node_for_vbucket(vbucket)
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no owning node for vbucket"))?;
        let (host, port) = self
            .cluster
            .kv_endpoint_for_node(node, self.pool.is_tls())
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "node has no usable address"))?;
        let session = self
            .pool
            .acquire(&host, port, Some(&self.bucket), self.credentials.as_ref())
            .await?;
        Ok((session, vbucket))
    }

    fn deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.timeout
    }

    fn encode(content: &Value) -> Vec<u8> {
        serde_json::to_vec(content).unwrap_or_default()
    }

    fn decode(bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}

#[async_trait]
impl DocumentStore for KvDocumentStore {
    async fn get(&self, id: &DocumentId) -> Result<Option<FetchedDocument>> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        match crud.get(vbucket, &id.key, self.deadline()).await {
            Ok(result) => Ok(Some(FetchedDocument {
                content: Self::decode(&result.value)?,
                cas: result.cas,
            })),
            Err(e) if e.kind() == ErrorKind::DocumentNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_staged(&self, id: &DocumentId, content: &Value) -> Result<u64> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        let result = crud
            .insert(vbucket, &id.key, &Self::encode(content), 0, MutateOptions::default(), self.deadline())
            .await?;
        Ok(result.cas)
    }

    async fn replace_staged(&self, id: &DocumentId, cas: u64, content: &Value) -> Result<u64> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        let opts = MutateOptions { cas, ..Default::default() };
        let result = crud.replace(vbucket, &id.key, &Self::encode(content), 0, opts, self.deadline()).await?;
        Ok(result.cas)
    }

    async fn remove_staged(&self, id: &DocumentId, cas: u64) -> Result<u64> {
        // A staged remove keeps the original body in place and only records
        // intent in the attempt's own queue until commit; no KV write yet.
        let _ = (id, cas);
        Ok(cas)
    }

    async fn commit_insert(&self, id: &DocumentId, content: &Value) -> Result<()> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        crud.upsert(vbucket, &id.key, &Self::encode(content), 0, MutateOptions::default(), self.deadline())
            .await?;
        Ok(())
    }

    async fn commit_replace(&self, id: &DocumentId, content: &Value) -> Result<()> {
        self.commit_insert(id, content).await
    }

    async fn commit_remove(&self, id: &DocumentId, cas: u64) -> Result<()> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        crud.remove(vbucket, &id.key, cas, self.deadline()).await?;
        Ok(())
    }

    async fn rollback_insert(&self, id: &DocumentId, cas: u64) -> Result<()> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        match crud.remove(vbucket, &id.key, cas, self.deadline()).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::DocumentNotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rollback_replace_or_remove(&self, id: &DocumentId, cas: u64, original_content: &Value) -> Result<()> {
        let (session, vbucket) = self.session_for(id).await?;
        let crud = CrudComponent::new(&session);
        let opts = MutateOptions { cas, ..Default::default() };
        crud.replace(vbucket, &id.key, &Self::encode(original_content), 0, opts, self.deadline())
            .await?;
        Ok(())
    }

    async fn write_atr_field(&self, atr_id: &DocumentId, path: &str, value: &Value) -> Result<()> {
        let (session, vbucket) = self.session_for(atr_id).await?;
        let crud = CrudComponent::new(&session);
        let encoded = Self::encode(value);
        crud.mutate_in(vbucket, &atr_id.key, &[(path, &encoded)], MutateOptions::default(), self.deadline())
            .await?;
        Ok(())
    }

    async fn read_atr(&self, atr_id: &DocumentId) -> Result<Option<Value>> {
        match self.get(atr_id).await? {
            Some(doc) => Ok(Some(doc.content)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_json_body() {
        let value = serde_json::json!({"v": 1, "name": "k1"});
        let bytes = KvDocumentStore::encode(&value);
        let decoded = KvDocumentStore::decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
