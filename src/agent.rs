//! Agent: the per-bucket facade owning CRUD, the collections resolver, and
//! the sessions needed to reach every service for one bucket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::cluster_config::{ClusterConfig, ClusterConfigTracker};
use crate::collections::{CollectionIdFetcher, CollectionsResolver};
use crate::columnar::{ColumnarQueryOptions, ColumnarService};
use crate::common::{DocumentId, ServiceType};
use crate::crud::{CrudComponent, GetResult, MutateOptions, MutationResult};
use crate::error::{Error, ErrorKind, Result};
use crate::http::HttpConnectionManager;
use crate::kv::{Credentials, KvConnectionPool, KvSession};
use crate::pending_op::{OpHandle, PendingOp};
use crate::range_scan::{self, RangeScan, RangeScanBounds, RangeScanOptions};
use crate::retry::{call_with_retry, BackoffPolicy};
use crate::services::analytics::{AnalyticsOptions, AnalyticsService};
use crate::services::query::{QueryOptions, QueryService};
use crate::services::search::{SearchOptions, SearchService};
use crate::services::views::{ViewOptions, ViewsService};
use crate::services::RowResultStream;
use crate::transactions::{self, AttemptContext, DocumentStore, KvDocumentStore, TransactionOperationFailed, TransactionResult, TransactionsConfig};

/// Resolves a `(scope, collection)` pair against the bucket's management
/// endpoint. A thin adapter onto `CollectionIdFetcher` so `CollectionsResolver`
/// doesn't need to know anything about HTTP.
struct ManagementCollectionFetcher {
    http: Arc<HttpConnectionManager>,
    remote: SocketAddr,
    bucket: String,
}

#[async_trait::async_trait]
impl CollectionIdFetcher for ManagementCollectionFetcher {
    async fn fetch(&self, scope: &str, collection: &str) -> Result<u32> {
        let path = format!("/pools/default/buckets/{}/scopes/{scope}/collections/{collection}", self.bucket);
        let mut session = self.http.checkout(ServiceType::Management, self.remote).await?;
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let request = crate::http::HttpRequest::get(&path);
        let head = session.send(request, tx).await?;
        self.http.check_in(ServiceType::Management, self.remote, session).await;
        if head.status >= 400 {
            return Err(Error::new(ErrorKind::CollectionNotFound, format!("collection lookup returned HTTP {}", head.status)));
        }
        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk?);
        }
        let json: Value = serde_json::from_slice(&body)?;
        let uid = json
            .get("uid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::DecodingFailure, "collection response missing uid"))?;
        u32::from_str_radix(uid.trim_start_matches("0x"), 16)
            .map_err(|e| Error::new(ErrorKind::DecodingFailure, e.to_string()))
    }
}

pub struct AgentConfig {
    pub bucket: String,
    pub kv_timeout: Duration,
    pub http_timeout: Duration,
    pub credentials: Option<Credentials>,
}

/// Per-bucket facade: the single owning handle components borrow through.
pub struct Agent {
    config: AgentConfig,
    cluster: ClusterConfigTracker,
    kv_pool: Arc<KvConnectionPool>,
    http: Arc<HttpConnectionManager>,
    collections: CollectionsResolver,
    transactions_config: TransactionsConfig,
    retry_backoff: BackoffPolicy,
    /// Every op this agent has dispatched and not yet seen complete;
    /// `AgentGroup::close()` walks this to cancel outstanding work instead
    /// of leaving it to time out on its own.
    outstanding: std::sync::Mutex<Vec<PendingOp>>,
}

impl Agent {
    pub fn new(config: AgentConfig, kv_pool: Arc<KvConnectionPool>, http: Arc<HttpConnectionManager>, management_remote: SocketAddr) -> Self {
        let fetcher = Arc::new(ManagementCollectionFetcher {
            http: http.clone(),
            remote: management_remote,
            bucket: config.bucket.clone(),
        });
        Agent {
            collections: CollectionsResolver::new(fetcher, 1024),
            config,
            cluster: ClusterConfigTracker::new(),
            kv_pool,
            http,
            transactions_config: TransactionsConfig::default(),
            retry_backoff: BackoffPolicy::default(),
            outstanding: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Publishes a freshly bootstrapped or server-pushed topology snapshot.
    pub fn publish_cluster_config(&self, config: ClusterConfig, force: bool) -> bool {
        self.cluster.publish(config, force)
    }

    pub fn cluster_config(&self) -> Result<Arc<ClusterConfig>> {
        self.cluster
            .current()
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no cluster-config snapshot yet"))
    }

    async fn session_for_key(&self, key: &[u8]) -> Result<(KvSession, u16)> {
        let cluster = self.cluster_config()?;
        let vbucket = cluster
            .vbucket_for_key(key)
            .ok_or_else(|| Error::new(ErrorKind::InternalServerFailure, "cluster snapshot has no vbucket map"))?;
        self.session_for_vbucket(&cluster, vbucket).await
    }

    /// Picks an arbitrary vbucket this agent can reach, for operations like
    /// `random_get` that address a node rather than a specific key.
    async fn session_for_any(&self) -> Result<(KvSession, u16)> {
        let cluster = self.cluster_config()?;
        let map = cluster
            .vbucket_map
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InternalServerFailure, "cluster snapshot has no vbucket map"))?;
        let vbucket = map
            .iter()
            .position(|(primary, _)| primary.is_some())
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no vbucket has an owning node"))? as u16;
        self.session_for_vbucket(&cluster, vbucket).await
    }

    async fn session_for_vbucket(&self, cluster: &ClusterConfig, vbucket: u16) -> Result<(KvSession, u16)> {
        let node = cluster
            .node_for_vbucket(vbucket)
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no owning node for vbucket"))?;
        let (host, port) = cluster
            .kv_endpoint_for_node(node, self.kv_pool.is_tls())
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "node has no usable address"))?;
        let session = self
            .kv_pool
            .acquire(&host, port, Some(&self.config.bucket), self.config.credentials.as_ref())
            .await?;
        Ok((session, vbucket))
    }

    fn deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.config.kv_timeout
    }

    /// Wraps a future as an `OpHandle`: spawns it racing the handle's own
    /// cancellation, registers it so `cancel_outstanding()` can reach it
    /// while it's still in flight, and guarantees the handle's receiver is
    /// fed exactly once regardless of which side wins the race.
    fn dispatch<T, Fut>(&self, fut: Fut) -> OpHandle<T>
    where
        T: Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let pending = PendingOp::new();
        pending.mark_dispatched();
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.retain(|op| !matches!(op.state(), crate::pending_op::OpState::Completed | crate::pending_op::OpState::Canceled));
            outstanding.push(pending.clone());
        }

        let (tx, rx) = oneshot::channel();
        let task_pending = pending.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_pending.canceled() => {
                    if task_pending.try_mark_completed() {
                        let _ = tx.send(Err(Error::new(ErrorKind::RequestCanceled, "operation canceled")));
                    }
                }
                result = fut => {
                    if task_pending.try_mark_completed() {
                        let _ = tx.send(result);
                    }
                }
            }
        });
        OpHandle::new(pending, rx)
    }

    /// Cancels every operation this agent has dispatched that hasn't
    /// completed yet. Used by `AgentGroup::close()`.
    pub fn cancel_outstanding(&self) {
        let outstanding = self.outstanding.lock().unwrap();
        for op in outstanding.iter() {
            op.cancel();
        }
    }

    pub async fn resolve_collection(&self, scope: &str, collection: &str) -> Result<u32> {
        self.collections.resolve(scope, collection).await
    }

    pub async fn get(&self, key: &[u8]) -> Result<OpHandle<GetResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).get(vbucket, &key, deadline).await }
            })
            .await
        }))
    }

    pub async fn get_and_lock(&self, key: &[u8], lock_time: Duration) -> Result<OpHandle<GetResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).get_and_lock(vbucket, &key, lock_time, deadline).await }
            })
            .await
        }))
    }

    pub async fn get_and_touch(&self, key: &[u8], expiry: Duration) -> Result<OpHandle<GetResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).get_and_touch(vbucket, &key, expiry, deadline).await }
            })
            .await
        }))
    }

    pub async fn touch(&self, key: &[u8], expiry: Duration) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).touch(vbucket, &key, expiry, deadline).await }
            })
            .await
        }))
    }

    pub async fn unlock(&self, key: &[u8], cas: u64) -> Result<OpHandle<()>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).unlock(vbucket, &key, cas, deadline).await }
            })
            .await
        }))
    }

    pub async fn upsert(&self, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).upsert(vbucket, &key, &value, flags, opts, deadline).await }
            })
            .await
        }))
    }

    pub async fn insert(&self, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            // Not idempotent: a blind retry of a document-creating op could
            // double-fire against a server that actually applied the first
            // attempt but dropped the reply.
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).insert(vbucket, &key, &value, flags, opts, deadline).await }
            })
            .await
        }))
    }

    pub async fn replace(&self, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).replace(vbucket, &key, &value, flags, opts, deadline).await }
            })
            .await
        }))
    }

    pub async fn remove(&self, key: &[u8], cas: u64) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).remove(vbucket, &key, cas, deadline).await }
            })
            .await
        }))
    }

    pub async fn append(&self, key: &[u8], value: &[u8], opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            // Appending twice produces a visibly different document, so a
            // retry is only safe when the caller has its own dedup (cas).
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).append(vbucket, &key, &value, opts, deadline).await }
            })
            .await
        }))
    }

    pub async fn prepend(&self, key: &[u8], value: &[u8], opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).prepend(vbucket, &key, &value, opts, deadline).await }
            })
            .await
        }))
    }

    pub async fn increment(&self, key: &[u8], delta: u64, initial: u64, expiry: Duration) -> Result<OpHandle<(u64, MutationResult)>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            // A blindly-retried counter bump could apply twice; counters
            // only retry on conditions the retry engine already treats as
            // safe regardless (timeouts, not-found), so idempotent=false.
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).increment(vbucket, &key, delta, initial, expiry, deadline).await }
            })
            .await
        }))
    }

    pub async fn decrement(&self, key: &[u8], delta: u64, initial: u64, expiry: Duration) -> Result<OpHandle<(u64, MutationResult)>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).decrement(vbucket, &key, delta, initial, expiry, deadline).await }
            })
            .await
        }))
    }

    pub async fn lookup_in(&self, key: &[u8], paths: &[&str]) -> Result<OpHandle<Vec<(u16, Bytes)>>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                let paths = paths.clone();
                async move {
                    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
                    CrudComponent::new(&session).lookup_in(vbucket, &key, &refs, deadline).await
                }
            })
            .await
        }))
    }

    pub async fn mutate_in(&self, key: &[u8], fragments: &[(&str, &[u8])], opts: MutateOptions) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let fragments: Vec<(String, Vec<u8>)> = fragments.iter().map(|(p, v)| (p.to_string(), v.to_vec())).collect();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, false, || {
                let session = session.clone();
                let key = key.clone();
                let fragments = fragments.clone();
                async move {
                    let refs: Vec<(&str, &[u8])> = fragments.iter().map(|(p, v)| (p.as_str(), v.as_slice())).collect();
                    CrudComponent::new(&session).mutate_in(vbucket, &key, &refs, opts, deadline).await
                }
            })
            .await
        }))
    }

    pub async fn observe(&self, key: &[u8]) -> Result<OpHandle<(u8, u64)>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).observe(vbucket, &key, deadline).await }
            })
            .await
        }))
    }

    pub async fn get_with_meta(&self, key: &[u8]) -> Result<OpHandle<(GetResult, u32, u64)>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                async move { CrudComponent::new(&session).get_with_meta(vbucket, &key, deadline).await }
            })
            .await
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn set_with_meta(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiry: Duration,
        revision_seqno: u64,
        cas: u64,
    ) -> Result<OpHandle<MutationResult>> {
        let (session, vbucket) = self.session_for_key(key).await?;
        let key = key.to_vec();
        let value = value.to_vec();
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                let key = key.clone();
                let value = value.clone();
                async move { CrudComponent::new(&session).set_with_meta(vbucket, &key, &value, flags, expiry, revision_seqno, cas, deadline).await }
            })
            .await
        }))
    }

    pub async fn random_get(&self) -> Result<OpHandle<(Bytes, GetResult)>> {
        let (session, vbucket) = self.session_for_any().await?;
        let deadline = self.deadline();
        let policy = self.retry_backoff;
        Ok(self.dispatch(async move {
            call_with_retry(policy, true, || {
                let session = session.clone();
                async move { CrudComponent::new(&session).random_get(vbucket, deadline).await }
            })
            .await
        }))
    }

    fn remote_for(&self, service: ServiceType) -> Result<SocketAddr> {
        let cluster = self.cluster_config()?;
        let node = cluster.nodes.first().ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no nodes in cluster snapshot"))?;
        let (host, ports) = node.effective_address(&cluster.network);
        let port = match service {
            ServiceType::Query | ServiceType::Analytics | ServiceType::Search | ServiceType::Views => ports.query_plain,
            ServiceType::Management => ports.management_plain,
            _ => None,
        }
        .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "node has no port for this service"))?;
        format!("{host}:{port}")
            .parse()
            .map_err(|_| Error::new(ErrorKind::ResolveFailure, "service endpoint is not a literal socket address"))
    }

    pub async fn query(&self, statement: &str, options: QueryOptions) -> Result<RowResultStream> {
        let remote = self.remote_for(ServiceType::Query)?;
        QueryService::new(self.http.clone(), remote).execute(statement, options).await
    }

    pub async fn analytics(&self, statement: &str, options: AnalyticsOptions) -> Result<RowResultStream> {
        let remote = self.remote_for(ServiceType::Analytics)?;
        AnalyticsService::new(self.http.clone(), remote).execute(statement, options).await
    }

    pub async fn search(&self, index: &str, query: Value, options: SearchOptions) -> Result<RowResultStream> {
        let remote = self.remote_for(ServiceType::Search)?;
        SearchService::new(self.http.clone(), remote).execute(index, query, options).await
    }

    pub async fn views(&self, design_doc: &str, view: &str, options: ViewOptions) -> Result<RowResultStream> {
        let remote = self.remote_for(ServiceType::Views)?;
        ViewsService::new(self.http.clone(), remote).execute(design_doc, view, options).await
    }

    pub async fn columnar(&self, statement: &str, options: ColumnarQueryOptions) -> std::result::Result<RowResultStream, crate::columnar::ColumnarError> {
        let remote = self.remote_for(ServiceType::Analytics).map_err(|e| crate::columnar::from_core_error(&e))?;
        ColumnarService::new(self.http.clone(), remote).execute(statement, options).await
    }

    pub async fn range_scan(&self, bounds: RangeScanBounds, options: RangeScanOptions) -> Result<RangeScan> {
        let cluster = self.cluster_config()?;
        range_scan::scan(cluster, self.kv_pool.clone(), &self.config.bucket, self.config.credentials.as_ref(), bounds, options).await
    }

    fn document_store(&self) -> Result<Arc<dyn DocumentStore>> {
        let cluster = self.cluster_config()?;
        Ok(Arc::new(KvDocumentStore::new(
            cluster,
            self.kv_pool.clone(),
            self.config.bucket.clone(),
            self.config.credentials.clone(),
            self.config.http_timeout,
        )))
    }

    pub fn document_id(&self, key: impl Into<Vec<u8>>) -> DocumentId {
        DocumentId::new(self.config.bucket.clone(), key.into())
    }

    /// Runs `lambda` under ACID semantics against this bucket.
    pub async fn transaction<F, Fut>(&self, lambda: F) -> TransactionResult
    where
        F: FnMut(&mut AttemptContext) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), TransactionOperationFailed>>,
    {
        let store = match self.document_store() {
            Ok(store) => store,
            Err(e) => return TransactionResult::Failed(TransactionOperationFailed::from(e)),
        };
        transactions::run(store, &self.config.bucket, &self.transactions_config, lambda).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_scoped_to_the_agent_s_bucket() {
        let config = AgentConfig {
            bucket: "travel-sample".into(),
            kv_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(30),
            credentials: None,
        };
        let agent = Agent::new(config, Arc::new(KvConnectionPool::new(Default::default())), Arc::new(HttpConnectionManager::new(Default::default())), "127.0.0.1:8091".parse().unwrap());
        let id = agent.document_id(b"k1".to_vec());
        assert_eq!(id.bucket, "travel-sample");
        assert_eq!(id.key, b"k1");
    }
}
