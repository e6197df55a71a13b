//! AgentGroup: the cluster-wide handle. Owns the shared KV/HTTP pools and a
//! table of per-bucket `Agent`s, opened lazily and closed together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::agent::{Agent, AgentConfig};
use crate::connstring::ConnectionString;
use crate::diagnostics::{self, EndpointState, PingEndpoint, PingReport};
use crate::error::{Error, ErrorKind, Result};
use crate::http::{HttpConnectionManager, HttpPoolConfig};
use crate::kv::{opcode, Credentials, Frame, KvConnectionPool, KvPoolConfig};

/// Shared, cluster-wide state every bucket's `Agent` borrows: the
/// connection pools, bootstrap hosts, and default timeouts from the
/// connection string.
pub struct AgentGroup {
    kv_pool: Arc<KvConnectionPool>,
    http: Arc<HttpConnectionManager>,
    management_remote: SocketAddr,
    kv_timeout: Duration,
    http_timeout: Duration,
    credentials: Option<Credentials>,
    agents: Mutex<HashMap<String, Arc<Agent>>>,
}

impl AgentGroup {
    /// Builds a group from a parsed connection string. The first bootstrap
    /// host is used as the seed management endpoint; real topology then
    /// comes from whatever bootstraps each `Agent`'s cluster-config tracker.
    /// `credentials` is shared by every bucket this group opens.
    pub fn from_connection_string(config: &ConnectionString, credentials: Option<Credentials>) -> Result<Self> {
        let host = config
            .hosts
            .first()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "connection string has no hosts"))?;
        let port = host.port.unwrap_or(if config.tls { 18091 } else { 8091 });
        let management_remote: SocketAddr = format!("{}:{port}", host.host_name)
            .parse()
            .map_err(|_| Error::new(ErrorKind::ResolveFailure, "bootstrap host is not a literal address"))?;

        let kv_timeout = config.options.duration("kv_timeout")?.unwrap_or(Duration::from_secs(2));
        let http_timeout = config.options.duration("query_timeout")?.unwrap_or(Duration::from_secs(75));
        let max_http_connections = config
            .options
            .get("max_http_connections")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);

        Ok(AgentGroup {
            kv_pool: Arc::new(KvConnectionPool::new(KvPoolConfig {
                tls: config.tls,
                ..KvPoolConfig::default()
            })),
            http: Arc::new(HttpConnectionManager::new(HttpPoolConfig {
                max_connections_per_endpoint: max_http_connections,
            })),
            management_remote,
            kv_timeout,
            http_timeout,
            credentials,
            agents: Mutex::new(HashMap::new()),
        })
    }

    /// Opens (or returns the already-open) agent for `bucket`.
    pub async fn open_bucket(&self, bucket: &str) -> Arc<Agent> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get(bucket) {
            return agent.clone();
        }
        let agent = Arc::new(Agent::new(
            AgentConfig {
                bucket: bucket.to_string(),
                kv_timeout: self.kv_timeout,
                http_timeout: self.http_timeout,
                credentials: self.credentials.clone(),
            },
            self.kv_pool.clone(),
            self.http.clone(),
            self.management_remote,
        ));
        agents.insert(bucket.to_string(), agent.clone());
        agent
    }

    pub async fn get_agent(&self, bucket: &str) -> Option<Arc<Agent>> {
        self.agents.lock().await.get(bucket).cloned()
    }

    pub async fn close_bucket(&self, bucket: &str) {
        if let Some(agent) = self.agents.lock().await.remove(bucket) {
            agent.cancel_outstanding();
        }
    }

    /// Tears the whole group down: cancels every outstanding op on every
    /// open agent, then drops them. Connections already checked out by a
    /// canceled op are returned to their pool by the op's own cleanup.
    pub async fn close(&self) {
        let mut agents = self.agents.lock().await;
        for agent in agents.values() {
            agent.cancel_outstanding();
        }
        agents.clear();
    }

    /// Waits for every open agent to have a cluster-config snapshot, or
    /// until `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let agents: Vec<Arc<Agent>> = self.agents.lock().await.values().cloned().collect();
            let all_ready = agents.iter().all(|agent| agent.cluster_config().is_ok());
            if all_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::new(ErrorKind::UnambiguousTimeout, "cluster did not become ready in time"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// One entry per open bucket whose cluster-config snapshot has arrived;
    /// buckets still bootstrapping are omitted rather than reported with
    /// placeholder state.
    pub async fn diagnostics(&self, client_id: &str, sdk: &str) -> diagnostics::DiagnosticsReport {
        let mut report = diagnostics::DiagnosticsReport::new(client_id, sdk);
        for (bucket, agent) in self.agents.lock().await.iter() {
            let Ok(cluster) = agent.cluster_config() else { continue };
            for node in &cluster.nodes {
                let (host, ports) = node.effective_address(&cluster.network);
                let Some(port) = ports.kv_plain else { continue };
                report.add_endpoint(
                    crate::common::ServiceType::Kv,
                    diagnostics::DiagnosticsEndpoint {
                        id: node.node_uuid.clone(),
                        remote: format!("{host}:{port}"),
                        local: String::new(),
                        state: EndpointState::Connected,
                        namespace: Some(bucket.clone()),
                        last_activity_us: 0,
                    },
                );
            }
        }
        report
    }

    /// Like `diagnostics()` but performs a real KV `NOOP` round trip against
    /// every known node of every open bucket, recording latency or the
    /// error each probe failed with.
    pub async fn ping(&self, client_id: &str, sdk: &str) -> PingReport {
        let mut report = PingReport::new(client_id, sdk);
        let buckets: Vec<(String, Arc<Agent>)> = self.agents.lock().await.iter().map(|(b, a)| (b.clone(), a.clone())).collect();
        for (bucket, agent) in buckets {
            let Ok(cluster) = agent.cluster_config() else { continue };
            for node in &cluster.nodes {
                let Some((host, port)) = cluster.kv_endpoint_for_node(node, self.kv_pool.is_tls()) else { continue };
                let endpoint = self.ping_kv_node(&bucket, &host, port, node.node_uuid.clone()).await;
                report.add_endpoint(crate::common::ServiceType::Kv, endpoint);
            }
        }
        report
    }

    async fn ping_kv_node(&self, bucket: &str, host: &str, port: u16, node_id: String) -> PingEndpoint {
        let remote = format!("{host}:{port}");
        let started = Instant::now();
        let session = match self.kv_pool.acquire(host, port, Some(bucket), self.credentials.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                return PingEndpoint {
                    id: node_id,
                    remote,
                    local: String::new(),
                    state: EndpointState::Disconnected,
                    namespace: Some(bucket.to_string()),
                    latency_us: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let deadline = tokio::time::Instant::now() + self.kv_timeout;
        let frame = Frame::request(opcode::NOOP, 0, 0);
        match session.call(frame, deadline).await {
            Ok(_) => PingEndpoint {
                id: node_id,
                remote,
                local: String::new(),
                state: EndpointState::Connected,
                namespace: Some(bucket.to_string()),
                latency_us: Some(started.elapsed().as_micros() as u64),
                error: None,
            },
            Err(e) => PingEndpoint {
                id: node_id,
                remote,
                local: String::new(),
                state: EndpointState::Disconnected,
                namespace: Some(bucket.to_string()),
                latency_us: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ConnectionString {
        crate::connstring::parse(s).unwrap()
    }

    #[tokio::test]
    async fn opening_the_same_bucket_twice_returns_the_same_agent() {
        let group = AgentGroup::from_connection_string(&parse("couchbase://127.0.0.1"), None).unwrap();
        let a = group.open_bucket("travel-sample").await;
        let b = group.open_bucket("travel-sample").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn closing_a_bucket_drops_its_agent() {
        let group = AgentGroup::from_connection_string(&parse("couchbase://127.0.0.1"), None).unwrap();
        group.open_bucket("travel-sample").await;
        group.close_bucket("travel-sample").await;
        assert!(group.get_agent("travel-sample").await.is_none());
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_when_no_config_has_been_published() {
        let group = AgentGroup::from_connection_string(&parse("couchbase://127.0.0.1"), None).unwrap();
        group.open_bucket("travel-sample").await;
        let result = group.wait_until_ready(Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_drops_every_open_agent() {
        let group = AgentGroup::from_connection_string(&parse("couchbase://127.0.0.1"), None).unwrap();
        group.open_bucket("travel-sample").await;
        group.open_bucket("beer-sample").await;
        group.close().await;
        assert!(group.get_agent("travel-sample").await.is_none());
        assert!(group.get_agent("beer-sample").await.is_none());
    }

    #[tokio::test]
    async fn ping_with_no_ready_buckets_returns_an_empty_report() {
        let group = AgentGroup::from_connection_string(&parse("couchbase://127.0.0.1"), None).unwrap();
        group.open_bucket("travel-sample").await;
        let report = group.ping("client-1", "couchdoc-rs/0.1.0").await;
        assert!(report.services.is_empty());
    }
}
