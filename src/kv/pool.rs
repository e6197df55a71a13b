//! Per-node connection pool: hands out shared `KvSession` handles, opening
//! new connections up to a configured ceiling and round-robining over the
//! idle ones that fit inside it. Generalizes the pooled-connection shape,
//! replacing blocking acquisition with an async mutex over the pool map.
//!
//! Keyed by `(host, port, bucket)` rather than a resolved `SocketAddr`:
//! two buckets on the same node authenticate and select-bucket
//! independently, so they cannot share a session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use super::auth::Credentials;
use super::session::{IpPreference, KvSession};
use crate::error::Result;

pub struct KvPoolConfig {
    pub max_connections_per_node: usize,
    pub ip_preference: IpPreference,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Whether every connection this pool dials negotiates TLS. A pool is
    /// either all-plain or all-TLS, matching `couchbase://` vs
    /// `couchbases://` for one bootstrap: nothing in this client mixes the
    /// two within one cluster connection.
    pub tls: bool,
}

impl Default for KvPoolConfig {
    fn default() -> Self {
        KvPoolConfig {
            max_connections_per_node: 1,
            ip_preference: IpPreference::Ipv4Preferred,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    host: String,
    port: u16,
    bucket: Option<String>,
}

struct NodePool {
    sessions: Vec<KvSession>,
    next: usize,
}

/// Round-robins over up to `max_connections_per_node` live sessions per
/// `(host, port, bucket)`, lazily dialing and authenticating new ones as
/// permits free up.
pub struct KvConnectionPool {
    config: KvPoolConfig,
    nodes: Mutex<HashMap<NodeKey, NodePool>>,
}

impl KvConnectionPool {
    pub fn new(config: KvPoolConfig) -> Self {
        KvConnectionPool {
            config,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.config.tls
    }

    pub async fn acquire(
        &self,
        host: &str,
        port: u16,
        bucket: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<KvSession> {
        let key = NodeKey {
            host: host.to_string(),
            port,
            bucket: bucket.map(|b| b.to_string()),
        };

        let mut nodes = self.nodes.lock().await;
        let pool = nodes.entry(key).or_insert_with(|| NodePool {
            sessions: Vec::new(),
            next: 0,
        });

        pool.sessions.retain(|s| !s.is_closed());

        if pool.sessions.len() < self.config.max_connections_per_node {
            let session = KvSession::connect(
                host,
                port,
                self.config.ip_preference,
                self.config.connect_timeout,
                self.config.handshake_timeout,
                credentials,
                bucket,
                self.config.tls,
            )
            .await?;
            pool.sessions.push(session.clone());
            return Ok(session);
        }

        let idx = pool.next % pool.sessions.len();
        pool.next = pool.next.wrapping_add(1);
        Ok(pool.sessions[idx].clone())
    }

    pub async fn evict_node(&self, host: &str, port: u16, bucket: Option<&str>) {
        let key = NodeKey {
            host: host.to_string(),
            port,
            bucket: bucket.map(|b| b.to_string()),
        };
        self.nodes.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn reuses_sessions_up_to_the_configured_ceiling() {
        let addr = echo_server().await;
        let pool = KvConnectionPool::new(KvPoolConfig {
            max_connections_per_node: 2,
            ..KvPoolConfig::default()
        });

        pool.acquire("127.0.0.1", addr.port(), None, None).await.unwrap();
        pool.acquire("127.0.0.1", addr.port(), None, None).await.unwrap();
        pool.acquire("127.0.0.1", addr.port(), None, None).await.unwrap();

        // Three acquires against a ceiling of two open at most two
        // connections, round-robining the third acquire onto an existing one.
        let nodes = self_node_count(&pool).await;
        assert_eq!(nodes, 2);
    }

    async fn self_node_count(pool: &KvConnectionPool) -> usize {
        let nodes = pool.nodes.lock().await;
        nodes.values().next().unwrap().sessions.len()
    }
}
