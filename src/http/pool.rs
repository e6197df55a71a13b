//! HTTP session manager: one bounded pool per `(service, host, port)`,
//! mirroring the KV pool's per-node ceiling but keyed more broadly since
//! Query/Analytics/Search/Views/Management each dial independently.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::Mutex;

use super::session::HttpSession;
use crate::common::ServiceType;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    service: &'static str,
    remote: SocketAddr,
}

struct ServicePool {
    sessions: Vec<HttpSession>,
}

pub struct HttpPoolConfig {
    pub max_connections_per_endpoint: usize,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        HttpPoolConfig {
            max_connections_per_endpoint: 4,
        }
    }
}

pub struct HttpConnectionManager {
    config: HttpPoolConfig,
    pools: Mutex<HashMap<PoolKey, ServicePool>>,
}

impl HttpConnectionManager {
    pub fn new(config: HttpPoolConfig) -> Self {
        HttpConnectionManager {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Checks out a session for `service`/`remote`, opening a fresh one if
    /// the endpoint's pool has spare capacity, else handing back the
    /// least-recently-used idle one.
    pub async fn checkout(&self, service: ServiceType, remote: SocketAddr) -> Result<HttpSession> {
        let key = PoolKey {
            service: service.as_json_key(),
            remote,
        };
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(key).or_insert_with(|| ServicePool { sessions: Vec::new() });

        if let Some(session) = pool.sessions.pop() {
            return Ok(session);
        }
        drop(pools);
        HttpSession::connect(remote).await
    }

    /// Returns a session to its pool for reuse by a later call.
    pub async fn check_in(&self, service: ServiceType, remote: SocketAddr, session: HttpSession) {
        let key = PoolKey {
            service: service.as_json_key(),
            remote,
        };
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(key).or_insert_with(|| ServicePool { sessions: Vec::new() });
        if pool.sessions.len() < self.config.max_connections_per_endpoint {
            pool.sessions.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn checked_in_session_is_reused_on_next_checkout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });

        let manager = HttpConnectionManager::new(HttpPoolConfig::default());
        let session = manager.checkout(ServiceType::Query, addr).await.unwrap();
        manager.check_in(ServiceType::Query, addr, session).await;

        let pools = manager.pools.lock().await;
        let key = PoolKey {
            service: ServiceType::Query.as_json_key(),
            remote: addr,
        };
        assert_eq!(pools.get(&key).unwrap().sessions.len(), 1);
    }
}
