//! Shared data-model types used across components: document identity,
//! durability, service naming, and the request fingerprint.

use std::time::{Duration, Instant};

/// `(bucket, scope, collection, key)`. Scope/collection default to
/// `"_default"`; key is bytes, not necessarily UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: Vec<u8>,
}

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

impl DocumentId {
    pub fn new(bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        DocumentId {
            bucket: bucket.into(),
            scope: DEFAULT_SCOPE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            key: key.into(),
        }
    }

    pub fn with_collection(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        DocumentId {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }
}

/// Durability level for mutating KV ops and transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

/// Which cluster service a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Kv,
    Query,
    Analytics,
    Search,
    Views,
    Management,
    Eventing,
}

impl ServiceType {
    /// Lowercase key used in diagnostics/ping JSON.
    pub fn as_json_key(&self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::Query => "query",
            ServiceType::Analytics => "analytics",
            ServiceType::Search => "search",
            ServiceType::Views => "views",
            ServiceType::Management => "management",
            ServiceType::Eventing => "eventing",
        }
    }
}

/// Scan consistency requested for Query/Analytics/Search/Views requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanConsistency {
    #[default]
    NotBounded,
    RequestPlus,
}

/// Every pipelined call carries this fingerprint.
#[derive(Debug, Clone)]
pub struct RequestFingerprint {
    pub service: ServiceType,
    pub opcode: String,
    pub document_id: Option<DocumentId>,
    pub vbucket: Option<u16>,
    pub idempotent: bool,
    pub correlation_id: String,
    pub deadline: Instant,
    pub retry_count: u32,
}

impl RequestFingerprint {
    pub fn new(service: ServiceType, opcode: impl Into<String>, timeout: Duration) -> Self {
        RequestFingerprint {
            service,
            opcode: opcode.into(),
            document_id: None,
            vbucket: None,
            idempotent: true,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            deadline: Instant::now() + timeout,
            retry_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_defaults_scope_and_collection() {
        let id = DocumentId::new("travel-sample", b"airline_10".to_vec());
        assert_eq!(id.scope, DEFAULT_SCOPE);
        assert_eq!(id.collection, DEFAULT_COLLECTION);
    }

    #[test]
    fn fingerprint_expiry() {
        let fp = RequestFingerprint::new(ServiceType::Kv, "get", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(fp.is_expired());
    }
}
