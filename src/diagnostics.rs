//! `diagnostics()`/`ping()` report shapes: bit-exact JSON describing every
//! known or probed endpoint, grouped by service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::ServiceType;

pub const REPORT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Connected,
    Connecting,
    Disconnected,
    Authenticating,
}

/// One endpoint's entry in a `diagnostics()` report: no I/O performed, just
/// a snapshot of the pool's last-known state for that session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsEndpoint {
    pub id: String,
    pub remote: String,
    pub local: String,
    pub state: EndpointState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub last_activity_us: u64,
}

/// One endpoint's entry in a `ping()` report: the result of an active
/// round trip against that endpoint, or the error it failed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingEndpoint {
    pub id: String,
    pub remote: String,
    pub local: String,
    pub state: EndpointState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub version: u32,
    pub id: String,
    pub sdk: String,
    pub services: HashMap<String, Vec<DiagnosticsEndpoint>>,
}

impl DiagnosticsReport {
    pub fn new(id: impl Into<String>, sdk: impl Into<String>) -> Self {
        DiagnosticsReport {
            version: REPORT_VERSION,
            id: id.into(),
            sdk: sdk.into(),
            services: HashMap::new(),
        }
    }

    pub fn add_endpoint(&mut self, service: ServiceType, endpoint: DiagnosticsEndpoint) {
        self.services.entry(service.as_json_key().to_string()).or_default().push(endpoint);
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("DiagnosticsReport always serializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReport {
    pub version: u32,
    pub id: String,
    pub sdk: String,
    pub services: HashMap<String, Vec<PingEndpoint>>,
}

impl PingReport {
    pub fn new(id: impl Into<String>, sdk: impl Into<String>) -> Self {
        PingReport {
            version: REPORT_VERSION,
            id: id.into(),
            sdk: sdk.into(),
            services: HashMap::new(),
        }
    }

    pub fn add_endpoint(&mut self, service: ServiceType, endpoint: PingEndpoint) {
        self.services.entry(service.as_json_key().to_string()).or_default().push(endpoint);
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("PingReport always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_groups_endpoints_under_lowercase_service_keys() {
        let mut report = DiagnosticsReport::new("client-1", "couchdoc-rs/0.1.0");
        report.add_endpoint(
            ServiceType::Kv,
            DiagnosticsEndpoint {
                id: "ep-1".into(),
                remote: "10.0.0.1:11210".into(),
                local: "10.0.0.5:54321".into(),
                state: EndpointState::Connected,
                namespace: Some("travel-sample".into()),
                last_activity_us: 42,
            },
        );
        let json = report.to_json();
        assert_eq!(json["version"], 2);
        assert_eq!(json["services"]["kv"][0]["id"], "ep-1");
        assert!(json["services"]["kv"][0].get("namespace").is_some());
    }

    #[test]
    fn ping_entry_without_error_omits_the_error_field() {
        let mut report = PingReport::new("client-1", "couchdoc-rs/0.1.0");
        report.add_endpoint(
            ServiceType::Query,
            PingEndpoint {
                id: "ep-2".into(),
                remote: "10.0.0.1:8093".into(),
                local: "10.0.0.5:54322".into(),
                state: EndpointState::Connected,
                namespace: None,
                latency_us: Some(1200),
                error: None,
            },
        );
        let json = report.to_json();
        assert!(json["services"]["query"][0].get("error").is_none());
        assert!(json["services"]["query"][0].get("namespace").is_none());
    }

    #[test]
    fn serialize_parse_serialize_is_a_fixed_point() {
        let mut report = DiagnosticsReport::new("client-1", "couchdoc-rs/0.1.0");
        report.add_endpoint(
            ServiceType::Kv,
            DiagnosticsEndpoint {
                id: "ep-1".into(),
                remote: "10.0.0.1:11210".into(),
                local: "10.0.0.5:54321".into(),
                state: EndpointState::Connected,
                namespace: None,
                last_activity_us: 7,
            },
        );
        let first = report.to_json();
        let reparsed: DiagnosticsReport = serde_json::from_value(first.clone()).unwrap();
        assert_eq!(reparsed.to_json(), first);
    }
}
