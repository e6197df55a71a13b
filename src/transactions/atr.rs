//! Active Transaction Record field names and the per-attempt row shape.
//!
//! Field names are kept short on the wire (matching the server's own ATR
//! document layout) to reduce the chance of the ATR document overflowing
//! the value-size limit; human-readable names only exist at this layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELD_ATTEMPTS: &str = "attempts";
pub const FIELD_STATUS: &str = "st";
pub const FIELD_START_TIMESTAMP: &str = "tst";
pub const FIELD_EXPIRES_AFTER_MSECS: &str = "exp";
pub const FIELD_START_COMMIT: &str = "tsc";
pub const FIELD_TIMESTAMP_COMPLETE: &str = "tsco";
pub const FIELD_TIMESTAMP_ROLLBACK_START: &str = "tsrs";
pub const FIELD_TIMESTAMP_ROLLBACK_COMPLETE: &str = "tsrc";
pub const FIELD_DOCS_INSERTED: &str = "ins";
pub const FIELD_DOCS_REPLACED: &str = "rep";
pub const FIELD_DOCS_REMOVED: &str = "rem";

pub const XATTR_TXN_ID: &str = "txn.id.txn";
pub const XATTR_ATTEMPT_ID: &str = "txn.id.atmpt";
pub const XATTR_ATR_ID: &str = "txn.atr.id";
pub const XATTR_ATR_BUCKET: &str = "txn.atr.bkt";
pub const XATTR_ATR_COLL: &str = "txn.atr.coll";
pub const XATTR_STAGED_DATA: &str = "txn.op.stgd";
pub const XATTR_OP_TYPE: &str = "txn.op.type";
pub const XATTR_CRC32: &str = "txn.op.crc32";

/// Status of one attempt row inside an ATR document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtrStatus {
    Pending,
    Committing,
    Committed,
    Aborting,
    RolledBack,
    Completed,
}

/// A `(bucket, scope, collection, key)` record referencing a document staged
/// by a transaction attempt, stored inside the ATR's `ins`/`rep`/`rem` lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub bkt: String,
    pub scp: String,
    pub col: String,
    pub id: String,
}

impl DocRecord {
    pub fn new(bucket: impl Into<String>, scope: impl Into<String>, collection: impl Into<String>, key: impl Into<String>) -> Self {
        DocRecord {
            bkt: bucket.into(),
            scp: scope.into(),
            col: collection.into(),
            id: key.into(),
        }
    }
}

/// One attempt row as written into the ATR document's `attempts` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrEntry {
    pub st: AtrStatus,
    pub tst: u64,
    pub exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsco: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsrs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsrc: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ins: Vec<DocRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rep: Vec<DocRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rem: Vec<DocRecord>,
}

impl AtrEntry {
    pub fn pending(expires_after_msecs: u64, now_msecs: u64) -> Self {
        AtrEntry {
            st: AtrStatus::Pending,
            tst: now_msecs,
            exp: expires_after_msecs,
            tsc: None,
            tsco: None,
            tsrs: None,
            tsrc: None,
            ins: Vec::new(),
            rep: Vec::new(),
            rem: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("AtrEntry always serializes")
    }
}

/// Path of one attempt's entry inside the ATR document, for subdoc addressing.
pub fn attempt_path(attempt_id: &str, field: &str) -> String {
    format!("{FIELD_ATTEMPTS}.{attempt_id}.{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_entry_serializes_without_optional_timestamps() {
        let entry = AtrEntry::pending(15_000, 1_000);
        let json = entry.to_json();
        assert_eq!(json["st"], "pending");
        assert!(json.get("tsc").is_none());
    }

    #[test]
    fn attempt_path_nests_under_attempts_map() {
        assert_eq!(attempt_path("a1", FIELD_STATUS), "attempts.a1.st");
    }
}
