//! The KV binary-protocol component: wire framing, one multiplexed session
//! per TCP connection, and a per-node connection pool.

mod auth;
mod codec;
pub mod features;
mod pool;
mod session;

pub use auth::{choose_mechanism, Credentials, SaslMechanism};
pub use codec::{Frame, KvCodec, RESPONSE_MAGIC};
pub use pool::{KvConnectionPool, KvPoolConfig};
pub use session::{IpPreference, KvSession};

/// Status codes this client distinguishes explicitly; everything else maps
/// to `InternalServerFailure`.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const NOT_STORED: u16 = 0x0005;
    pub const LOCKED: u16 = 0x0009;
    pub const NOT_LOCKED: u16 = 0x009c;
    pub const UNKNOWN_COLLECTION: u16 = 0x0088;
    pub const NOT_MY_VBUCKET: u16 = 0x0007;
    pub const DURABILITY_IMPOSSIBLE: u16 = 0x00a0;
    pub const SYNC_WRITE_AMBIGUOUS: u16 = 0x00a3;
    pub const RANGE_SCAN_MORE: u16 = 0x00a6;
    pub const RANGE_SCAN_COMPLETE: u16 = 0x00a7;
    pub const AUTH_ERROR: u16 = 0x0020;
    pub const AUTH_CONTINUE: u16 = 0x0021;
}

/// Opcodes for the operations the CRUD component drives.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const NOOP: u8 = 0x0a;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const TOUCH: u8 = 0x1c;
    pub const GAT: u8 = 0x1d;
    pub const SASL_LIST_MECHS: u8 = 0x20;
    pub const SASL_AUTH: u8 = 0x21;
    pub const SASL_STEP: u8 = 0x22;
    pub const HELLO: u8 = 0x1f;
    pub const GET_LOCKED: u8 = 0x94;
    pub const UNLOCK: u8 = 0x95;
    pub const OBSERVE: u8 = 0x92;
    pub const GET_META: u8 = 0xa0;
    pub const SET_WITH_META: u8 = 0xa2;
    pub const SUBDOC_LOOKUP: u8 = 0xd0;
    pub const SUBDOC_MUTATE: u8 = 0xd1;
    pub const RANGE_SCAN_CREATE: u8 = 0xda;
    pub const RANGE_SCAN_CONTINUE: u8 = 0xdb;
    pub const RANGE_SCAN_CANCEL: u8 = 0xdc;
    pub const SELECT_BUCKET: u8 = 0x89;
    pub const RANDOM_GET: u8 = 0xb6;
}

/// Maps a response status code to the client's flat error taxonomy, used
/// by the CRUD and range-scan components after every KV round trip.
pub fn status_to_error_kind(status: u16) -> Option<crate::error::ErrorKind> {
    use crate::error::ErrorKind;
    match status {
        self::status::SUCCESS => None,
        self::status::KEY_NOT_FOUND => Some(ErrorKind::DocumentNotFound),
        self::status::KEY_EXISTS => Some(ErrorKind::DocumentExists),
        self::status::VALUE_TOO_LARGE => Some(ErrorKind::ValueTooLarge),
        self::status::NOT_STORED => Some(ErrorKind::DocumentNotFound),
        self::status::LOCKED => Some(ErrorKind::DocumentLocked),
        self::status::NOT_LOCKED => Some(ErrorKind::DocumentNotLocked),
        self::status::UNKNOWN_COLLECTION => Some(ErrorKind::CollectionNotFound),
        self::status::NOT_MY_VBUCKET => Some(ErrorKind::ServiceNotAvailable),
        self::status::DURABILITY_IMPOSSIBLE => Some(ErrorKind::DurabilityImpossible),
        self::status::SYNC_WRITE_AMBIGUOUS => Some(ErrorKind::DurabilityAmbiguous),
        self::status::RANGE_SCAN_COMPLETE => Some(ErrorKind::RangeScanCompleted),
        self::status::AUTH_ERROR => Some(ErrorKind::AuthenticationFailure),
        _ => Some(ErrorKind::InternalServerFailure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_my_vbucket_to_a_retryable_kind() {
        assert_eq!(
            status_to_error_kind(status::NOT_MY_VBUCKET),
            Some(crate::error::ErrorKind::ServiceNotAvailable)
        );
    }

    #[test]
    fn success_maps_to_no_error() {
        assert_eq!(status_to_error_kind(status::SUCCESS), None);
    }
}
