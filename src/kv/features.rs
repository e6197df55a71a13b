//! HELLO feature negotiation. The wire format is a flat list of big-endian
//! `u16` feature codes in both directions; `KvFeatures` is just this
//! client's in-memory view of whichever subset the server echoed back.

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KvFeatures: u32 {
        const MUTATION_SEQNO = 1 << 0;
        const XATTR = 1 << 1;
        const XERROR = 1 << 2;
        const SELECT_BUCKET = 1 << 3;
        const SNAPPY = 1 << 4;
        const JSON = 1 << 5;
        const DUPLEX = 1 << 6;
        const CLUSTERMAP_CHANGE_NOTIFICATION = 1 << 7;
        const UNORDERED_EXECUTION = 1 << 8;
        const COLLECTIONS = 1 << 9;
        const ALT_REQUEST = 1 << 10;
        const SYNC_REPLICATION = 1 << 11;
        const TCP_NODELAY = 1 << 12;
    }
}

/// Raw wire codes, in the order this client proposes them in a HELLO request.
pub mod code {
    pub const TCP_NODELAY: u16 = 0x03;
    pub const MUTATION_SEQNO: u16 = 0x04;
    pub const XATTR: u16 = 0x06;
    pub const XERROR: u16 = 0x07;
    pub const SELECT_BUCKET: u16 = 0x08;
    pub const SNAPPY: u16 = 0x0a;
    pub const JSON: u16 = 0x0b;
    pub const DUPLEX: u16 = 0x0c;
    pub const CLUSTERMAP_CHANGE_NOTIFICATION: u16 = 0x0e;
    pub const UNORDERED_EXECUTION: u16 = 0x0f;
    pub const COLLECTIONS: u16 = 0x12;
    pub const ALT_REQUEST: u16 = 0x19;
    pub const SYNC_REPLICATION: u16 = 0x1a;
}

/// The feature set this client always proposes in a HELLO request.
pub fn requested_codes() -> Vec<u16> {
    vec![
        code::TCP_NODELAY,
        code::MUTATION_SEQNO,
        code::XATTR,
        code::XERROR,
        code::SELECT_BUCKET,
        code::JSON,
        code::DUPLEX,
        code::COLLECTIONS,
        code::ALT_REQUEST,
        code::SYNC_REPLICATION,
    ]
}

pub fn encode_codes(codes: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(codes.len() * 2);
    for code in codes {
        out.extend_from_slice(&code.to_be_bytes());
    }
    out
}

/// Parses the flat `u16` list a HELLO response echoes back into the
/// negotiated feature set this client understands (unrecognized codes the
/// server might also return are silently dropped).
pub fn from_wire(body: &[u8]) -> KvFeatures {
    let mut features = KvFeatures::empty();
    for chunk in body.chunks_exact(2) {
        match u16::from_be_bytes([chunk[0], chunk[1]]) {
            code::TCP_NODELAY => features |= KvFeatures::TCP_NODELAY,
            code::MUTATION_SEQNO => features |= KvFeatures::MUTATION_SEQNO,
            code::XATTR => features |= KvFeatures::XATTR,
            code::XERROR => features |= KvFeatures::XERROR,
            code::SELECT_BUCKET => features |= KvFeatures::SELECT_BUCKET,
            code::SNAPPY => features |= KvFeatures::SNAPPY,
            code::JSON => features |= KvFeatures::JSON,
            code::DUPLEX => features |= KvFeatures::DUPLEX,
            code::CLUSTERMAP_CHANGE_NOTIFICATION => features |= KvFeatures::CLUSTERMAP_CHANGE_NOTIFICATION,
            code::UNORDERED_EXECUTION => features |= KvFeatures::UNORDERED_EXECUTION,
            code::COLLECTIONS => features |= KvFeatures::COLLECTIONS,
            code::ALT_REQUEST => features |= KvFeatures::ALT_REQUEST,
            code::SYNC_REPLICATION => features |= KvFeatures::SYNC_REPLICATION,
            _ => {}
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_requested_feature_list() {
        let codes = requested_codes();
        let wire = encode_codes(&codes);
        let features = from_wire(&wire);
        assert!(features.contains(KvFeatures::COLLECTIONS));
        assert!(features.contains(KvFeatures::JSON));
    }

    #[test]
    fn unknown_codes_are_ignored_rather_than_erroring() {
        let features = from_wire(&0xBEEFu16.to_be_bytes());
        assert!(features.is_empty());
    }
}
