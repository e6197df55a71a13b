//! KV CRUD surface: the per-document operations (get, mutate, counter,
//! sub-document, observe, with-meta) built directly on top of one
//! `KvSession`. Vbucket/node routing happens one layer up in `Agent`;
//! this module only knows how to turn a call into a `Frame` and a
//! `Frame` back into a typed result.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::common::Durability;
use crate::error::{Error, ErrorKind, Result};
use crate::kv::{opcode, status_to_error_kind, Frame, KvSession};

#[derive(Debug, Clone)]
pub struct GetResult {
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct MutationResult {
    pub cas: u64,
    pub mutation_token: Option<(u64, u64)>, // (vbucket_uuid, seqno)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MutateOptions {
    pub cas: u64,
    pub expiry: Option<Duration>,
    pub durability: Durability,
}

fn encode_expiry(expiry: Option<Duration>) -> u32 {
    expiry.map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn frame_error(frame: &Frame, op: &'static str) -> Option<Error> {
    status_to_error_kind(frame.status()).map(|kind| {
        Error::new(kind, format!("{op} failed with status 0x{:04x}", frame.status()))
    })
}

fn mutation_result(frame: Frame) -> MutationResult {
    let token = if frame.extras.len() >= 16 {
        Some((
            BigEndian::read_u64(&frame.extras[0..8]),
            BigEndian::read_u64(&frame.extras[8..16]),
        ))
    } else {
        None
    };
    MutationResult {
        cas: frame.cas,
        mutation_token: token,
    }
}

/// Per-document KV operations, dispatched over a caller-supplied session
/// (already routed to the owning vbucket's node) with a hard deadline.
pub struct CrudComponent<'a> {
    session: &'a KvSession,
}

impl<'a> CrudComponent<'a> {
    pub fn new(session: &'a KvSession) -> Self {
        CrudComponent { session }
    }

    pub async fn get(&self, vbucket: u16, key: &[u8], deadline: tokio::time::Instant) -> Result<GetResult> {
        let frame = Frame::request(opcode::GET, vbucket, 0).with_key(key.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "get") {
            return Err(err);
        }
        let flags = if response.extras.len() >= 4 {
            BigEndian::read_u32(&response.extras[0..4])
        } else {
            0
        };
        Ok(GetResult {
            value: response.value,
            cas: response.cas,
            flags,
        })
    }

    pub async fn get_and_lock(
        &self,
        vbucket: u16,
        key: &[u8],
        lock_time: Duration,
        deadline: tokio::time::Instant,
    ) -> Result<GetResult> {
        let mut extras = [0u8; 4];
        BigEndian::write_u32(&mut extras, lock_time.as_secs() as u32);
        let frame = Frame::request(opcode::GET_LOCKED, vbucket, 0)
            .with_key(key.to_vec())
            .with_extras(extras.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "get_and_lock") {
            return Err(err);
        }
        Ok(GetResult {
            value: response.value,
            cas: response.cas,
            flags: 0,
        })
    }

    pub async fn get_and_touch(
        &self,
        vbucket: u16,
        key: &[u8],
        expiry: Duration,
        deadline: tokio::time::Instant,
    ) -> Result<GetResult> {
        let mut extras = [0u8; 4];
        BigEndian::write_u32(&mut extras, encode_expiry(Some(expiry)));
        let frame = Frame::request(opcode::GAT, vbucket, 0)
            .with_key(key.to_vec())
            .with_extras(extras.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "get_and_touch") {
            return Err(err);
        }
        Ok(GetResult {
            value: response.value,
            cas: response.cas,
            flags: 0,
        })
    }

    pub async fn touch(&self, vbucket: u16, key: &[u8], expiry: Duration, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let mut extras = [0u8; 4];
        BigEndian::write_u32(&mut extras, encode_expiry(Some(expiry)));
        let frame = Frame::request(opcode::TOUCH, vbucket, 0)
            .with_key(key.to_vec())
            .with_extras(extras.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "touch") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    pub async fn unlock(&self, vbucket: u16, key: &[u8], cas: u64, deadline: tokio::time::Instant) -> Result<()> {
        let frame = Frame::request(opcode::UNLOCK, vbucket, 0)
            .with_key(key.to_vec())
            .with_cas(cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "unlock") {
            return Err(err);
        }
        Ok(())
    }

    async fn store(
        &self,
        op: u8,
        op_name: &'static str,
        vbucket: u16,
        key: &[u8],
        value: &[u8],
        flags: u32,
        opts: MutateOptions,
        deadline: tokio::time::Instant,
    ) -> Result<MutationResult> {
        let mut extras = [0u8; 8];
        BigEndian::write_u32(&mut extras[0..4], flags);
        BigEndian::write_u32(&mut extras[4..8], encode_expiry(opts.expiry));
        let frame = Frame::request(op, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(value.to_vec())
            .with_extras(extras.to_vec())
            .with_cas(opts.cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, op_name) {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    pub async fn insert(&self, vbucket: u16, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        self.store(opcode::ADD, "insert", vbucket, key, value, flags, opts, deadline).await
    }

    pub async fn upsert(&self, vbucket: u16, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        self.store(opcode::SET, "upsert", vbucket, key, value, flags, opts, deadline).await
    }

    pub async fn replace(&self, vbucket: u16, key: &[u8], value: &[u8], flags: u32, opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        self.store(opcode::REPLACE, "replace", vbucket, key, value, flags, opts, deadline).await
    }

    pub async fn append(&self, vbucket: u16, key: &[u8], value: &[u8], opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let frame = Frame::request(opcode::APPEND, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(value.to_vec())
            .with_cas(opts.cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "append") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    pub async fn prepend(&self, vbucket: u16, key: &[u8], value: &[u8], opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let frame = Frame::request(opcode::PREPEND, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(value.to_vec())
            .with_cas(opts.cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "prepend") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    pub async fn remove(&self, vbucket: u16, key: &[u8], cas: u64, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let frame = Frame::request(opcode::DELETE, vbucket, 0)
            .with_key(key.to_vec())
            .with_cas(cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "remove") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    async fn counter(&self, op: u8, op_name: &'static str, vbucket: u16, key: &[u8], delta: u64, initial: u64, expiry: Duration, deadline: tokio::time::Instant) -> Result<(u64, MutationResult)> {
        let mut extras = [0u8; 20];
        BigEndian::write_u64(&mut extras[0..8], delta);
        BigEndian::write_u64(&mut extras[8..16], initial);
        BigEndian::write_u32(&mut extras[16..20], encode_expiry(Some(expiry)));
        let frame = Frame::request(op, vbucket, 0)
            .with_key(key.to_vec())
            .with_extras(extras.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, op_name) {
            return Err(err);
        }
        let new_value = if response.value.len() >= 8 {
            BigEndian::read_u64(&response.value[0..8])
        } else {
            0
        };
        Ok((new_value, mutation_result(response)))
    }

    pub async fn increment(&self, vbucket: u16, key: &[u8], delta: u64, initial: u64, expiry: Duration, deadline: tokio::time::Instant) -> Result<(u64, MutationResult)> {
        self.counter(opcode::INCREMENT, "increment", vbucket, key, delta, initial, expiry, deadline).await
    }

    pub async fn decrement(&self, vbucket: u16, key: &[u8], delta: u64, initial: u64, expiry: Duration, deadline: tokio::time::Instant) -> Result<(u64, MutationResult)> {
        self.counter(opcode::DECREMENT, "decrement", vbucket, key, delta, initial, expiry, deadline).await
    }

    /// Each fragment op is `(opcode, path)`; results come back concatenated
    /// in request order, one `(status, value)` pair per fragment.
    pub async fn lookup_in(&self, vbucket: u16, key: &[u8], paths: &[&str], deadline: tokio::time::Instant) -> Result<Vec<(u16, Bytes)>> {
        let spec = encode_subdoc_spec(paths, &[]);
        let frame = Frame::request(opcode::SUBDOC_LOOKUP, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(spec);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "lookup_in") {
            return Err(err);
        }
        Ok(decode_subdoc_results(&response.value))
    }

    pub async fn mutate_in(&self, vbucket: u16, key: &[u8], fragments: &[(&str, &[u8])], opts: MutateOptions, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let paths: Vec<&str> = fragments.iter().map(|(p, _)| *p).collect();
        let values: Vec<&[u8]> = fragments.iter().map(|(_, v)| *v).collect();
        let spec = encode_subdoc_spec(&paths, &values);
        let frame = Frame::request(opcode::SUBDOC_MUTATE, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(spec)
            .with_cas(opts.cas);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "mutate_in") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    pub async fn observe(&self, vbucket: u16, key: &[u8], deadline: tokio::time::Instant) -> Result<(u8, u64)> {
        let mut value = Vec::new();
        value.extend_from_slice(&vbucket.to_be_bytes());
        value.extend_from_slice(&(key.len() as u16).to_be_bytes());
        value.extend_from_slice(key);
        let frame = Frame::request(opcode::OBSERVE, vbucket, 0).with_value(value);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "observe") {
            return Err(err);
        }
        // response.value: vbucket(2) keylen(2) key(n) status(1) cas(8)
        let body = &response.value;
        if body.len() < 4 {
            return Err(Error::new(ErrorKind::DecodingFailure, "observe response too short"));
        }
        let keylen = BigEndian::read_u16(&body[2..4]) as usize;
        let offset = 4 + keylen;
        if body.len() < offset + 9 {
            return Err(Error::new(ErrorKind::DecodingFailure, "observe response truncated"));
        }
        let persisted_status = body[offset];
        let cas = BigEndian::read_u64(&body[offset + 1..offset + 9]);
        Ok((persisted_status, cas))
    }

    pub async fn get_with_meta(&self, vbucket: u16, key: &[u8], deadline: tokio::time::Instant) -> Result<(GetResult, u32, u64)> {
        let frame = Frame::request(opcode::GET_META, vbucket, 0).with_key(key.to_vec());
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "get_with_meta") {
            return Err(err);
        }
        let (doc_type, seqno) = if response.extras.len() >= 5 {
            (response.extras[0] as u32, 0u64)
        } else {
            (0, 0)
        };
        Ok((
            GetResult {
                value: response.value,
                cas: response.cas,
                flags: 0,
            },
            doc_type,
            seqno,
        ))
    }

    pub async fn set_with_meta(&self, vbucket: u16, key: &[u8], value: &[u8], flags: u32, expiry: Duration, revision_seqno: u64, cas: u64, deadline: tokio::time::Instant) -> Result<MutationResult> {
        let mut extras = Vec::with_capacity(30);
        extras.extend_from_slice(&flags.to_be_bytes());
        extras.extend_from_slice(&encode_expiry(Some(expiry)).to_be_bytes());
        extras.extend_from_slice(&cas.to_be_bytes());
        extras.extend_from_slice(&revision_seqno.to_be_bytes());
        let frame = Frame::request(opcode::SET_WITH_META, vbucket, 0)
            .with_key(key.to_vec())
            .with_value(value.to_vec())
            .with_extras(extras);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "set_with_meta") {
            return Err(err);
        }
        Ok(mutation_result(response))
    }

    /// Asks the node for one document it picks at random out of the vbucket;
    /// the server returns the chosen key in the response, not the request.
    pub async fn random_get(&self, vbucket: u16, deadline: tokio::time::Instant) -> Result<(Bytes, GetResult)> {
        let frame = Frame::request(opcode::RANDOM_GET, vbucket, 0);
        let response = self.session.call(frame, deadline).await?;
        if let Some(err) = frame_error(&response, "random_get") {
            return Err(err);
        }
        let flags = if response.extras.len() >= 4 {
            BigEndian::read_u32(&response.extras[0..4])
        } else {
            0
        };
        Ok((
            response.key.clone(),
            GetResult {
                value: response.value,
                cas: response.cas,
                flags,
            },
        ))
    }
}

/// A minimal multi-path subdoc spec encoding: `[opcode(1) flags(1) path_len(2) value_len(4) path value]*`.
fn encode_subdoc_spec(paths: &[&str], values: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let value = values.get(i).copied().unwrap_or(&[]);
        out.push(0); // per-fragment opcode placeholder, caller sets semantics via path
        out.push(0); // flags
        out.extend_from_slice(&(path.len() as u16).to_be_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(value);
    }
    out
}

fn decode_subdoc_results(body: &[u8]) -> Vec<(u16, Bytes)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 6 <= body.len() {
        let status = BigEndian::read_u16(&body[pos..pos + 2]);
        let len = BigEndian::read_u32(&body[pos + 2..pos + 6]) as usize;
        pos += 6;
        if pos + len > body.len() {
            break;
        }
        out.push((status, Bytes::copy_from_slice(&body[pos..pos + len])));
        pos += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdoc_spec_round_trips_path_and_value_lengths() {
        let spec = encode_subdoc_spec(&["a.b", "c"], &[b"1", b"22"]);
        // opcode+flags(2) + path_len(2) + value_len(4) + "a.b"(3) + "1"(1)
        // then opcode+flags(2) + path_len(2) + value_len(4) + "c"(1) + "22"(2)
        assert_eq!(spec.len(), (2 + 2 + 4 + 3 + 1) + (2 + 2 + 4 + 1 + 2));
    }

    #[test]
    fn encode_expiry_defaults_to_zero() {
        assert_eq!(encode_expiry(None), 0);
        assert_eq!(encode_expiry(Some(Duration::from_secs(30))), 30);
    }
}
