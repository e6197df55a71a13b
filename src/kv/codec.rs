//! Binary memcached-style protocol framing: a 24-byte fixed header
//! (magic, opcode, key length, extras length, datatype, status/vbucket,
//! total body length, opaque, cas) followed by extras, key, and value.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ErrorKind, Result};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

#[derive(Debug, Clone)]
pub struct Frame {
    pub magic: u8,
    pub opcode: u8,
    pub datatype: u8,
    /// Request: vbucket id. Response: status code.
    pub status_or_vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: bytes::Bytes,
    pub key: bytes::Bytes,
    pub value: bytes::Bytes,
}

impl Frame {
    pub fn request(opcode: u8, vbucket: u16, opaque: u32) -> Self {
        Frame {
            magic: REQUEST_MAGIC,
            opcode,
            datatype: 0,
            status_or_vbucket: vbucket,
            opaque,
            cas: 0,
            extras: bytes::Bytes::new(),
            key: bytes::Bytes::new(),
            value: bytes::Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<bytes::Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<bytes::Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<bytes::Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn status(&self) -> u16 {
        self.status_or_vbucket
    }
}

#[derive(Default)]
pub struct KvCodec;

impl Encoder<Frame> for KvCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let total_body = frame.extras.len() + frame.key.len() + frame.value.len();
        dst.reserve(HEADER_LEN + total_body);
        dst.put_u8(frame.magic);
        dst.put_u8(frame.opcode);
        dst.put_u16(frame.key.len() as u16);
        dst.put_u8(frame.extras.len() as u8);
        dst.put_u8(frame.datatype);
        dst.put_u16(frame.status_or_vbucket);
        dst.put_u32(total_body as u32);
        dst.put_u32(frame.opaque);
        dst.put_u64(frame.cas);
        dst.put_slice(&frame.extras);
        dst.put_slice(&frame.key);
        dst.put_slice(&frame.value);
        Ok(())
    }
}

impl Decoder for KvCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let key_len = BigEndian::read_u16(&src[2..4]) as usize;
        let extras_len = src[4] as usize;
        let total_body = BigEndian::read_u32(&src[8..12]) as usize;
        if total_body < key_len + extras_len {
            return Err(Error::new(ErrorKind::DecodingFailure, "body shorter than key+extras"));
        }
        let frame_len = HEADER_LEN + total_body;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let magic = src[0];
        let opcode = src[1];
        let datatype = src[5];
        let status_or_vbucket = BigEndian::read_u16(&src[6..8]);
        let opaque = BigEndian::read_u32(&src[12..16]);
        let cas = BigEndian::read_u64(&src[16..24]);

        let mut buf = src.split_to(frame_len);
        buf.advance(HEADER_LEN);
        let extras = buf.split_to(extras_len).freeze();
        let key = buf.split_to(key_len).freeze();
        let value = buf.freeze();

        Ok(Some(Frame {
            magic,
            opcode,
            datatype,
            status_or_vbucket,
            opaque,
            cas,
            extras,
            key,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame_through_encode_decode() {
        let mut codec = KvCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::request(0x00, 3, 42)
            .with_key("airline_10")
            .with_value(b"{}".to_vec())
            .with_cas(7);
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode, 0x00);
        assert_eq!(decoded.opaque, 42);
        assert_eq!(decoded.cas, 7);
        assert_eq!(&decoded.key[..], b"airline_10");
        assert_eq!(&decoded.value[..], b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = KvCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::request(0x00, 0, 1).with_key("k");
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();
        buf.extend_from_slice(&full[..HEADER_LEN - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
