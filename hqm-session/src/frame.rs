//! HTTP/3 frame codec.
//!
//! Frames begin with a varint type tag and a varint payload length. Every
//! frame type has a `create_*` builder producing the complete encoded frame
//! and a `parse_*` that takes the complete frame back apart.
//! [`parse_frame_header`] reports the total frame span so the reassembly
//! engine can reserve it before the payload has arrived.

use crate::error::{Error, Result};
use crate::headers::HeaderContext;
use crate::varint;
use bytes::{BufMut, Bytes, BytesMut};
use hqm_x::Header;

pub const FRAME_TYPE_DATA: u64 = 0x0;
pub const FRAME_TYPE_HEADERS: u64 = 0x1;
pub const FRAME_TYPE_PRIORITY: u64 = 0x2;
pub const FRAME_TYPE_CANCEL_PUSH: u64 = 0x3;
pub const FRAME_TYPE_SETTINGS: u64 = 0x4;
pub const FRAME_TYPE_PUSH_PROMISE: u64 = 0x5;
pub const FRAME_TYPE_GOAWAY: u64 = 0x7;
pub const FRAME_TYPE_MAX_PUSH_ID: u64 = 0xD;

/// Settings identifier for the advertised field-section bound.
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    CancelPush,
    Settings,
    PushPromise,
    Goaway,
    MaxPushId,
    /// Unknown types are consumed and logged, never fatal.
    Unknown(u64),
}

impl FrameType {
    pub fn from_u64(v: u64) -> Self {
        match v {
            FRAME_TYPE_DATA => FrameType::Data,
            FRAME_TYPE_HEADERS => FrameType::Headers,
            FRAME_TYPE_PRIORITY => FrameType::Priority,
            FRAME_TYPE_CANCEL_PUSH => FrameType::CancelPush,
            FRAME_TYPE_SETTINGS => FrameType::Settings,
            FRAME_TYPE_PUSH_PROMISE => FrameType::PushPromise,
            FRAME_TYPE_GOAWAY => FrameType::Goaway,
            FRAME_TYPE_MAX_PUSH_ID => FrameType::MaxPushId,
            other => FrameType::Unknown(other),
        }
    }

    pub fn to_u64(self) -> u64 {
        match self {
            FrameType::Data => FRAME_TYPE_DATA,
            FrameType::Headers => FRAME_TYPE_HEADERS,
            FrameType::Priority => FRAME_TYPE_PRIORITY,
            FrameType::CancelPush => FRAME_TYPE_CANCEL_PUSH,
            FrameType::Settings => FRAME_TYPE_SETTINGS,
            FrameType::PushPromise => FRAME_TYPE_PUSH_PROMISE,
            FrameType::Goaway => FRAME_TYPE_GOAWAY,
            FrameType::MaxPushId => FRAME_TYPE_MAX_PUSH_ID,
            FrameType::Unknown(other) => other,
        }
    }
}

/// Parsed frame envelope: type plus the split between header and payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub header_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Total frame span on the stream, header included.
    pub fn total_size(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Parse a frame envelope from the front of `buf`. Returns `None` when more
/// bytes are needed for the two varints.
pub fn parse_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    let (type_tag, type_len) = varint::decode(buf)?;
    let (payload_len, len_len) = varint::decode(&buf[type_len..])?;
    Some(FrameHeader {
        frame_type: FrameType::from_u64(type_tag),
        header_len: type_len + len_len,
        payload_len,
    })
}

fn frame_with_payload(frame_type: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    varint::put(frame_type, &mut buf);
    varint::put(payload.len() as u64, &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Validate the envelope of a complete frame and return its payload.
fn expect_payload(frame: &[u8], frame_type: u64) -> Result<&[u8]> {
    let hdr = parse_frame_header(frame).ok_or(Error::MalformedFrame)?;
    if hdr.frame_type.to_u64() != frame_type || hdr.total_size() != frame.len() as u64 {
        return Err(Error::MalformedFrame);
    }
    Ok(&frame[hdr.header_len..])
}

/// DATA: the payload is the body bytes, borrowed so the reassembly engine
/// can forward them without copying.
pub fn create_data_frame(body: &[u8]) -> Bytes {
    frame_with_payload(FRAME_TYPE_DATA, body)
}

pub fn parse_data_frame(frame: &[u8]) -> Result<&[u8]> {
    expect_payload(frame, FRAME_TYPE_DATA)
}

/// HEADERS: `push_id` of `None` is a request/response header block; `Some`
/// marks a push-continuation block prefixed with the push-id.
pub fn create_headers_frame(
    ctx: &mut HeaderContext,
    push_id: Option<u64>,
    headers: &[Header],
) -> Result<Bytes> {
    let block = ctx.encode(headers)?;
    let mut payload = BytesMut::with_capacity(block.len() + 8);
    if let Some(id) = push_id {
        varint::put(id, &mut payload);
    }
    payload.put_slice(&block);
    Ok(frame_with_payload(FRAME_TYPE_HEADERS, &payload))
}

pub fn parse_headers_frame(
    ctx: &mut HeaderContext,
    frame: &[u8],
    push_prefixed: bool,
) -> Result<(Option<u64>, Vec<Header>)> {
    let mut payload = expect_payload(frame, FRAME_TYPE_HEADERS)?;
    let push_id = if push_prefixed {
        let (id, consumed) = varint::decode(payload).ok_or(Error::MalformedFrame)?;
        payload = &payload[consumed..];
        Some(id)
    } else {
        None
    };
    Ok((push_id, ctx.decode(payload)?))
}

/// PUSH_PROMISE: push-id varint followed by a header block.
pub fn create_push_promise_frame(
    ctx: &mut HeaderContext,
    push_id: u64,
    headers: &[Header],
) -> Result<Bytes> {
    let block = ctx.encode(headers)?;
    let mut payload = BytesMut::with_capacity(block.len() + 8);
    varint::put(push_id, &mut payload);
    payload.put_slice(&block);
    Ok(frame_with_payload(FRAME_TYPE_PUSH_PROMISE, &payload))
}

pub fn parse_push_promise_frame(
    ctx: &mut HeaderContext,
    frame: &[u8],
) -> Result<(u64, Vec<Header>)> {
    let payload = expect_payload(frame, FRAME_TYPE_PUSH_PROMISE)?;
    let (push_id, consumed) = varint::decode(payload).ok_or(Error::MalformedFrame)?;
    Ok((push_id, ctx.decode(&payload[consumed..])?))
}

fn single_varint_frame(frame_type: u64, value: u64) -> Bytes {
    let mut payload = BytesMut::with_capacity(8);
    varint::put(value, &mut payload);
    frame_with_payload(frame_type, &payload)
}

fn parse_single_varint(frame: &[u8], frame_type: u64) -> Result<u64> {
    let payload = expect_payload(frame, frame_type)?;
    let (value, consumed) = varint::decode(payload).ok_or(Error::MalformedFrame)?;
    if consumed != payload.len() {
        return Err(Error::MalformedFrame);
    }
    Ok(value)
}

pub fn create_cancel_push_frame(push_id: u64) -> Bytes {
    single_varint_frame(FRAME_TYPE_CANCEL_PUSH, push_id)
}

pub fn parse_cancel_push_frame(frame: &[u8]) -> Result<u64> {
    parse_single_varint(frame, FRAME_TYPE_CANCEL_PUSH)
}

pub fn create_goaway_frame(last_stream_id: u64) -> Bytes {
    single_varint_frame(FRAME_TYPE_GOAWAY, last_stream_id)
}

pub fn parse_goaway_frame(frame: &[u8]) -> Result<u64> {
    parse_single_varint(frame, FRAME_TYPE_GOAWAY)
}

pub fn create_max_push_id_frame(max_push_id: u64) -> Bytes {
    single_varint_frame(FRAME_TYPE_MAX_PUSH_ID, max_push_id)
}

pub fn parse_max_push_id_frame(frame: &[u8]) -> Result<u64> {
    parse_single_varint(frame, FRAME_TYPE_MAX_PUSH_ID)
}

/// SETTINGS: a list of (identifier, value) varint pairs.
pub fn create_settings_frame(settings: &[(u64, u64)]) -> Bytes {
    let mut payload = BytesMut::new();
    for &(id, value) in settings {
        varint::put(id, &mut payload);
        varint::put(value, &mut payload);
    }
    frame_with_payload(FRAME_TYPE_SETTINGS, &payload)
}

pub fn parse_settings_frame(frame: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut payload = expect_payload(frame, FRAME_TYPE_SETTINGS)?;
    let mut settings = Vec::new();
    while !payload.is_empty() {
        let (id, n) = varint::decode(payload).ok_or(Error::MalformedFrame)?;
        payload = &payload[n..];
        let (value, n) = varint::decode(payload).ok_or(Error::MalformedFrame)?;
        payload = &payload[n..];
        settings.push((id, value));
    }
    Ok(settings)
}

/// PRIORITY: parsed for surface validity only; the core takes no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub prioritized_type: u8,
    pub dependency_type: u8,
    pub prioritized_id: u64,
    pub dependency_id: u64,
    pub weight: u8,
}

pub fn create_priority_frame(priority: &Priority) -> Bytes {
    let mut payload = BytesMut::with_capacity(20);
    payload.put_u8((priority.prioritized_type << 6) | ((priority.dependency_type & 0x3) << 4));
    varint::put(priority.prioritized_id, &mut payload);
    varint::put(priority.dependency_id, &mut payload);
    payload.put_u8(priority.weight);
    frame_with_payload(FRAME_TYPE_PRIORITY, &payload)
}

pub fn parse_priority_frame(frame: &[u8]) -> Result<Priority> {
    let payload = expect_payload(frame, FRAME_TYPE_PRIORITY)?;
    let flags = *payload.first().ok_or(Error::MalformedFrame)?;
    let rest = &payload[1..];
    let (prioritized_id, n) = varint::decode(rest).ok_or(Error::MalformedFrame)?;
    let rest = &rest[n..];
    let (dependency_id, n) = varint::decode(rest).ok_or(Error::MalformedFrame)?;
    let rest = &rest[n..];
    let weight = *rest.first().ok_or(Error::MalformedFrame)?;
    if rest.len() != 1 {
        return Err(Error::MalformedFrame);
    }
    Ok(Priority {
        prioritized_type: flags >> 6,
        dependency_type: (flags >> 4) & 0x3,
        prioritized_id,
        dependency_id,
        weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_reports_total_span() {
        let frame = create_data_frame(&[0u8; 300]);
        let hdr = parse_frame_header(&frame).unwrap();
        assert_eq!(hdr.frame_type, FrameType::Data);
        assert_eq!(hdr.payload_len, 300);
        assert_eq!(hdr.total_size(), frame.len() as u64);
    }

    #[test]
    fn test_frame_header_incomplete() {
        // A 2-byte length varint cut short after the type tag.
        assert!(parse_frame_header(&[0x00]).is_none());
        assert!(parse_frame_header(&[0x00, 0x40]).is_none());
        assert!(parse_frame_header(&[]).is_none());
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = create_data_frame(b"hello body");
        assert_eq!(parse_data_frame(&frame).unwrap(), b"hello body");
    }

    #[test]
    fn test_single_varint_roundtrips() {
        assert_eq!(
            parse_cancel_push_frame(&create_cancel_push_frame(42)).unwrap(),
            42
        );
        assert_eq!(parse_goaway_frame(&create_goaway_frame(16384)).unwrap(), 16384);
        assert_eq!(
            parse_max_push_id_frame(&create_max_push_id_frame(100)).unwrap(),
            100
        );
    }

    #[test]
    fn test_settings_roundtrip() {
        let settings = vec![(SETTINGS_MAX_FIELD_SECTION_SIZE, 65536), (0x1, 4096)];
        let frame = create_settings_frame(&settings);
        assert_eq!(parse_settings_frame(&frame).unwrap(), settings);
    }

    #[test]
    fn test_priority_roundtrip() {
        let priority = Priority {
            prioritized_type: 1,
            dependency_type: 2,
            prioritized_id: 4,
            dependency_id: 0,
            weight: 17,
        };
        let frame = create_priority_frame(&priority);
        assert_eq!(parse_priority_frame(&frame).unwrap(), priority);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let frame = create_goaway_frame(1);
        assert_eq!(
            parse_cancel_push_frame(&frame).unwrap_err(),
            Error::MalformedFrame
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut frame = create_cancel_push_frame(7).to_vec();
        frame.push(0xFF);
        assert_eq!(
            parse_cancel_push_frame(&frame).unwrap_err(),
            Error::MalformedFrame
        );
    }

    #[test]
    fn test_unknown_type_classified() {
        assert_eq!(FrameType::from_u64(0x21), FrameType::Unknown(0x21));
        assert_eq!(FrameType::from_u64(0x21).to_u64(), 0x21);
    }
}
