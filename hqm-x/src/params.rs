//! QUIC transport parameters exchanged between session and engine.
//!
//! Parameters are serialised as a sequence of (id, length, value) entries
//! with variable-length integers throughout. Only the parameters the session
//! profile actually negotiates are modelled; unknown ids are skipped on
//! decode as the wire format requires.

use bytes::{Buf, BufMut};

/// Transport parameter ids (RFC 9000 Section 18.2 numbering).
const ID_MAX_IDLE_TIMEOUT: u64 = 0x01;
const ID_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const ID_INITIAL_MAX_DATA: u64 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ID_ACK_DELAY_EXPONENT: u64 = 0x0a;
const ID_MAX_ACK_DELAY: u64 = 0x0b;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// Transport parameters relevant to the session profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            idle_timeout: 0,
            max_packet_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
        }
    }
}

/// Failure to decode a transport parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParamsDecodeError {
    #[error("transport parameter blob truncated")]
    Truncated,
    #[error("transport parameter has unexpected length")]
    BadLength,
}

impl TransportParams {
    /// Serialise into `dest`. Returns `None` when `dest` is too small, so
    /// callers can retry with a larger buffer.
    pub fn encode_into(&self, dest: &mut [u8]) -> Option<usize> {
        let mut out = Vec::with_capacity(dest.len());

        put_varint_param(&mut out, ID_MAX_IDLE_TIMEOUT, self.idle_timeout);
        put_varint_param(&mut out, ID_MAX_UDP_PAYLOAD_SIZE, self.max_packet_size);
        put_varint_param(&mut out, ID_INITIAL_MAX_DATA, self.initial_max_data);
        put_varint_param(
            &mut out,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_varint_param(
            &mut out,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_varint_param(
            &mut out,
            ID_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        put_varint_param(
            &mut out,
            ID_INITIAL_MAX_STREAMS_BIDI,
            self.initial_max_streams_bidi,
        );
        put_varint_param(
            &mut out,
            ID_INITIAL_MAX_STREAMS_UNI,
            self.initial_max_streams_uni,
        );
        put_varint_param(&mut out, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_varint_param(&mut out, ID_MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            put_varint(&mut out, ID_DISABLE_ACTIVE_MIGRATION);
            put_varint(&mut out, 0);
        }
        put_varint_param(
            &mut out,
            ID_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );

        if out.len() > dest.len() {
            return None;
        }
        dest[..out.len()].copy_from_slice(&out);
        Some(out.len())
    }

    /// Parse a parameter blob. Unknown parameter ids are skipped.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ParamsDecodeError> {
        let mut params = TransportParams::default();

        while buf.has_remaining() {
            let id = get_varint(&mut buf).ok_or(ParamsDecodeError::Truncated)?;
            let len = get_varint(&mut buf).ok_or(ParamsDecodeError::Truncated)? as usize;
            if buf.remaining() < len {
                return Err(ParamsDecodeError::Truncated);
            }
            let (value, rest) = buf.split_at(len);
            buf = rest;

            match id {
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(ParamsDecodeError::BadLength);
                    }
                    params.disable_active_migration = true;
                }
                ID_MAX_IDLE_TIMEOUT
                | ID_MAX_UDP_PAYLOAD_SIZE
                | ID_INITIAL_MAX_DATA
                | ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL
                | ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE
                | ID_INITIAL_MAX_STREAM_DATA_UNI
                | ID_INITIAL_MAX_STREAMS_BIDI
                | ID_INITIAL_MAX_STREAMS_UNI
                | ID_ACK_DELAY_EXPONENT
                | ID_MAX_ACK_DELAY
                | ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    let mut v = value;
                    let n = get_varint(&mut v).ok_or(ParamsDecodeError::BadLength)?;
                    if v.has_remaining() {
                        return Err(ParamsDecodeError::BadLength);
                    }
                    match id {
                        ID_MAX_IDLE_TIMEOUT => params.idle_timeout = n,
                        ID_MAX_UDP_PAYLOAD_SIZE => params.max_packet_size = n,
                        ID_INITIAL_MAX_DATA => params.initial_max_data = n,
                        ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                            params.initial_max_stream_data_bidi_local = n
                        }
                        ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                            params.initial_max_stream_data_bidi_remote = n
                        }
                        ID_INITIAL_MAX_STREAM_DATA_UNI => {
                            params.initial_max_stream_data_uni = n
                        }
                        ID_INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = n,
                        ID_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = n,
                        ID_ACK_DELAY_EXPONENT => params.ack_delay_exponent = n,
                        ID_MAX_ACK_DELAY => params.max_ack_delay = n,
                        ID_ACTIVE_CONNECTION_ID_LIMIT => {
                            params.active_connection_id_limit = n
                        }
                        _ => unreachable!(),
                    }
                }
                _ => {
                    // Unknown parameter: already skipped above.
                }
            }
        }

        Ok(params)
    }
}

fn put_varint_param(out: &mut Vec<u8>, id: u64, value: u64) {
    put_varint(out, id);
    put_varint(out, varint_len(value) as u64);
    put_varint(out, value);
}

fn varint_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1073741824 {
        4
    } else {
        8
    }
}

fn put_varint(out: &mut Vec<u8>, value: u64) {
    match varint_len(value) {
        1 => out.put_u8(value as u8),
        2 => out.put_u16((value as u16) | 0x4000),
        4 => out.put_u32((value as u32) | 0x8000_0000),
        _ => out.put_u64(value | 0xC000_0000_0000_0000),
    }
}

fn get_varint(buf: &mut &[u8]) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let len = match buf[0] >> 6 {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    };
    if buf.remaining() < len {
        return None;
    }
    let value = match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3FFF) as u64,
        4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
        _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
    };
    Some(value)
}
