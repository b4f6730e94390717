//! Shared test harness: a deterministic in-memory transport engine, a
//! pass-through header codec, and a recording callback table. Two sessions
//! wired back-to-back through these talk to each other packet for packet.

#![allow(dead_code)]

use bytes::Bytes;
use hqm_session::{HeadersFlags, Result, SessionEvents, SocketIo, UserHandle};
use hqm_x::{
    CodecError, CryptoLevel, EngineError, Header, HeaderCodec, Path, StreamId, StreamWritten,
    TransportEngine, TransportEvent, TransportParams,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Wire app error code for a clean close, mirrored from the session crate.
pub const HTTP_NO_ERROR: u64 = 0x01;

#[derive(Default)]
pub struct EngineState {
    pub is_client: bool,
    pub cid: Vec<u8>,
    pub events: VecDeque<TransportEvent>,
    pub bytes_in_flight: usize,
    pub handshake_done: bool,
    pub next_bidi: u64,
    pub next_uni: u64,
    pub send_offsets: HashMap<u64, u64>,
    pub opened_by_peer: HashSet<u64>,
    pub pkt_num: u64,
    /// largest-acked values observed in received ACK frames.
    pub acks_seen: Vec<u64>,
    /// Log of (stream_id, accepted bytes) per write_stream call.
    pub writes: Vec<(u64, Vec<u8>)>,
    pub shutdowns: Vec<(u64, u64)>,
    pub crypto_submissions: Vec<(CryptoLevel, usize)>,
    pub keys_installed: Vec<&'static str>,
    pub handshake_flight: VecDeque<Vec<u8>>,
    pub aead_overhead: Option<usize>,
    pub draining: bool,
    /// Test knob: write_stream produces no packet.
    pub write_blocked: bool,
    /// Test knob: fixed bytes-in-flight override.
    pub forced_in_flight: Option<usize>,
}

/// Shared-handle mock engine; clone it to keep visibility into a session.
#[derive(Clone)]
pub struct MockEngine(pub Rc<RefCell<EngineState>>);

impl MockEngine {
    fn new(is_client: bool, cid: Vec<u8>, pre_handshaked: bool) -> Self {
        let mut state = EngineState {
            is_client,
            cid,
            next_bidi: if is_client { 0 } else { 1 },
            next_uni: if is_client { 2 } else { 3 },
            ..EngineState::default()
        };
        if pre_handshaked {
            state.handshake_done = true;
            state.events.push_back(TransportEvent::HandshakeCompleted);
        }
        Self(Rc::new(RefCell::new(state)))
    }

    /// A unicast engine, already handshaken for test brevity.
    pub fn unicast_client(cid: &[u8]) -> Self {
        Self::new(true, cid.to_vec(), true)
    }

    pub fn unicast_server(cid: &[u8]) -> Self {
        Self::new(false, cid.to_vec(), true)
    }

    /// A multicast engine; the session forges its handshake.
    pub fn multicast_client(cid: &[u8]) -> Self {
        Self::new(true, cid.to_vec(), false)
    }

    pub fn multicast_server(cid: &[u8]) -> Self {
        Self::new(false, cid.to_vec(), false)
    }

    pub fn inject_event(&self, event: TransportEvent) {
        self.0.borrow_mut().events.push_back(event);
    }

    fn note_stream(&self, id: StreamId) {
        let mut state = self.0.borrow_mut();
        let peer_initiated = if state.is_client {
            id.is_server_initiated()
        } else {
            id.is_client_initiated()
        };
        if peer_initiated && state.opened_by_peer.insert(id.0) {
            state
                .events
                .push_back(TransportEvent::StreamOpened { stream_id: id });
        }
    }
}

fn get_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    let len = match first >> 6 {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    };
    if buf.len() < *pos + len {
        return None;
    }
    let mut value = u64::from(first & 0x3F);
    for i in 1..len {
        value = (value << 8) | u64::from(buf[*pos + i]);
    }
    *pos += len;
    Some(value)
}

fn put_varint(out: &mut Vec<u8>, value: u64) {
    if value < 64 {
        out.push(value as u8);
    } else if value < 16384 {
        out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        out.extend_from_slice(&(value | 0xC000_0000_0000_0000).to_be_bytes());
    }
}

impl TransportEngine for MockEngine {
    fn install_initial_key(&mut self, _secret: &[u8]) -> std::result::Result<(), EngineError> {
        self.0.borrow_mut().keys_installed.push("initial");
        Ok(())
    }

    fn install_handshake_key(&mut self, _secret: &[u8]) -> std::result::Result<(), EngineError> {
        self.0.borrow_mut().keys_installed.push("handshake");
        Ok(())
    }

    fn install_application_key(&mut self, _secret: &[u8]) -> std::result::Result<(), EngineError> {
        self.0.borrow_mut().keys_installed.push("application");
        Ok(())
    }

    fn submit_crypto_data(
        &mut self,
        level: CryptoLevel,
        data: &[u8],
    ) -> std::result::Result<(), EngineError> {
        let mut state = self.0.borrow_mut();
        state.crypto_submissions.push((level, data.len()));
        // Each submission owes one handshake-flight packet.
        state.handshake_flight.push_back(vec![0xE0; 24]);
        Ok(())
    }

    fn accept_initial(&mut self, pkt: &[u8]) -> std::result::Result<(), EngineError> {
        if pkt.first().map(|b| b & 0x80) != Some(0x80) {
            return Err(EngineError::Proto);
        }
        Ok(())
    }

    fn read_pkt(
        &mut self,
        _path: &Path,
        pkt: &[u8],
        _now: u64,
    ) -> std::result::Result<(), EngineError> {
        let Some(&first) = pkt.first() else {
            return Err(EngineError::Proto);
        };
        if first & 0x80 != 0 {
            // Long header: a fabricated handshake packet; nothing to do.
            return Ok(());
        }

        let cid_len = self.0.borrow().cid.len();
        let pn_len = ((first & 0x03) + 1) as usize;
        let mut pos = 1 + cid_len + pn_len;
        if pkt.len() < pos {
            return Err(EngineError::Proto);
        }

        while pos < pkt.len() {
            let frame_type = pkt[pos];
            match frame_type {
                0x00 => pos += 1, // PADDING
                0x01 => pos += 1, // PING
                0x02 => {
                    pos += 1;
                    let largest = get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?;
                    get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?; // delay
                    get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?; // ranges
                    get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?; // first range
                    let mut state = self.0.borrow_mut();
                    state.acks_seen.push(largest);
                    state.bytes_in_flight = 0;
                }
                0x06 => {
                    pos += 1;
                    get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?; // offset
                    let len = get_varint(pkt, &mut pos).ok_or(EngineError::Proto)? as usize;
                    pos += len;
                }
                t if t & 0xF8 == 0x08 => {
                    pos += 1;
                    let has_off = t & 0x04 != 0;
                    let has_len = t & 0x02 != 0;
                    let fin = t & 0x01 != 0;
                    let id = get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?;
                    let offset = if has_off {
                        get_varint(pkt, &mut pos).ok_or(EngineError::Proto)?
                    } else {
                        0
                    };
                    let len = if has_len {
                        get_varint(pkt, &mut pos).ok_or(EngineError::Proto)? as usize
                    } else {
                        pkt.len() - pos
                    };
                    if pkt.len() < pos + len {
                        return Err(EngineError::Proto);
                    }
                    let data = Bytes::copy_from_slice(&pkt[pos..pos + len]);
                    pos += len;

                    let stream_id = StreamId(id);
                    self.note_stream(stream_id);
                    let mut state = self.0.borrow_mut();
                    state.events.push_back(TransportEvent::StreamData {
                        stream_id,
                        offset,
                        data,
                        fin,
                    });
                    if fin {
                        state.events.push_back(TransportEvent::StreamClosed {
                            stream_id,
                            app_error_code: HTTP_NO_ERROR,
                        });
                    }
                }
                _ => break,
            }
        }

        Ok(())
    }

    fn write_stream(
        &mut self,
        _path: &Path,
        dest: &mut [u8],
        stream_id: Option<StreamId>,
        fin: bool,
        data: &[u8],
        _now: u64,
    ) -> std::result::Result<StreamWritten, EngineError> {
        let mut state = self.0.borrow_mut();
        if state.write_blocked {
            return Ok(StreamWritten {
                packet_len: 0,
                accepted: 0,
            });
        }

        let Some(id) = stream_id else {
            // Handshake-only write: a long-header packet nobody parses.
            let len = 32.min(dest.len());
            dest[..len].fill(0);
            dest[0] = 0xC3;
            return Ok(StreamWritten {
                packet_len: len,
                accepted: 0,
            });
        };

        let offset = *state.send_offsets.get(&id.0).unwrap_or(&0);

        let mut pkt = Vec::with_capacity(data.len() + state.cid.len() + 16);
        pkt.push(0x40); // short header, 1-byte packet number
        let cid = state.cid.clone();
        pkt.extend_from_slice(&cid);
        pkt.push(state.pkt_num as u8);

        let accepted = data.len();
        let apply_fin = fin && accepted == data.len();
        let mut frame_type = 0x08 | 0x04 | 0x02;
        if apply_fin {
            frame_type |= 0x01;
        }
        pkt.push(frame_type);
        put_varint(&mut pkt, id.0);
        put_varint(&mut pkt, offset);
        put_varint(&mut pkt, accepted as u64);
        pkt.extend_from_slice(data);

        if pkt.len() > dest.len() {
            return Err(EngineError::NoBuf);
        }
        dest[..pkt.len()].copy_from_slice(&pkt);

        state.send_offsets.insert(id.0, offset + accepted as u64);
        state.pkt_num += 1;
        state.bytes_in_flight += pkt.len();
        state.writes.push((id.0, data[..accepted].to_vec()));

        Ok(StreamWritten {
            packet_len: pkt.len(),
            accepted,
        })
    }

    fn write_pkt(
        &mut self,
        _path: &Path,
        dest: &mut [u8],
        _now: u64,
    ) -> std::result::Result<usize, EngineError> {
        let mut state = self.0.borrow_mut();
        match state.handshake_flight.pop_front() {
            Some(pkt) => {
                let len = pkt.len().min(dest.len());
                dest[..len].copy_from_slice(&pkt[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn write_connection_close(
        &mut self,
        _path: &Path,
        dest: &mut [u8],
        _error_code: u64,
        _now: u64,
    ) -> std::result::Result<usize, EngineError> {
        let state = self.0.borrow();
        let len = (1 + state.cid.len() + 2).min(dest.len());
        dest[..len].fill(0);
        dest[0] = 0x40;
        dest[1..1 + state.cid.len()].copy_from_slice(&state.cid);
        Ok(len)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.0.borrow_mut().events.pop_front()
    }

    fn open_bidi_stream(&mut self) -> std::result::Result<StreamId, EngineError> {
        let mut state = self.0.borrow_mut();
        let id = state.next_bidi;
        state.next_bidi += 4;
        Ok(StreamId(id))
    }

    fn open_uni_stream(&mut self) -> std::result::Result<StreamId, EngineError> {
        let mut state = self.0.borrow_mut();
        let id = state.next_uni;
        state.next_uni += 4;
        Ok(StreamId(id))
    }

    fn shutdown_stream(
        &mut self,
        stream_id: StreamId,
        app_error_code: u64,
    ) -> std::result::Result<(), EngineError> {
        let mut state = self.0.borrow_mut();
        state.shutdowns.push((stream_id.0, app_error_code));
        state.events.push_back(TransportEvent::StreamClosed {
            stream_id,
            app_error_code,
        });
        Ok(())
    }

    fn bytes_in_flight(&self) -> usize {
        let state = self.0.borrow();
        state.forced_in_flight.unwrap_or(state.bytes_in_flight)
    }

    fn handshake_completed(&mut self) {
        let mut state = self.0.borrow_mut();
        state.handshake_done = true;
        state.events.push_back(TransportEvent::HandshakeCompleted);
    }

    fn is_handshake_completed(&self) -> bool {
        self.0.borrow().handshake_done
    }

    fn set_aead_overhead(&mut self, overhead: usize) {
        self.0.borrow_mut().aead_overhead = Some(overhead);
    }

    fn is_in_draining_period(&self) -> bool {
        self.0.borrow().draining
    }

    fn loss_detection_expiry(&self) -> u64 {
        u64::MAX
    }

    fn ack_delay_expiry(&self) -> u64 {
        u64::MAX
    }

    fn on_loss_detection_timer(&mut self, _now: u64) {}

    fn local_transport_params(&self) -> TransportParams {
        TransportParams {
            idle_timeout: 30_000,
            initial_max_data: 1024 * 1024,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            disable_active_migration: true,
            ..TransportParams::default()
        }
    }

    fn set_remote_transport_params(
        &mut self,
        _params: &TransportParams,
    ) -> std::result::Result<(), EngineError> {
        Ok(())
    }
}

/// Pass-through header codec: length-prefixed name/value pairs.
pub struct PlainCodec;

impl HeaderCodec for PlainCodec {
    fn encode(&mut self, headers: &[Header]) -> std::result::Result<Bytes, CodecError> {
        let mut out = Vec::new();
        for h in headers {
            put_varint(&mut out, h.name.len() as u64);
            out.extend_from_slice(&h.name);
            put_varint(&mut out, h.value.len() as u64);
            out.extend_from_slice(&h.value);
        }
        Ok(Bytes::from(out))
    }

    fn decode(&mut self, block: &[u8]) -> std::result::Result<Vec<Header>, CodecError> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let name_len = get_varint(block, &mut pos)
                .ok_or_else(|| CodecError("truncated name length".into()))?
                as usize;
            if block.len() < pos + name_len {
                return Err(CodecError("truncated name".into()));
            }
            let name = &block[pos..pos + name_len];
            pos += name_len;
            let value_len = get_varint(block, &mut pos)
                .ok_or_else(|| CodecError("truncated value length".into()))?
                as usize;
            if block.len() < pos + value_len {
                return Err(CodecError("truncated value".into()));
            }
            let value = &block[pos..pos + value_len];
            pos += value_len;
            headers.push(Header::new(name, value));
        }
        Ok(headers)
    }
}

#[derive(Default)]
pub struct RecorderState {
    pub incoming: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub begin_headers: Vec<UserHandle>,
    pub headers: Vec<(HeadersFlags, Vec<u8>, Vec<u8>, UserHandle)>,
    pub data: Vec<(bool, Vec<u8>, u64, UserHandle)>,
    pub promises: Vec<(UserHandle, UserHandle)>,
    pub closes: Vec<(Result<()>, UserHandle)>,
    pub accept_promises: bool,
}

/// Recording callback table with a shared handle for assertions.
#[derive(Clone, Default)]
pub struct Recorder(pub Rc<RefCell<RecorderState>>);

impl Recorder {
    pub fn accepting_promises() -> Self {
        let recorder = Recorder::default();
        recorder.0.borrow_mut().accept_promises = true;
        recorder
    }

    /// Move everything this side sent into the other side's socket.
    pub fn pipe_to(&self, other: &Recorder) {
        let mut from = self.0.borrow_mut();
        let mut to = other.0.borrow_mut();
        for pkt in from.sent.drain(..) {
            to.incoming.push_back(pkt);
        }
    }
}

impl SessionEvents for Recorder {
    fn recv(&mut self, buf: &mut [u8]) -> SocketIo {
        let mut state = self.0.borrow_mut();
        match state.incoming.pop_front() {
            Some(pkt) => {
                assert!(pkt.len() <= buf.len(), "packet larger than read buffer");
                buf[..pkt.len()].copy_from_slice(&pkt);
                SocketIo::Data(pkt.len())
            }
            None => SocketIo::WouldBlock,
        }
    }

    fn send(&mut self, buf: &[u8]) -> SocketIo {
        let mut state = self.0.borrow_mut();
        state.sent.push(buf.to_vec());
        SocketIo::Data(buf.len())
    }

    fn on_begin_headers(&mut self, _session_user: UserHandle, stream_user: UserHandle) -> Result<()> {
        self.0.borrow_mut().begin_headers.push(stream_user);
        Ok(())
    }

    fn on_headers(&mut self, flags: HeadersFlags, hdr: Header, stream_user: UserHandle) -> Result<()> {
        self.0
            .borrow_mut()
            .headers
            .push((flags, hdr.name.to_vec(), hdr.value.to_vec(), stream_user));
        Ok(())
    }

    fn on_data_recv(&mut self, end_data: bool, data: &[u8], offset: u64, stream_user: UserHandle) {
        self.0
            .borrow_mut()
            .data
            .push((end_data, data.to_vec(), offset, stream_user));
    }

    fn on_begin_promise(
        &mut self,
        _session_user: UserHandle,
        parent: UserHandle,
        promise: UserHandle,
    ) -> bool {
        let mut state = self.0.borrow_mut();
        state.promises.push((parent, promise));
        state.accept_promises
    }

    fn on_request_close(&mut self, status: Result<()>, stream_user: UserHandle) {
        self.0.borrow_mut().closes.push((status, stream_user));
    }
}
