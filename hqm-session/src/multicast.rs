//! The multicast handshake forger.
//!
//! A multicast bearer is one-way: receivers can never complete a handshake
//! or acknowledge a packet. This module supplies the missing half of both.
//! Keys are a pre-shared 32-byte magic installed at every encryption level;
//! the opposite peer's packets are fabricated locally and fed straight into
//! the transport engine; and on the sending side every outbound packet is
//! reflected back as a synthetic ACK so the engine's recovery machinery
//! stays satisfied.

use crate::config::INIT_REQUEST_STREAM_ID;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stream::Stream;
use crate::timer::timestamp_now;
use crate::varint;
use bytes::BufMut;
use hqm_x::{CryptoLevel, TransportParams};
use tracing::{debug, error};

/// The pre-shared secret standing in for every negotiated key, IV and
/// header-protection mask on the multicast bearer.
pub const QUIC_MCAST_MAGIC: [u8; 32] = *b"quic-multicast-magic-pre-shared!";

/// Destination connection id the fabricated client initial is addressed to.
pub const FAKE_CLIENT_INITIAL_DCID: [u8; 8] = *b"hqm-cini";

/// Source connection id the fabricated server handshake claims.
pub const FAKE_SERVER_HANDSHAKE_SCID: [u8; 8] = *b"hqm-shsk";

/// Wire version the profile pretends to negotiate (draft-22).
pub const PROTO_VERSION: u32 = 0xff00_0016;

const LONG_PACKET_TYPE_INITIAL: u8 = 0x0;
const LONG_PACKET_TYPE_HANDSHAKE: u8 = 0x2;

/// Build a long-header packet with a one-byte packet number.
fn long_header_packet(
    packet_type: u8,
    dcid: &[u8],
    scid: &[u8],
    pkt_num: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + dcid.len() + scid.len() + 16);
    out.push(0xC0 | (packet_type << 4));
    out.put_u32(PROTO_VERSION);
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid);
    out.push(scid.len() as u8);
    out.extend_from_slice(scid);
    if packet_type == LONG_PACKET_TYPE_INITIAL {
        varint::put(0, &mut out); // token length
    }
    varint::put(1 + payload.len() as u64, &mut out);
    out.push(pkt_num);
    out.extend_from_slice(payload);
    out
}

/// CRYPTO frame carrying the magic plus the fabricated peer's transport
/// parameters.
fn crypto_payload(params: &TransportParams) -> Vec<u8> {
    let mut blob = QUIC_MCAST_MAGIC.to_vec();
    let mut encoded = [0u8; 512];
    if let Some(n) = params.encode_into(&mut encoded) {
        blob.extend_from_slice(&encoded[..n]);
    }

    let mut out = Vec::with_capacity(blob.len() + 12);
    out.push(0x06); // CRYPTO
    varint::put(0, &mut out); // offset
    varint::put(blob.len() as u64, &mut out);
    out.extend_from_slice(&blob);
    out
}

/// An empty stream frame with an explicit zero length, used to provoke
/// stream state in the engine without putting bytes on any wire.
fn empty_stream_frame(stream_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push(0x0a); // STREAM with length, no offset, no fin
    varint::put(stream_id, &mut out);
    varint::put(0, &mut out);
    out
}

/// The client initial the multicast server pretends to have received.
pub fn fake_client_initial_packet(
    session_id: &[u8],
    pkt_num: u8,
    params: &TransportParams,
) -> Vec<u8> {
    long_header_packet(
        LONG_PACKET_TYPE_INITIAL,
        &FAKE_CLIENT_INITIAL_DCID,
        session_id,
        pkt_num,
        &crypto_payload(params),
    )
}

/// The server initial the multicast client pretends to have received.
pub fn fake_server_initial_packet(
    session_id: &[u8],
    pkt_num: u8,
    params: &TransportParams,
) -> Vec<u8> {
    long_header_packet(
        LONG_PACKET_TYPE_INITIAL,
        session_id,
        &FAKE_SERVER_HANDSHAKE_SCID,
        pkt_num,
        &crypto_payload(params),
    )
}

/// The server handshake flight the multicast client pretends to have
/// received.
pub fn fake_server_handshake_packet(
    session_id: &[u8],
    pkt_num: u8,
    params: &TransportParams,
) -> Vec<u8> {
    long_header_packet(
        LONG_PACKET_TYPE_HANDSHAKE,
        session_id,
        &FAKE_SERVER_HANDSHAKE_SCID,
        pkt_num,
        &crypto_payload(params),
    )
}

/// The short-header packet that commits stream 0 (and opens the init
/// request stream) on the server engine, provoking its first real ACK slot.
pub fn fake_client_stream0_packet(session_id: &[u8], pkt_num: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(session_id.len() + 12);
    out.push(0x40);
    out.extend_from_slice(session_id);
    out.push(pkt_num);
    out.extend_from_slice(&empty_stream_frame(0));
    out.extend_from_slice(&empty_stream_frame(INIT_REQUEST_STREAM_ID));
    out
}

/// Decoded short header of one of our own outbound packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub cid: Vec<u8>,
    pub pkt_num: u64,
}

impl ShortHeader {
    /// Parse a short-header packet given the connection-id length in use.
    pub fn decode(buf: &[u8], cid_len: usize) -> Option<Self> {
        let first = *buf.first()?;
        if first & 0x80 != 0 {
            return None;
        }
        let pn_len = ((first & 0x03) + 1) as usize;
        if buf.len() < 1 + cid_len + pn_len {
            return None;
        }
        let cid = buf[1..1 + cid_len].to_vec();
        let mut pkt_num = 0u64;
        for &b in &buf[1 + cid_len..1 + cid_len + pn_len] {
            pkt_num = (pkt_num << 8) | u64::from(b);
        }
        Some(ShortHeader { cid, pkt_num })
    }
}

fn pkt_num_mask(pkt_num: u64) -> u64 {
    if pkt_num < 0x100 {
        0xff
    } else if pkt_num < 0x1_0000 {
        0xffff
    } else {
        0xffff_ffff
    }
}

/// Reconstruct a full packet number from its truncated wire form by filling
/// the high bits from the last number seen, bumping by one wrap if the
/// naive value went backwards.
pub fn expand_pkt_number(last: u64, pkt_num: u64) -> u64 {
    let mut full = pkt_num;
    if full < last {
        let mask = pkt_num_mask(pkt_num);
        full |= last & !mask;
        if full < last {
            full += mask + 1;
        }
    }
    full
}

/// Build the synthetic ACK packet: fixed byte 0x40, connection id, our
/// one-byte packet number, then an ACK frame acknowledging `largest_ack`
/// with zero delay and no further ranges, padded to the minimum body the
/// engine's header protection expects.
pub fn build_fake_ack(cid: &[u8], local_pkt_num: u8, largest_ack: u64) -> Vec<u8> {
    let mut ack_body = Vec::with_capacity(24);
    varint::put(0x02, &mut ack_body); // frame type: ACK
    varint::put(largest_ack, &mut ack_body);
    varint::put(0, &mut ack_body); // ACK delay
    varint::put(0, &mut ack_body); // range count
    varint::put(0, &mut ack_body); // first range

    let body_len = ack_body.len().max(16);

    let mut out = Vec::with_capacity(1 + cid.len() + 1 + body_len);
    out.push(0x40);
    out.extend_from_slice(cid);
    out.push(local_pkt_num);
    out.extend_from_slice(&ack_body);
    out.resize(1 + cid.len() + 1 + body_len, 0);
    out
}

impl Session {
    /// Reflect one of our outbound packets as an ACK on the receive queue.
    pub(crate) fn mcast_fake_ack(&mut self, hdr: &ShortHeader) {
        let full = expand_pkt_number(self.last_remote_pkt_num, hdr.pkt_num);
        self.last_remote_pkt_num = full;

        let cid: &[u8] = match self.role {
            crate::Role::Server => &FAKE_SERVER_HANDSHAKE_SCID,
            crate::Role::Client => &self.session_id,
        };
        let pkt = build_fake_ack(cid, self.remote_pktnum, full);
        self.recv_queue.push_back(pkt);
    }

    fn queue_stream0_commit(&mut self) -> Result<()> {
        // A stream frame with an explicit zero length; technically not
        // allowed, but it never reaches the wire.
        let frame = [0x0au8, 0x00];
        let stream0 = self.transfers.find_mut(0).ok_or(Error::Internal)?;
        stream0
            .send_buf
            .push(crate::buffer::Segment::new(frame, 0, false));
        Ok(())
    }

    /// Client start: install the magic everywhere, feed the engine a
    /// fabricated server, and commit the result through stream 0.
    pub(crate) fn multicast_client_start(&mut self) -> Result<()> {
        debug!("forging multicast client handshake");
        let now = timestamp_now();

        self.engine.install_initial_key(&QUIC_MCAST_MAGIC)?;
        self.engine.install_handshake_key(&QUIC_MCAST_MAGIC)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Initial, &QUIC_MCAST_MAGIC)?;

        let mut init_pkt = vec![0u8; self.max_packet_size];
        let written = self
            .engine
            .write_stream(&self.path, &mut init_pkt, None, false, &[], now)?;
        if written.packet_len == 0 {
            error!("failed to write the client initial packet");
            return Err(Error::Internal);
        }
        // The client initial only advances the engine; nothing carries it.

        let params = self.engine.local_transport_params();

        let fake_initial = fake_server_initial_packet(&self.session_id, 1, &params);
        self.engine.read_pkt(&self.path, &fake_initial, now)?;

        let fake_handshake = fake_server_handshake_packet(&self.session_id, 1, &params);
        self.engine.read_pkt(&self.path, &fake_handshake, now)?;

        self.engine
            .submit_crypto_data(CryptoLevel::Handshake, &QUIC_MCAST_MAGIC)?;
        self.engine.handshake_completed();
        self.engine.install_application_key(&QUIC_MCAST_MAGIC)?;

        self.process_engine_events()?;

        // The init request stream every multicast transfer hangs off.
        let init = self.engine.open_bidi_stream().map_err(Error::from)?;
        if init.0 != INIT_REQUEST_STREAM_ID {
            error!(stream = %init, "init request stream landed on the wrong id");
            return Err(Error::Internal);
        }
        let handle = self.alloc_handle();
        self.transfers
            .add(init.0, Stream::with_id(init.0, handle))
            .map_err(|_| Error::Internal)?;

        self.queue_stream0_commit()?;
        match self.send() {
            Ok(()) | Err(Error::NoMoreData) => {}
            Err(e) => {
                error!(error = %e, "failed to open stream 0");
                return Err(e);
            }
        }

        if !self.engine.is_handshake_completed() {
            error!("handshake is not complete");
            return Err(Error::Internal);
        }
        self.handshake_complete = true;

        Ok(())
    }

    /// Server start: accept a fabricated client, drain the handshake flight
    /// nowhere, and provoke the engine's first real ACK slot.
    pub(crate) fn multicast_server_start(&mut self) -> Result<()> {
        debug!("forging multicast server handshake");
        let now = timestamp_now();

        let params = self.engine.local_transport_params();
        let client_initial = fake_client_initial_packet(&self.session_id, 0, &params);

        self.engine.accept_initial(&client_initial)?;
        self.engine.read_pkt(&self.path, &client_initial, now)?;

        self.engine.install_handshake_key(&QUIC_MCAST_MAGIC)?;
        self.engine.install_application_key(&QUIC_MCAST_MAGIC)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Initial, &QUIC_MCAST_MAGIC)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Handshake, &QUIC_MCAST_MAGIC)?;

        // Drain the handshake flight; the bearer has nowhere to carry it.
        let mut out = vec![0u8; 1000];
        loop {
            let n = self.engine.write_pkt(&self.path, &mut out, now)?;
            if n == 0 {
                break;
            }
        }

        self.engine.handshake_completed();
        // Keep packet-size arithmetic consistent with the on-wire fiction.
        self.engine.set_aead_overhead(0);

        let stream0_pkt = fake_client_stream0_packet(&self.session_id, 1);
        self.engine.read_pkt(&self.path, &stream0_pkt, now)?;
        self.process_engine_events()?;

        if !self.engine.is_handshake_completed() {
            error!("handshake is not complete");
            return Err(Error::Internal);
        }
        self.handshake_complete = true;

        if !self.transfers.contains(INIT_REQUEST_STREAM_ID) {
            let handle = self.alloc_handle();
            self.transfers
                .add(
                    INIT_REQUEST_STREAM_ID,
                    Stream::with_id(INIT_REQUEST_STREAM_ID, handle),
                )
                .map_err(|_| Error::Internal)?;
        }

        // Give stream 0 something to "send" so the engine forms its first
        // ACK before any real data exists.
        self.queue_stream0_commit()?;
        let _ = self.send();

        Ok(())
    }
}
