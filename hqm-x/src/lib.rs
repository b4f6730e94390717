//! hqm-x: boundary interface between an hqm session and its collaborators.
//!
//! An hqm session engine does no packet protection, loss detection or header
//! compression of its own. Those jobs belong to two external collaborators,
//! abstracted here:
//!
//! - [`TransportEngine`] — a QUIC transport engine. The session drives it
//!   with raw packets and stream writes, and polls [`TransportEvent`]s back
//!   out of it. In the multicast profile the session also force-feeds it both
//!   sides of a fabricated handshake.
//! - [`HeaderCodec`] — an HPACK-style field-section codec. One codec instance
//!   is shared by encode and decode for the session lifetime.
//!
//! Everything in this crate is synchronous: the session is a single-threaded
//! state machine and calls into both collaborators inline.

#![forbid(unsafe_code)]

use bytes::Bytes;

pub mod params;

pub use params::TransportParams;

/// Unique identifier for a QUIC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x2) != 0
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        (self.0 & 0x1) != 0
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single HTTP header field as an opaque name/value byte pair.
///
/// The session never interprets field contents beyond a handful of literal
/// comparisons (`trailer`, the multicast goaway markers); everything else is
/// passed through the [`HeaderCodec`] untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
        }
    }

    /// Case-insensitive name comparison, as field names are.
    pub fn name_is(&self, name: &str) -> bool {
        self.name.len() == name.len()
            && self
                .name
                .iter()
                .zip(name.as_bytes())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Exact value comparison.
    pub fn value_is(&self, value: &str) -> bool {
        self.value.as_ref() == value.as_bytes()
    }
}

/// Network path descriptor handed through to the transport engine.
///
/// Addresses are opaque byte strings; the session never inspects them.
#[derive(Debug, Clone, Default)]
pub struct Path {
    pub local: Bytes,
    pub remote: Bytes,
}

/// QUIC encryption levels the session submits crypto data at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoLevel {
    Initial,
    Handshake,
    Application,
}

/// Errors reported by a [`TransportEngine`].
///
/// The session translates these at its boundary; see the error module of the
/// session crate for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("out of memory")]
    NoMem,
    #[error("insufficient output buffer")]
    NoBuf,
    #[error("protocol violation")]
    Proto,
    #[error("unsupported version")]
    Version,
    #[error("packet decryption failed")]
    TlsDecrypt,
    #[error("callback failure")]
    CallbackFailure,
    #[error("invalid connection state")]
    InvalidState,
    #[error("packet number space exhausted")]
    PktNumExhausted,
    #[error("stream is flow-control blocked")]
    StreamDataBlocked,
    #[error("stream is shut for writing")]
    StreamShutWr,
    #[error("stream not found")]
    StreamNotFound,
    #[error("fatal transport failure")]
    Fatal,
}

/// Errors reported by a [`HeaderCodec`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("header compression failure: {0}")]
pub struct CodecError(pub String);

/// Events the session polls out of the engine after feeding it packets.
///
/// This replaces the C-style callback table a transport engine would
/// otherwise invoke re-entrantly: the session reads events in a loop after
/// every `read_pkt`, with streams referenced by id rather than pointer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The engine considers the handshake finished.
    HandshakeCompleted,
    /// The peer opened a stream.
    StreamOpened { stream_id: StreamId },
    /// Decrypted, flow-controlled stream bytes at an absolute stream offset.
    /// Ranges may arrive out of order, duplicated or overlapping.
    StreamData {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    /// A stream reached its end (locally shut down or closed by the peer),
    /// carrying the HTTP/QUIC application error code.
    StreamClosed {
        stream_id: StreamId,
        app_error_code: u64,
    },
}

/// Outcome of a stream write: the engine produced a packet of `packet_len`
/// bytes into the caller's buffer, consuming `accepted` source bytes.
#[derive(Debug, Clone, Copy)]
pub struct StreamWritten {
    pub packet_len: usize,
    pub accepted: usize,
}

/// The external QUIC transport engine.
///
/// The contract mirrors a conventional connection object: packets in via
/// [`read_pkt`](TransportEngine::read_pkt), packets out via
/// [`write_stream`](TransportEngine::write_stream) /
/// [`write_pkt`](TransportEngine::write_pkt), consequences out via
/// [`poll_event`](TransportEvent). All timestamps are nanoseconds on the
/// caller's monotonic clock. A deadline of `u64::MAX` means "unarmed".
///
/// The multicast profile additionally requires the key-installation and
/// crypto-data entry points so the session can stand in for the TLS stack
/// with a pre-shared secret.
pub trait TransportEngine {
    /// Install `secret` as the Initial-level keys for both directions.
    fn install_initial_key(&mut self, secret: &[u8]) -> Result<(), EngineError>;

    /// Install `secret` as the Handshake-level keys for both directions.
    fn install_handshake_key(&mut self, secret: &[u8]) -> Result<(), EngineError>;

    /// Install `secret` as the application (1-RTT) keys for both directions.
    fn install_application_key(&mut self, secret: &[u8]) -> Result<(), EngineError>;

    /// Queue crypto handshake data for transmission at `level`.
    fn submit_crypto_data(&mut self, level: CryptoLevel, data: &[u8]) -> Result<(), EngineError>;

    /// Server side: validate that `pkt` is an acceptable client Initial
    /// before it is fed through [`read_pkt`](TransportEngine::read_pkt).
    fn accept_initial(&mut self, pkt: &[u8]) -> Result<(), EngineError>;

    /// Process one received (or fabricated) packet.
    fn read_pkt(&mut self, path: &Path, pkt: &[u8], now: u64) -> Result<(), EngineError>;

    /// Build one outgoing packet carrying stream data into `dest`.
    ///
    /// `stream_id` of `None` lets the engine emit whatever non-stream frames
    /// it owes (handshake flights, ACKs). The engine may accept fewer source
    /// bytes than offered; a `packet_len` of zero means it produced nothing.
    fn write_stream(
        &mut self,
        path: &Path,
        dest: &mut [u8],
        stream_id: Option<StreamId>,
        fin: bool,
        data: &[u8],
        now: u64,
    ) -> Result<StreamWritten, EngineError>;

    /// Build one non-stream packet (ACKs, retransmissions) into `dest`.
    /// Returns 0 once the engine has nothing more to emit.
    fn write_pkt(&mut self, path: &Path, dest: &mut [u8], now: u64)
        -> Result<usize, EngineError>;

    /// Build a CONNECTION_CLOSE packet into `dest`.
    fn write_connection_close(
        &mut self,
        path: &Path,
        dest: &mut [u8],
        error_code: u64,
        now: u64,
    ) -> Result<usize, EngineError>;

    /// Drain the next pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Open a locally-initiated bidirectional stream.
    fn open_bidi_stream(&mut self) -> Result<StreamId, EngineError>;

    /// Open a locally-initiated unidirectional stream.
    fn open_uni_stream(&mut self) -> Result<StreamId, EngineError>;

    /// Abruptly terminate a stream with an application error code.
    fn shutdown_stream(&mut self, stream_id: StreamId, app_error_code: u64)
        -> Result<(), EngineError>;

    /// Bytes sent but not yet acknowledged.
    fn bytes_in_flight(&self) -> usize;

    /// Declare the handshake finished (multicast forgery only).
    fn handshake_completed(&mut self);

    /// Whether the engine considers the handshake finished.
    fn is_handshake_completed(&self) -> bool;

    /// Override the AEAD expansion used in packet-size arithmetic
    /// (multicast sets this to zero to match the on-wire fiction).
    fn set_aead_overhead(&mut self, overhead: usize);

    /// Whether the connection is draining after a close.
    fn is_in_draining_period(&self) -> bool;

    /// Loss-detection deadline in nanoseconds, `u64::MAX` if unarmed.
    fn loss_detection_expiry(&self) -> u64;

    /// Delayed-ACK deadline in nanoseconds, `u64::MAX` if unarmed.
    fn ack_delay_expiry(&self) -> u64;

    /// Run the loss-detection machinery because its deadline passed.
    fn on_loss_detection_timer(&mut self, now: u64);

    /// The engine's local transport parameters.
    fn local_transport_params(&self) -> TransportParams;

    /// Install the peer's (possibly fabricated) transport parameters.
    fn set_remote_transport_params(&mut self, params: &TransportParams)
        -> Result<(), EngineError>;
}

/// The external HPACK-style header compression codec.
///
/// A single instance carries the shared compression context for a session;
/// it is not assumed thread-safe — callers hold the session.
pub trait HeaderCodec {
    /// Compress a list of header fields into one encoded field section.
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes, CodecError>;

    /// Decompress an encoded field section back into header fields.
    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, CodecError>;
}
