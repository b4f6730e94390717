//! Session configuration: profiles, roles, limits and fixed protocol
//! constants.

use hqm_x::Path;

/// Bearer profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Conventional bidirectional QUIC with a negotiated handshake.
    Unicast,
    /// One-way bearer: keys are pre-shared magic, the reverse path does not
    /// exist and the session forges the missing half of every exchange.
    Multicast,
}

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Ceiling on unacknowledged bytes before the scheduler refuses to produce
/// new packets.
pub const MAX_BYTES_IN_FLIGHT: usize = 14_600;

/// Reserved per-packet byte overhead: QUIC short header + stream frame
/// header + HTTP framing.
pub const MIN_STREAM_PACKET_OVERHEAD: usize = 27;

/// Socket read granularity in `session_recv`.
pub const BUFFER_READ_SIZE: usize = 4096;

/// The bidirectional stream the multicast profile anchors requests and push
/// promises to.
pub const INIT_REQUEST_STREAM_ID: u64 = 4;

/// Alias: the same stream carries the push-promise sequence a late joiner
/// parses from mid-stream.
pub const PUSH_PROMISE_STREAM_ID: u64 = 4;

/// Client-owned control stream id.
pub const CONTROL_STREAM_CLIENT: u64 = 2;

/// Server-owned control stream id.
pub const CONTROL_STREAM_SERVER: u64 = 3;

/// Highest unidirectional stream id the multicast profile permits.
pub const MULTICAST_MAX_UNI_STREAM_ID: u64 = 0x3fff_ffff;

/// HTTP-level tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on a single frame (header + payload). Frames announcing a
    /// larger size are treated as malformed before any buffer is reserved.
    pub max_frame_size: u64,
    /// Advertised bound on an encoded field section, sent in SETTINGS on the
    /// local control stream.
    pub max_field_section_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_field_section_size: 64 * 1024,
        }
    }
}

/// Transport-level configuration handed to session construction.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub mode: Mode,
    /// Opaque session identifier used as the connection id on the wire.
    pub session_id: Vec<u8>,
    /// Maximum concurrent client requests.
    pub max_open_requests: u64,
    /// Maximum concurrent server pushes.
    pub max_open_server_pushes: u64,
    /// Idle timeout advertised in transport parameters, milliseconds.
    pub idle_timeout: u64,
    /// Maximum packet size the scheduler will ask the engine to produce.
    pub max_packet_size: usize,
    /// Connection-level flow control limit; 0 selects the engine default.
    pub max_data: u64,
    /// Per-stream flow control limit; 0 selects the engine default.
    pub max_stream_data: u64,
    pub ack_delay_exponent: u64,
    /// Source/destination addresses, passed opaquely to the engine.
    pub path: Path,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Unicast,
            session_id: vec![0; 8],
            max_open_requests: 16,
            max_open_server_pushes: 16,
            idle_timeout: 30_000,
            max_packet_size: 1350,
            max_data: 0,
            max_stream_data: 0,
            ack_delay_exponent: 3,
            path: Path::default(),
        }
    }
}

/// Session id length cap, matching the connection id limit on the wire.
pub const MAX_SESSION_ID_LEN: usize = 20;

impl TransportSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.session_id.is_empty() || self.session_id.len() > MAX_SESSION_ID_LEN {
            return Err(format!(
                "session_id must be 1..={} bytes",
                MAX_SESSION_ID_LEN
            ));
        }
        if self.max_packet_size <= MIN_STREAM_PACKET_OVERHEAD {
            return Err(format!(
                "max_packet_size must exceed the {}-byte stream packet overhead",
                MIN_STREAM_PACKET_OVERHEAD
            ));
        }
        if self.max_open_requests == 0 {
            return Err("max_open_requests must be non-zero".into());
        }
        Ok(())
    }
}
