//! hqm-session: HTTP/3-style request/response sessions over an external
//! QUIC transport engine, with a one-way multicast profile.
//!
//! The centre of the crate is [`Session`]: a single-threaded, callback-driven
//! state machine that multiplexes HTTP frames over QUIC streams, reassembles
//! out-of-order stream bytes back into frame boundaries, tracks server-push
//! promises from allocation to materialisation, schedules outgoing bytes
//! under a bytes-in-flight ceiling, and — in the multicast profile —
//! fabricates both sides of the QUIC handshake plus the ACK stream a
//! one-way bearer can never deliver.
//!
//! All progress is driven by the host calling [`Session::recv`],
//! [`Session::send`] or [`Session::on_timer_fired`]; the crate spawns no
//! tasks and performs no I/O of its own. Sockets and timers are reached
//! through the [`SessionEvents`] callback table, the QUIC machinery through
//! the [`hqm_x::TransportEngine`] trait, and header compression through
//! [`hqm_x::HeaderCodec`].

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod headers;
pub mod map;
pub mod multicast;
mod recv;
mod send;
pub mod session;
pub mod stream;
pub mod timer;
pub mod varint;

pub use config::{Mode, Role, Settings, TransportSettings};
pub use error::{Error, Result};
pub use session::Session;
pub use timer::{TimerHandle, TimerSlot};

pub use hqm_x::{Header, HeaderCodec, Path, StreamId, TransportEngine};

/// Opaque per-stream (or session) user token carried through callbacks.
///
/// Streams the user never named get a unique default token allocated from
/// the top half of the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserHandle(pub u64);

/// Flags accompanying a delivered header field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadersFlags {
    /// This header block ends the request or response.
    pub end_request: bool,
    /// This is a trailer block, delivered after body data.
    pub trailers: bool,
}

/// Outcome of a socket callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketIo {
    /// Bytes transferred.
    Data(usize),
    /// Nothing transferable right now; surfaces as *session-blocked*.
    WouldBlock,
    /// The peer is gone; surfaces as *session-closed* / *eof*.
    Eof,
}

/// Host callback table.
///
/// `recv` and `send` are required; everything else has a default so hosts
/// implement only what they care about. A host that leaves the timer hooks
/// alone (`supports_timers` false) runs the session purely reactively under
/// its own clock, with timer-driven recovery disabled.
pub trait SessionEvents {
    /// Read available socket bytes into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> SocketIo;

    /// Write one packet to the socket.
    fn send(&mut self, buf: &[u8]) -> SocketIo;

    /// Whether the three timer hooks below are implemented.
    fn supports_timers(&self) -> bool {
        false
    }

    /// Schedule a callback in `seconds`; the host must later call
    /// [`Session::on_timer_fired`] with `slot`. Returns a host-chosen handle.
    fn set_timer(&mut self, _seconds: f64, _slot: TimerSlot) -> Option<TimerHandle> {
        None
    }

    fn reset_timer(&mut self, _handle: TimerHandle, _seconds: f64) {}

    fn cancel_timer(&mut self, _handle: TimerHandle) {}

    /// A header block is about to be delivered for `stream_user`.
    fn on_begin_headers(
        &mut self,
        _session_user: UserHandle,
        _stream_user: UserHandle,
    ) -> Result<()> {
        Ok(())
    }

    /// One decoded header field.
    fn on_headers(&mut self, _flags: HeadersFlags, _hdr: Header, _stream_user: UserHandle) -> Result<()> {
        Ok(())
    }

    /// A contiguous run of body bytes at `offset` within the body.
    fn on_data_recv(&mut self, _end_data: bool, _data: &[u8], _offset: u64, _stream_user: UserHandle) {
    }

    /// The peer promised a push. Return `false` to decline it.
    fn on_begin_promise(
        &mut self,
        _session_user: UserHandle,
        _parent_stream_user: UserHandle,
        _promise_user: UserHandle,
    ) -> bool {
        false
    }

    /// A request finished; `status` is `Ok` for a clean close.
    fn on_request_close(&mut self, _status: Result<()>, _stream_user: UserHandle) {}
}
