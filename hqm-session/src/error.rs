//! Error kinds, boundary translation and HTTP/QUIC wire error codes.
//!
//! Three layers of error meet here: the session's own error kinds, the
//! engine-reported [`EngineError`]s translated at the boundary, and the
//! HTTP/QUIC application error codes that ride in stream-close signalling.

use hqm_x::EngineError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Session-level error kinds.
///
/// `SessionBlocked`, `NoMoreData` and `Eof` are flow-control statuses rather
/// than failures; they report why an entry point made no progress.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("session closed")]
    SessionClosed,
    #[error("session blocked")]
    SessionBlocked,
    #[error("no more data")]
    NoMoreData,
    #[error("out of memory")]
    OutOfMemory,
    #[error("internal error")]
    Internal,
    #[error("transport error")]
    Transport,
    #[error("transport protocol violation")]
    TransportProtocol,
    #[error("unsupported transport version")]
    TransportVersion,
    #[error("crypto failure")]
    Crypto,
    #[error("bad user data")]
    BadUserData,
    #[error("client-only operation")]
    ClientOnly,
    #[error("server-only operation")]
    ServerOnly,
    #[error("too many requests")]
    TooManyRequests,
    #[error("push limit reached")]
    PushLimitReached,
    #[error("invalid push limit")]
    InvalidPushLimit,
    #[error("request closed")]
    RequestClosed,
    #[error("trailers not promised")]
    TrailersNotPromised,
    #[error("header compression failure")]
    HdrCompressFailure,
    #[error("push refused")]
    PushRefused,
    #[error("push already in cache")]
    PushAlreadyInCache,
    #[error("not interested")]
    NotInterested,
    #[error("frame received on wrong stream")]
    WrongStream,
    #[error("connect error")]
    ConnectError,
    #[error("ALPN negotiation failed")]
    AlpnFailed,
    #[error("malformed frame")]
    MalformedFrame,
    #[error("duplicate push")]
    DuplicatePush,
    #[error("end of file")]
    Eof,
    #[error("generic failure")]
    Generic,
}

impl Error {
    /// Whether this error leaves the whole session unusable, as opposed to
    /// closing a single stream.
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            Error::SessionClosed
                | Error::OutOfMemory
                | Error::Internal
                | Error::Transport
                | Error::TransportProtocol
                | Error::TransportVersion
                | Error::Crypto
                | Error::Eof
                | Error::Generic
        )
    }
}

/// Translate an engine-reported error at the session boundary.
///
/// The stream-write soft failures (`StreamDataBlocked`, `StreamShutWr`,
/// `StreamNotFound`) are absorbed inside the send scheduler and never reach
/// this function from that path.
impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NoMem => Error::OutOfMemory,
            EngineError::NoBuf => Error::Internal,
            EngineError::Proto => Error::TransportProtocol,
            EngineError::Version => Error::TransportVersion,
            EngineError::TlsDecrypt => Error::Crypto,
            EngineError::CallbackFailure => Error::Internal,
            EngineError::InvalidState => Error::SessionClosed,
            EngineError::PktNumExhausted => Error::TransportProtocol,
            EngineError::StreamDataBlocked
            | EngineError::StreamShutWr
            | EngineError::StreamNotFound => Error::Transport,
            EngineError::Fatal => Error::Transport,
        }
    }
}

impl From<hqm_x::CodecError> for Error {
    fn from(_: hqm_x::CodecError) -> Self {
        Error::HdrCompressFailure
    }
}

/// HTTP/QUIC application error codes carried on stream close.
pub mod app_error {
    pub const STOPPING: u64 = 0x00;
    pub const HTTP_NO_ERROR: u64 = 0x01;
    pub const HTTP_PUSH_REFUSED: u64 = 0x02;
    pub const HTTP_INTERNAL_ERROR: u64 = 0x03;
    pub const HTTP_PUSH_ALREADY_IN_CACHE: u64 = 0x04;
    pub const HTTP_REQUEST_CANCELLED: u64 = 0x05;
    pub const HTTP_HPACK_DECOMPRESSION_FAILED: u64 = 0x06;
    pub const HTTP_CONNECT_ERROR: u64 = 0x07;
    pub const HTTP_EXCESSIVE_LOAD: u64 = 0x08;
    pub const HTTP_VERSION_FALLBACK: u64 = 0x09;
    pub const HTTP_WRONG_STREAM: u64 = 0x0A;
    pub const HTTP_PUSH_LIMIT_EXCEEDED: u64 = 0x0B;
    pub const HTTP_DUPLICATE_PUSH: u64 = 0x0C;
    pub const HTTP_MALFORMED_DATA_FRAME: u64 = 0x0100;
    pub const HTTP_MALFORMED_HEADERS_FRAME: u64 = 0x0101;
    pub const HTTP_MALFORMED_PRIORITY_FRAME: u64 = 0x0102;
    pub const HTTP_MALFORMED_CANCEL_PUSH_FRAME: u64 = 0x0103;
    pub const HTTP_MALFORMED_SETTINGS_FRAME: u64 = 0x0104;
    pub const HTTP_MALFORMED_PUSH_PROMISE_FRAME: u64 = 0x0105;
    pub const HTTP_MALFORMED_GOAWAY_FRAME: u64 = 0x0107;
    pub const HTTP_MALFORMED_MAX_PUSH_ID: u64 = 0x010D;
}

/// Map a wire application error code on stream close to the user-visible
/// status passed to `on_request_close`.
pub fn status_from_app_error(code: u64) -> Result<()> {
    use app_error::*;
    match code {
        STOPPING | HTTP_NO_ERROR => Ok(()),
        HTTP_PUSH_REFUSED => Err(Error::PushRefused),
        HTTP_INTERNAL_ERROR => Err(Error::Internal),
        HTTP_PUSH_ALREADY_IN_CACHE => Err(Error::PushAlreadyInCache),
        HTTP_REQUEST_CANCELLED => Err(Error::NotInterested),
        HTTP_HPACK_DECOMPRESSION_FAILED => Err(Error::HdrCompressFailure),
        HTTP_CONNECT_ERROR => Err(Error::ConnectError),
        HTTP_EXCESSIVE_LOAD => Ok(()),
        HTTP_VERSION_FALLBACK => Err(Error::TransportVersion),
        HTTP_WRONG_STREAM => Err(Error::WrongStream),
        HTTP_PUSH_LIMIT_EXCEEDED => Err(Error::PushLimitReached),
        HTTP_DUPLICATE_PUSH => Err(Error::DuplicatePush),
        HTTP_MALFORMED_DATA_FRAME..=HTTP_MALFORMED_MAX_PUSH_ID => Err(Error::MalformedFrame),
        _ => Err(Error::Internal),
    }
}

/// Inverse mapping: the wire code used when the session itself resets a
/// stream for a given error.
pub fn app_error_for(error: Error) -> u64 {
    use app_error::*;
    match error {
        Error::PushRefused => HTTP_PUSH_REFUSED,
        Error::PushAlreadyInCache => HTTP_PUSH_ALREADY_IN_CACHE,
        Error::NotInterested => HTTP_REQUEST_CANCELLED,
        Error::HdrCompressFailure => HTTP_HPACK_DECOMPRESSION_FAILED,
        Error::ConnectError => HTTP_CONNECT_ERROR,
        Error::TransportVersion => HTTP_VERSION_FALLBACK,
        Error::WrongStream => HTTP_WRONG_STREAM,
        Error::PushLimitReached => HTTP_PUSH_LIMIT_EXCEEDED,
        Error::DuplicatePush => HTTP_DUPLICATE_PUSH,
        Error::MalformedFrame => HTTP_MALFORMED_HEADERS_FRAME,
        Error::RequestClosed => HTTP_REQUEST_CANCELLED,
        _ => HTTP_INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_status_mapping() {
        assert_eq!(status_from_app_error(app_error::HTTP_NO_ERROR), Ok(()));
        assert_eq!(
            status_from_app_error(app_error::HTTP_PUSH_REFUSED),
            Err(Error::PushRefused)
        );
        assert_eq!(
            status_from_app_error(app_error::HTTP_REQUEST_CANCELLED),
            Err(Error::NotInterested)
        );
        assert_eq!(
            status_from_app_error(app_error::HTTP_MALFORMED_SETTINGS_FRAME),
            Err(Error::MalformedFrame)
        );
        // Unknown codes default to internal-error.
        assert_eq!(status_from_app_error(0xBEEF), Err(Error::Internal));
    }

    #[test]
    fn test_engine_error_translation() {
        assert_eq!(Error::from(EngineError::NoBuf), Error::Internal);
        assert_eq!(Error::from(EngineError::Proto), Error::TransportProtocol);
        assert_eq!(Error::from(EngineError::TlsDecrypt), Error::Crypto);
        assert_eq!(Error::from(EngineError::NoMem), Error::OutOfMemory);
    }

    #[test]
    fn test_fatality_classification() {
        assert!(Error::Crypto.is_session_fatal());
        assert!(Error::TransportProtocol.is_session_fatal());
        assert!(!Error::WrongStream.is_session_fatal());
        assert!(!Error::MalformedFrame.is_session_fatal());
        assert!(!Error::RequestClosed.is_session_fatal());
    }
}
