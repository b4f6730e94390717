//! The session façade: construction, the receive loop, request/push
//! submission, header/body feeding, close, and the small negotiation
//! helpers (transport parameters, ALPN, session ids).

use crate::buffer::Segment;
use crate::config::{
    Mode, Role, Settings, TransportSettings, BUFFER_READ_SIZE, CONTROL_STREAM_CLIENT,
    CONTROL_STREAM_SERVER, INIT_REQUEST_STREAM_ID,
};
use crate::error::{app_error, app_error_for, status_from_app_error, Error, Result};
use crate::frame;
use crate::headers::{promises_trailers, HeaderContext};
use crate::map::StreamMap;
use crate::stream::{HttpState, Stream};
use crate::timer::{timestamp_now, TimerState};
use crate::varint;
use crate::{SessionEvents, SocketIo, UserHandle};
use bytes::BytesMut;
use hqm_x::{
    EngineError, Header, HeaderCodec, Path, StreamId, TransportEngine, TransportEvent,
};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// The single ALPN token this profile advertises.
pub const ALPN_HQM: &[u8] = b"hqm-05";

const TRANSPORT_PARAMS_INITIAL_SIZE: usize = 128;
const TRANSPORT_PARAMS_MAX_SIZE: usize = 512;

/// A per-connection HTTP-over-QUIC session.
///
/// Not safe for concurrent entry; callers serialise all calls on a given
/// session. Dropping the session releases every stream, promise and the
/// header-compression context.
pub struct Session {
    pub(crate) role: Role,
    pub(crate) mode: Mode,
    pub(crate) settings: Settings,
    pub(crate) max_packet_size: usize,
    pub(crate) session_id: Vec<u8>,
    pub(crate) handshake_complete: bool,
    pub(crate) max_open_requests: u64,
    pub(crate) max_open_server_pushes: u64,
    pub(crate) highest_bidi_stream_id: u64,
    pub(crate) highest_uni_stream_id: u64,
    pub(crate) next_push_promise: u64,
    pub(crate) max_push_promise: u64,
    pub(crate) transfers: StreamMap,
    pub(crate) promises: StreamMap,
    pub(crate) hdr_ctx: HeaderContext,
    pub(crate) engine: Box<dyn TransportEngine>,
    pub(crate) callbacks: Box<dyn SessionEvents>,
    pub(crate) path: Path,
    /// Pre-built packets awaiting the socket send callback.
    pub(crate) send_queue: VecDeque<Vec<u8>>,
    /// Received (or fabricated) packets awaiting the engine.
    pub(crate) recv_queue: VecDeque<Vec<u8>>,
    /// Our own packet number on the fabricated reverse path.
    pub(crate) remote_pktnum: u8,
    /// Last observed remote packet number, for expanding truncated ones.
    pub(crate) last_remote_pkt_num: u64,
    pub(crate) loss_timer: TimerState,
    pub(crate) ack_timer: TimerState,
    pub(crate) session_user_data: UserHandle,
    next_handle: u64,
    /// A multicast goaway was observed mid-receive; acted on once the
    /// stream under processing is back in the map.
    pub(crate) pending_close: bool,
    pub(crate) closed: bool,
}

impl Session {
    fn new_common(
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionEvents>,
        settings: Settings,
        transport: &TransportSettings,
        role: Role,
        session_user_data: UserHandle,
    ) -> Result<Self> {
        transport.validate().map_err(|reason| {
            error!(%reason, "invalid transport settings");
            Error::BadUserData
        })?;

        let mut session = Session {
            role,
            mode: transport.mode,
            settings,
            max_packet_size: transport.max_packet_size,
            session_id: transport.session_id.clone(),
            handshake_complete: false,
            max_open_requests: transport.max_open_requests,
            max_open_server_pushes: transport.max_open_server_pushes,
            highest_bidi_stream_id: 0,
            highest_uni_stream_id: 0,
            next_push_promise: 0,
            max_push_promise: 0,
            transfers: StreamMap::new(),
            promises: StreamMap::new(),
            hdr_ctx: HeaderContext::new(codec),
            engine,
            callbacks,
            path: transport.path.clone(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            remote_pktnum: 2,
            last_remote_pkt_num: 0,
            loss_timer: TimerState::default(),
            ack_timer: TimerState::default(),
            session_user_data,
            next_handle: 0,
            pending_close: false,
            closed: false,
        };

        // Stream 0 anchors the (possibly fabricated) handshake in every
        // session and never carries application traffic.
        let handle = session.alloc_handle();
        session
            .transfers
            .add(0, Stream::with_id(0, handle))
            .map_err(|_| Error::Internal)?;

        session.apply_mode_limits();

        Ok(session)
    }

    fn apply_mode_limits(&mut self) {
        use crate::config::MULTICAST_MAX_UNI_STREAM_ID;
        match self.mode {
            Mode::Multicast => {
                debug!("starting a new multicast session");
                self.highest_bidi_stream_id = INIT_REQUEST_STREAM_ID;
                self.highest_uni_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                self.max_push_promise = MULTICAST_MAX_UNI_STREAM_ID;
            }
            Mode::Unicast => {
                debug!("starting a new unicast session");
                self.highest_bidi_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                self.highest_uni_stream_id = MULTICAST_MAX_UNI_STREAM_ID;
                self.max_push_promise = 0;
            }
        }
    }

    /// Build a client session. In multicast mode this drives the engine
    /// through the entire fabricated handshake before returning.
    pub fn new_client(
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionEvents>,
        settings: Settings,
        transport: &TransportSettings,
        session_user_data: UserHandle,
    ) -> Result<Self> {
        let mut session = Self::new_common(
            engine,
            codec,
            callbacks,
            settings,
            transport,
            Role::Client,
            session_user_data,
        )?;

        // Claim the stream-0 anchor from the engine's id space.
        let anchor = session.engine.open_bidi_stream().map_err(Error::from)?;
        if anchor.0 != 0 {
            error!(stream = %anchor, "engine allocated a non-zero anchor stream");
            return Err(Error::Internal);
        }

        if session.mode == Mode::Multicast {
            session.multicast_client_start()?;
        }

        session.open_control_stream(CONTROL_STREAM_CLIENT)?;
        session.process_engine_events()?;

        Ok(session)
    }

    /// Build a server session. In multicast mode this feeds the engine a
    /// fabricated client so the one-way bearer looks two-sided.
    pub fn new_server(
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionEvents>,
        settings: Settings,
        transport: &TransportSettings,
        session_user_data: UserHandle,
    ) -> Result<Self> {
        let mut session = Self::new_common(
            engine,
            codec,
            callbacks,
            settings,
            transport,
            Role::Server,
            session_user_data,
        )?;

        if session.mode == Mode::Multicast {
            session.multicast_server_start()?;
        }

        session.open_control_stream(CONTROL_STREAM_SERVER)?;
        session.process_engine_events()?;

        Ok(session)
    }

    /// Open the local control stream and announce our settings on it.
    fn open_control_stream(&mut self, expected_id: u64) -> Result<()> {
        let id = self.engine.open_uni_stream().map_err(Error::from)?;
        if id.0 != expected_id {
            // Control streams live on fixed ids; anything else means the
            // engine's id space is out of step with ours.
            error!(stream = %id, expected_id, "control stream landed on the wrong id");
            return Err(Error::Internal);
        }
        let handle = self.alloc_handle();
        self.transfers
            .add(id.0, Stream::with_id(id.0, handle))
            .map_err(|_| Error::Internal)?;

        let settings_frame = frame::create_settings_frame(&[(
            frame::SETTINGS_MAX_FIELD_SECTION_SIZE,
            self.settings.max_field_section_size,
        )]);
        self.queue_send_frame(id.0, &settings_frame)?;
        debug!(stream = id.0, "queued SETTINGS on control stream");
        Ok(())
    }

    pub(crate) fn alloc_handle(&mut self) -> UserHandle {
        let handle = UserHandle((1 << 63) | self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn max_client_requests(&self) -> u64 {
        self.max_open_requests
    }

    pub fn max_pushed(&self) -> u64 {
        self.max_open_server_pushes
    }

    /// Push promises still available before the limit trips.
    pub fn remaining_promises(&self) -> u64 {
        self.max_push_promise - self.next_push_promise
    }

    /// Raise the number of promises the client will accept and announce the
    /// new ceiling with MAX_PUSH_ID.
    pub fn set_max_promises(&mut self, extra: u64) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }
        if self.next_push_promise + extra < self.max_push_promise {
            return Err(Error::InvalidPushLimit);
        }

        self.max_push_promise = self.next_push_promise + extra;
        let frame = frame::create_max_push_id_frame(self.max_push_promise);
        self.queue_send_frame(CONTROL_STREAM_CLIENT, &frame)
    }

    /// Rebind a request's (or unmaterialised promise's) user handle.
    pub fn set_request_user_data(&mut self, current: UserHandle, new: UserHandle) -> Result<()> {
        if let Some(stream) = self.transfers.find_by_user_mut(current) {
            debug!(stream = ?stream.stream_id, "rebinding request user data");
            stream.user_data = new;
            return Ok(());
        }
        if let Some(promise) = self.promises.find_by_user_mut(current) {
            debug!(push_id = ?promise.push_id, "rebinding promise user data");
            promise.user_data = new;
            return Ok(());
        }
        Err(Error::BadUserData)
    }

    pub fn set_session_user_data(&mut self, current: UserHandle, new: UserHandle) -> Result<()> {
        if current != self.session_user_data {
            return Err(Error::BadUserData);
        }
        self.session_user_data = new;
        Ok(())
    }

    /// Submit a client request: headers, optional body, and the final flag.
    pub fn submit_request(
        &mut self,
        hdrs: &[Header],
        body: Option<&[u8]>,
        fin: bool,
        user: UserHandle,
    ) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }

        if self.mode == Mode::Multicast {
            // The one request a multicast receiver has is the init request
            // stream; submission just names it.
            if let Some(stream) = self.transfers.find_mut(INIT_REQUEST_STREAM_ID) {
                stream.user_data = user;
            }
            return Ok(());
        }

        if self.max_open_requests <= self.transfers.num_requests() as u64 {
            return Err(Error::TooManyRequests);
        }

        let stream_id = self.req_stream_new(user)?;

        if let Err(e) = self.feed_headers(hdrs, fin && body.is_none(), user) {
            self.transfers.remove(stream_id);
            return Err(e);
        }

        if let Some(body) = body {
            self.feed_payload_data(body, fin, user)?;
        }

        Ok(())
    }

    fn req_stream_new(&mut self, user: UserHandle) -> Result<u64> {
        let id = self.engine.open_bidi_stream().map_err(Error::from)?;
        let stream = Stream::with_id(id.0, user);
        self.transfers.add(id.0, stream).map_err(|_| {
            error!(stream = %id, "engine reused a live stream id");
            Error::Internal
        })?;
        Ok(id.0)
    }

    /// Announce a server push tied to an existing request stream.
    pub fn submit_push_promise(
        &mut self,
        init_request_user: UserHandle,
        hdrs: &[Header],
        promised_user: UserHandle,
    ) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }
        if self.next_push_promise >= self.max_push_promise {
            return Err(Error::PushLimitReached);
        }

        let init_stream_id = if self.mode == Mode::Multicast {
            INIT_REQUEST_STREAM_ID
        } else {
            self.transfers
                .search_user(init_request_user)
                .ok_or(Error::BadUserData)?
        };

        let push_id = self.next_push_promise;
        debug!(push_id, num_hdrs = hdrs.len(), "creating push promise");

        let frame = frame::create_push_promise_frame(&mut self.hdr_ctx, push_id, hdrs)?;

        let mut promised = Stream::new(promised_user);
        promised.push_id = Some(push_id);
        self.promises
            .add(push_id, promised)
            .map_err(|_| Error::Internal)?;
        self.next_push_promise += 1;

        let init_stream = self
            .transfers
            .find_mut(init_stream_id)
            .ok_or(Error::Internal)?;
        init_stream.send_buf.push(Segment::new(&frame, 0, false));

        Ok(())
    }

    /// Feed a header block for a request, a response, trailers, or — when
    /// `user` names an unmaterialised promise — the push response, which
    /// materialises the promise onto a fresh unidirectional stream.
    pub fn feed_headers(&mut self, hdrs: &[Header], fin: bool, user: UserHandle) -> Result<()> {
        debug!(num_hdrs = hdrs.len(), fin, "feeding headers");

        if let Some(stream_id) = self.transfers.search_user(user) {
            let (send_state, trailers_ok) = {
                let stream = self.transfers.find(stream_id).ok_or(Error::Internal)?;
                (stream.send_state, stream.trailers_promised)
            };

            let next_state = match send_state {
                HttpState::Open | HttpState::Hdrs => HttpState::Hdrs,
                HttpState::Body => {
                    if trailers_ok {
                        HttpState::Trailers
                    } else {
                        return Err(Error::TrailersNotPromised);
                    }
                }
                HttpState::Trailers => HttpState::Trailers,
                HttpState::Done => {
                    error!(stream = stream_id, "headers fed to a closed stream");
                    return Err(Error::RequestClosed);
                }
            };

            let frame = frame::create_headers_frame(&mut self.hdr_ctx, None, hdrs)?;
            let stream = self.transfers.find_mut(stream_id).ok_or(Error::Internal)?;
            if next_state <= HttpState::Hdrs && promises_trailers(hdrs) {
                stream.trailers_promised = true;
            }
            stream.send_state = next_state;
            stream.send_buf.push(Segment::new(&frame, 0, fin));
            return Ok(());
        }

        // Start of a server push: materialise the promise on a new
        // unidirectional stream.
        let push_id = self
            .promises
            .search_user(user)
            .ok_or(Error::BadUserData)?;

        if self.max_open_server_pushes <= self.transfers.num_pushes() as u64 {
            return Err(Error::TooManyRequests);
        }

        let stream_id = self.engine.open_uni_stream().map_err(|e| {
            error!(error = %e, "opening push stream failed");
            Error::Internal
        })?;

        let mut promised = self.promises.remove(push_id).ok_or(Error::Internal)?;
        promised.stream_id = Some(stream_id);
        promised.send_state = HttpState::Hdrs;
        if promises_trailers(hdrs) {
            promised.trailers_promised = true;
        }

        debug!(push_id, stream = %stream_id, "materialising push promise");

        // Stream preamble: push stream type then the push-id it fulfils.
        let mut preamble = BytesMut::with_capacity(16);
        varint::put(0x01, &mut preamble);
        varint::put(push_id, &mut preamble);
        promised.send_buf.push(Segment::new(&preamble, 0, false));

        let frame = frame::create_headers_frame(&mut self.hdr_ctx, Some(push_id), hdrs)?;
        promised.send_buf.push(Segment::new(&frame, 0, fin));

        self.transfers
            .add(stream_id.0, promised)
            .map_err(|_| Error::Internal)?;

        Ok(())
    }

    /// Feed request or response body bytes.
    pub fn feed_payload_data(&mut self, data: &[u8], fin: bool, user: UserHandle) -> Result<usize> {
        let stream_id = self
            .transfers
            .search_user(user)
            .ok_or(Error::BadUserData)?;
        debug!(stream = stream_id, len = data.len(), fin, "feeding payload");

        let stream = self.transfers.find_mut(stream_id).ok_or(Error::Internal)?;
        if stream.send_state > HttpState::Body {
            return Err(Error::RequestClosed);
        }
        stream.send_state = HttpState::Body;

        let frame = frame::create_data_frame(data);
        stream.send_buf.push(Segment::new(&frame, 0, fin));

        Ok(data.len())
    }

    /// Cancel an in-flight request, or an unmaterialised promise (which
    /// emits CANCEL_PUSH on the local control stream instead of touching
    /// the transport engine).
    pub fn end_request(&mut self, status: Result<()>, user: UserHandle) -> Result<()> {
        if let Some(stream_id) = self.transfers.search_user(user) {
            let code = if status.is_err() {
                app_error::HTTP_INTERNAL_ERROR
            } else {
                app_error::HTTP_NO_ERROR
            };
            return self
                .engine
                .shutdown_stream(StreamId(stream_id), code)
                .map_err(Error::from);
        }

        let push_id = self
            .promises
            .search_user(user)
            .ok_or(Error::RequestClosed)?;
        self.promises.remove(push_id);

        let frame = frame::create_cancel_push_frame(push_id);
        let control = match self.role {
            Role::Client => CONTROL_STREAM_CLIENT,
            Role::Server => CONTROL_STREAM_SERVER,
        };
        self.queue_send_frame(control, &frame)
    }

    /// Append a pre-encoded frame to a stream's send queue.
    pub fn queue_send_frame(&mut self, stream_id: u64, frame: &[u8]) -> Result<()> {
        match self.transfers.find_mut(stream_id) {
            Some(stream) => {
                stream.send_buf.push(Segment::new(frame, 0, false));
                Ok(())
            }
            None => Err(Error::Internal),
        }
    }

    /// Pull socket bytes through the engine and dispatch the consequences.
    ///
    /// Returns `Ok` after processing at least one packet, `NoMoreData` when
    /// the socket had nothing, `SessionClosed` once the session is done.
    pub fn recv(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        loop {
            let mut buf = vec![0u8; BUFFER_READ_SIZE];
            match self.callbacks.recv(&mut buf) {
                SocketIo::Data(0) | SocketIo::WouldBlock => break,
                SocketIo::Data(n) => {
                    buf.truncate(n);
                    self.recv_queue.push_back(buf);
                }
                SocketIo::Eof => return Err(Error::SessionClosed),
            }
        }

        let mut rv = Err(Error::NoMoreData);

        while let Some(pkt) = self.recv_queue.pop_front() {
            let now = timestamp_now();
            if let Err(e) = self.engine.read_pkt(&self.path, &pkt, now) {
                error!(error = %e, "engine rejected packet");
                return Err(if e == EngineError::TlsDecrypt {
                    Error::Crypto
                } else {
                    Error::from(e)
                });
            }

            self.process_engine_events()?;
            self.update_timers()?;
            rv = Ok(());

            if self.engine.is_in_draining_period() {
                return Err(Error::SessionClosed);
            }

            if self.pending_close {
                // Multicast goaway observed: transition to closed and drop
                // whatever else the bearer delivered.
                self.pending_close = false;
                let _ = self.close(Ok(()));
                self.recv_queue.clear();
                return Err(Error::SessionClosed);
            }
        }

        rv
    }

    /// Drain engine events after packets were fed in.
    pub(crate) fn process_engine_events(&mut self) -> Result<()> {
        while let Some(event) = self.engine.poll_event() {
            match event {
                TransportEvent::HandshakeCompleted => {
                    debug!("handshake completed");
                    self.handshake_complete = true;
                }
                TransportEvent::StreamOpened { stream_id } => {
                    self.handle_stream_open(stream_id);
                }
                TransportEvent::StreamData {
                    stream_id,
                    offset,
                    data,
                    fin,
                } => {
                    self.handle_stream_data(stream_id, offset, &data, fin)?;
                }
                TransportEvent::StreamClosed {
                    stream_id,
                    app_error_code,
                } => {
                    self.handle_stream_close(stream_id, app_error_code);
                }
            }
        }
        Ok(())
    }

    fn handle_stream_open(&mut self, stream_id: StreamId) {
        if self.transfers.contains(stream_id.0) {
            return;
        }
        let limit = if stream_id.is_bidirectional() {
            self.highest_bidi_stream_id
        } else {
            self.highest_uni_stream_id
        };
        if stream_id.0 > limit {
            warn!(stream = %stream_id, limit, "peer opened a stream beyond the profile limit");
            return;
        }
        debug!(stream = %stream_id, "peer opened stream");
        let handle = self.alloc_handle();
        let _ = self
            .transfers
            .add(stream_id.0, Stream::with_id(stream_id.0, handle));
    }

    fn handle_stream_data(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<()> {
        if !self.transfers.contains(stream_id.0) {
            self.handle_stream_open(stream_id);
            if !self.transfers.contains(stream_id.0) {
                return Ok(());
            }
        }

        // The stream is taken out of the map while its bytes are processed,
        // so frame handlers can freely mutate the session.
        let mut stream = self.transfers.remove(stream_id.0).ok_or(Error::Internal)?;
        let result = self.recv_stream_data(&mut stream, data, offset, fin);
        self.transfers
            .add(stream_id.0, stream)
            .map_err(|_| Error::Internal)?;

        match result {
            Ok(()) => Ok(()),
            // Declining a promise aborts this receive pass but closes
            // nothing; the caller decides what to do with the push.
            Err(Error::NotInterested) => Err(Error::NotInterested),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                // Stream-level: reset just this stream and carry on.
                warn!(stream = %stream_id, error = %e, "closing stream after receive error");
                let _ = self
                    .engine
                    .shutdown_stream(stream_id, app_error_for(e));
                if let Some(stream) = self.transfers.remove(stream_id.0) {
                    self.callbacks.on_request_close(Err(e), stream.user_data);
                }
                Ok(())
            }
        }
    }

    fn handle_stream_close(&mut self, stream_id: StreamId, app_error_code: u64) {
        debug!(stream = %stream_id, code = app_error_code, "stream closed");
        let Some(stream) = self.transfers.remove(stream_id.0) else {
            return;
        };
        let status = status_from_app_error(app_error_code);
        if let Err(e) = status {
            if e == Error::Internal && app_error_code != app_error::HTTP_INTERNAL_ERROR {
                error!(code = app_error_code, "unknown HTTP/QUIC error code");
            }
        }
        self.callbacks.on_request_close(status, stream.user_data);
    }

    /// Close the session.
    ///
    /// A multicast server synthesises the goaway push-promise on the init
    /// request stream; a unicast session asks the engine for a
    /// CONNECTION_CLOSE packet.
    pub fn close(&mut self, reason: Result<()>) -> Result<()> {
        debug!(?reason, "closing session");

        // Stop every transfer above the init request stream.
        for id in self.transfers.keys() {
            if id <= INIT_REQUEST_STREAM_ID {
                continue;
            }
            if let Some(stream) = self.transfers.remove(id) {
                let _ = self
                    .engine
                    .shutdown_stream(StreamId(id), app_error::HTTP_REQUEST_CANCELLED);
                self.callbacks
                    .on_request_close(Err(Error::NotInterested), stream.user_data);
            }
        }

        match self.mode {
            Mode::Multicast => {
                if self.role == Role::Server {
                    // The goaway marker: a push promise for a fictional
                    // resource every receiver recognises.
                    if self.transfers.contains(INIT_REQUEST_STREAM_ID) {
                        let init_user = self
                            .transfers
                            .find(INIT_REQUEST_STREAM_ID)
                            .map(|s| s.user_data)
                            .unwrap_or(self.session_user_data);
                        let goaway_user = self.alloc_handle();

                        let req = [
                            Header::new(":method", "GET"),
                            Header::new(":scheme", "http"),
                            Header::new(":path", "goaway"),
                            Header::new("connection", "close"),
                        ];
                        let resp = [
                            Header::new(":status", "200"),
                            Header::new("connection", "close"),
                        ];

                        self.submit_push_promise(init_user, &req, goaway_user)?;
                        self.feed_headers(&resp, true, goaway_user)?;
                    } else {
                        // No init request stream to announce the goaway on.
                        warn!("closing a multicast server with no init request stream");
                    }
                }
            }
            Mode::Unicast => {
                let mut buf = vec![0u8; self.max_packet_size];
                let n = self
                    .engine
                    .write_connection_close(&self.path, &mut buf, 0, timestamp_now())
                    .map_err(|e| match e {
                        EngineError::NoMem => Error::OutOfMemory,
                        EngineError::NoBuf | EngineError::CallbackFailure => Error::Internal,
                        EngineError::InvalidState => Error::SessionClosed,
                        EngineError::PktNumExhausted => Error::TransportProtocol,
                        _ => Error::Generic,
                    })?;
                buf.truncate(n);
                self.send_queue.push_back(buf);
            }
        }

        self.closed = true;
        info!("session closed");
        Ok(())
    }

    /// Encode the local transport parameters, with the multicast fixed
    /// values applied, retrying through doubled buffers up to the cap.
    pub fn local_transport_params(&self) -> Result<Vec<u8>> {
        let mut params = self.engine.local_transport_params();

        if self.mode == Mode::Multicast {
            params.initial_max_streams_uni = 0x3fffffff;
            params.initial_max_streams_bidi = INIT_REQUEST_STREAM_ID;
            params.active_connection_id_limit = 0;
        }

        let mut size = TRANSPORT_PARAMS_INITIAL_SIZE;
        loop {
            let mut buf = vec![0u8; size];
            if let Some(n) = params.encode_into(&mut buf) {
                buf.truncate(n);
                return Ok(buf);
            }
            if size >= TRANSPORT_PARAMS_MAX_SIZE {
                return Err(Error::Internal);
            }
            size *= 2;
        }
    }

    /// Install the peer's transport parameter blob into the engine.
    pub fn feed_transport_params(&mut self, buf: &[u8]) -> Result<()> {
        let params = hqm_x::TransportParams::decode(buf).map_err(|e| {
            error!(error = %e, "transport parameter decode failed");
            Error::TransportProtocol
        })?;

        debug!(?params, "remote transport parameters");

        self.engine
            .set_remote_transport_params(&params)
            .map_err(|e| match e {
                EngineError::Proto => Error::TransportProtocol,
                other => Error::from(other),
            })
    }

    /// Pick our ALPN token out of a peer's length-prefixed offer list.
    pub fn select_alpn<'a>(&self, offered: &'a [u8]) -> Result<&'a [u8]> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }

        let mut idx = 0;
        while idx < offered.len() {
            let len = offered[idx] as usize;
            let Some(token) = offered.get(idx + 1..idx + 1 + len) else {
                break;
            };
            if token == ALPN_HQM {
                return Ok(token);
            }
            idx += len + 1;
        }
        Err(Error::AlpnFailed)
    }
}

/// The advertised protocol list in wire format, re-encoded per call.
pub fn alpn_protocols() -> Vec<u8> {
    let mut out = Vec::with_capacity(ALPN_HQM.len() + 1);
    out.push(ALPN_HQM.len() as u8);
    out.extend_from_slice(ALPN_HQM);
    out
}

/// Decode a hex session-id string. Odd-length input is zero-extended on the
/// left, so `"abc"` becomes `[0x0a, 0xbc]`.
pub fn session_id_from_hex(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = vec![0u8; bytes.len() / 2 + bytes.len() % 2];
    let mut idx = 0;
    let mut lower = bytes.len() % 2 == 1;

    for &ch in bytes {
        let nibble = match ch {
            b'0'..=b'9' => ch - b'0',
            b'A'..=b'F' => ch - b'A' + 10,
            b'a'..=b'f' => ch - b'a' + 10,
            _ => {
                error!(char = %(ch as char), "invalid hex in session id");
                return Err(Error::Generic);
            }
        };
        if lower {
            out[idx] |= nibble;
            idx += 1;
            lower = false;
        } else {
            out[idx] |= nibble << 4;
            lower = true;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_hex_even() {
        assert_eq!(session_id_from_hex("0a1b").unwrap(), vec![0x0a, 0x1b]);
        assert_eq!(
            session_id_from_hex("DEADBEEF").unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_session_id_from_hex_odd() {
        assert_eq!(session_id_from_hex("abc").unwrap(), vec![0x0a, 0xbc]);
        assert_eq!(session_id_from_hex("1").unwrap(), vec![0x01]);
    }

    #[test]
    fn test_session_id_from_hex_invalid() {
        assert!(session_id_from_hex("xyz").is_err());
    }

    #[test]
    fn test_alpn_protocols_wire_format() {
        assert_eq!(alpn_protocols(), b"\x06hqm-05".to_vec());
    }
}
