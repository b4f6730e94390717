//! The reassembly engine: inserting received stream bytes, carving them
//! into frames, filling active frames through their gap lists, and
//! dispatching completed frames to the per-type handlers.

use crate::config::{
    CONTROL_STREAM_CLIENT, CONTROL_STREAM_SERVER, PUSH_PROMISE_STREAM_ID,
};
use crate::error::{Error, Result};
use crate::frame::{self, FrameType};
use crate::session::Session;
use crate::stream::{ActiveFrame, HttpState, Stream};
use crate::varint;
use crate::{HeadersFlags, Mode, Role, UserHandle};
use hqm_x::{Header, StreamId};
use tracing::{debug, error, info, warn};

/// A peer-initiated unidirectional stream that is not the peer's control
/// stream carries a pushed response.
fn is_server_push_stream(id: StreamId) -> bool {
    id.is_unidirectional() && id.is_server_initiated() && id.0 != CONTROL_STREAM_SERVER
}

impl Session {
    /// Accept stream bytes from the engine, tolerating arbitrary overlap,
    /// duplication and reordering within the stream.
    pub(crate) fn recv_stream_data(
        &mut self,
        stream: &mut Stream,
        data: &[u8],
        offset: u64,
        fin: bool,
    ) -> Result<()> {
        if !stream.started {
            return Err(Error::RequestClosed);
        }

        stream.recv_buf.insert(data, offset, fin);

        // A late-joining multicast receiver picks up the push-promise
        // stream from whatever bytes it first hears.
        if self.mode == Mode::Multicast && stream.id() == Some(PUSH_PROMISE_STREAM_ID) {
            if let Some(first) = stream.recv_buf.first_offset() {
                if first > stream.next_recv_offset {
                    debug!(from = stream.next_recv_offset, to = first,
                        "re-anchoring push-promise stream");
                    stream.next_recv_offset = first;
                }
            }
        }

        // Pushed-response streams open with a stream-type varint and the
        // push-id of the promise they materialise.
        if let Some(sid) = stream.stream_id {
            if is_server_push_stream(sid)
                && stream.next_recv_offset == 0
                && !self.consume_push_preamble(stream)?
            {
                return Ok(());
            }
        }

        self.extract_frames(stream)?;

        // Fill and dispatch to a fixed point: a dispatched HEADERS frame
        // can release DATA that was held back, which can complete and
        // dispatch further frames.
        loop {
            let mut progress = self.fill_frames(stream)?;
            progress |= self.dispatch_frames(stream)?;
            if !progress {
                break;
            }
        }

        Ok(())
    }

    /// Returns false when more bytes are needed for the preamble.
    fn consume_push_preamble(&mut self, stream: &mut Stream) -> Result<bool> {
        let (stream_type, push_id, preamble_len) = {
            let Some((bytes, _)) = stream.recv_buf.read_at(0) else {
                return Ok(false);
            };
            let Some((stream_type, n1)) = varint::decode(bytes) else {
                return Ok(false);
            };
            let Some((push_id, n2)) = varint::decode(&bytes[n1..]) else {
                return Ok(false);
            };
            (stream_type, push_id, n1 + n2)
        };

        if stream_type != 0x01 {
            error!(stream = ?stream.stream_id, stream_type,
                "expected the beginning of a pushed-response stream");
            return Err(Error::Generic);
        }

        stream.recv_buf.pop_range(0, preamble_len);
        stream.next_recv_offset = preamble_len as u64;
        stream.push_id = Some(push_id);

        // The stream now embodies its promise.
        if let Some(promise) = self.promises.remove(push_id) {
            debug!(push_id, stream = ?stream.stream_id, "promise materialised by peer");
            stream.user_data = promise.user_data;
            stream.trailers_promised |= promise.trailers_promised;
        } else {
            debug!(push_id, "pushed response for an unseen promise");
        }

        Ok(true)
    }

    /// Carve frames out of the contiguous run at `next_recv_offset`,
    /// reserving an active-frame slot per frame.
    fn extract_frames(&mut self, stream: &mut Stream) -> Result<()> {
        loop {
            let Some((bytes, seg_complete)) = stream.recv_buf.read_at(stream.next_recv_offset)
            else {
                break;
            };
            let Some(hdr) = frame::parse_frame_header(bytes) else {
                break;
            };
            if hdr.total_size() > self.settings.max_frame_size {
                error!(size = hdr.total_size(), "frame exceeds the configured ceiling");
                return Err(Error::MalformedFrame);
            }

            let at = stream.next_recv_offset;
            let size = hdr.total_size() as usize;
            let available = bytes.len();

            let mut active = ActiveFrame::new(hdr.frame_type, at, size);
            if hdr.frame_type == FrameType::Data {
                active.end_header_offset = at + hdr.header_len as u64;
                active.data_offset_adjust = active.end_header_offset - stream.data_frames_total;
                stream.data_frames_total += hdr.payload_len;
            }
            if seg_complete && size == available {
                active.complete = true;
            }

            stream.active_frames.push(active);
            stream.next_recv_offset = at + size as u64;
        }
        Ok(())
    }

    /// Copy buffered bytes into the active frames they land in, streaming
    /// DATA payload straight out to the user. Returns whether anything
    /// moved.
    fn fill_frames(&mut self, stream: &mut Stream) -> Result<bool> {
        let mut progress = false;
        let mut seg_idx = 0;

        loop {
            let Some((seg_off, seg_len)) = stream.recv_buf.nth_bounds(seg_idx) else {
                break;
            };
            if seg_off > stream.next_recv_offset {
                break;
            }

            let mut data_modified = false;
            for fi in 0..stream.active_frames.len() {
                let (frame_type, fill_at) = {
                    let f = &stream.active_frames[fi];
                    if !f.overlaps(seg_off, seg_len) {
                        continue;
                    }
                    (f.frame_type, seg_off.max(f.offset))
                };

                // Body bytes are held back until a header block has moved
                // the stream out of OPEN.
                if frame_type == FrameType::Data && stream.recv_state == HttpState::Open {
                    continue;
                }

                let Some((chunk, seg_complete)) = stream.recv_buf.read_at(fill_at) else {
                    continue;
                };
                let chunk = chunk.to_vec();
                let used = stream.active_frames[fi].fill(fill_at, &chunk, seg_complete);

                if frame_type == FrameType::Data {
                    if stream.recv_state == HttpState::Hdrs {
                        stream.recv_state = HttpState::Body;
                    }
                    let f = &stream.active_frames[fi];
                    let hdr_bytes = f.end_header_offset.saturating_sub(fill_at) as usize;
                    if used > hdr_bytes {
                        let body = &chunk[hdr_bytes..used];
                        let body_offset = fill_at + hdr_bytes as u64 - f.data_offset_adjust;
                        // END_DATA marks the delivery holding the final body
                        // byte, even when later-offset spans filled first.
                        let rel = (fill_at - f.offset) as usize;
                        let end_data = f.complete && rel + used == f.size;
                        // Body bytes stream out immediately; DATA frames are
                        // never buffered.
                        self.callbacks.on_data_recv(
                            end_data,
                            body,
                            body_offset,
                            stream.user_data,
                        );
                    }
                }

                stream.recv_buf.pop_range(fill_at, used);
                data_modified = true;
                progress = true;
            }

            if !data_modified {
                seg_idx += 1;
            }
        }

        Ok(progress)
    }

    /// Deliver completed frames in stream order. Non-DATA frames serialise
    /// with respect to each other; DATA frames are never blocked by an
    /// earlier incomplete non-DATA frame.
    fn dispatch_frames(&mut self, stream: &mut Stream) -> Result<bool> {
        let mut progress = false;
        let mut blocked = false;
        let mut fi = 0;

        while fi < stream.active_frames.len() {
            let f = &stream.active_frames[fi];
            let is_data = f.frame_type == FrameType::Data;

            if f.is_filled() && (is_data || !blocked) {
                let frame = stream.active_frames.remove(fi);
                self.dispatch_frame(stream, frame)?;
                progress = true;
                continue;
            }

            if !is_data {
                blocked = true;
            }
            fi += 1;
        }

        Ok(progress)
    }

    fn dispatch_frame(&mut self, stream: &mut Stream, frame: ActiveFrame) -> Result<()> {
        match frame.frame_type {
            // Body bytes already went out during fill.
            FrameType::Data => Ok(()),
            FrameType::Headers => self.on_headers_frame(stream, frame),
            FrameType::Priority => {
                self.require_peer_control(stream)?;
                let priority = frame::parse_priority_frame(frame.buf.as_deref().unwrap_or(&[]))?;
                debug!(?priority, "priority frame (no scheduling action taken)");
                Ok(())
            }
            FrameType::CancelPush => {
                self.require_peer_control(stream)?;
                let push_id =
                    frame::parse_cancel_push_frame(frame.buf.as_deref().unwrap_or(&[]))?;
                debug!(push_id, "peer cancelled push");
                self.promises.remove(push_id);
                Ok(())
            }
            FrameType::Settings => {
                self.require_peer_control(stream)?;
                let settings = frame::parse_settings_frame(frame.buf.as_deref().unwrap_or(&[]))?;
                debug!(?settings, "peer settings");
                Ok(())
            }
            FrameType::PushPromise => self.on_push_promise_frame(stream, frame),
            FrameType::Goaway => {
                self.require_peer_control(stream)?;
                let last = frame::parse_goaway_frame(frame.buf.as_deref().unwrap_or(&[]))?;
                info!(last_stream_id = last, "peer sent GOAWAY");
                Ok(())
            }
            FrameType::MaxPushId => {
                self.require_peer_control(stream)?;
                if self.role != Role::Server {
                    return Err(Error::MalformedFrame);
                }
                let max = frame::parse_max_push_id_frame(frame.buf.as_deref().unwrap_or(&[]))?;
                if self.max_push_promise > max {
                    // The limit never shrinks.
                    return Err(Error::MalformedFrame);
                }
                debug!(max_push_id = max, "push limit raised");
                self.max_push_promise = max;
                Ok(())
            }
            FrameType::Unknown(tag) => {
                warn!(frame_type = tag, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    /// Connection-scoped frames are legal only on the peer's control stream.
    fn require_peer_control(&self, stream: &Stream) -> Result<()> {
        let peer_control = match self.role {
            Role::Client => CONTROL_STREAM_SERVER,
            Role::Server => CONTROL_STREAM_CLIENT,
        };
        if stream.id() != Some(peer_control) {
            return Err(Error::WrongStream);
        }
        Ok(())
    }

    fn on_headers_frame(&mut self, stream: &mut Stream, frame: ActiveFrame) -> Result<()> {
        match stream.recv_state {
            HttpState::Open => stream.recv_state = HttpState::Hdrs,
            HttpState::Hdrs | HttpState::Trailers => {}
            HttpState::Body => stream.recv_state = HttpState::Trailers,
            HttpState::Done => {
                error!(stream = ?stream.stream_id, "HEADERS received after close");
                return Err(Error::RequestClosed);
            }
        }

        let buf = frame.buf.as_deref().unwrap_or(&[]);
        let push_prefixed = stream.stream_id.map(is_server_push_stream).unwrap_or(false);
        let (push_id, hdrs) =
            frame::parse_headers_frame(&mut self.hdr_ctx, buf, push_prefixed)?;

        if let (Some(embedded), Some(bound)) = (push_id, stream.push_id) {
            if embedded != bound {
                warn!(embedded, bound, "push-id mismatch in HEADERS prefix");
            }
        }

        if hdrs.is_empty() {
            return Ok(());
        }

        if stream.started {
            self.callbacks
                .on_begin_headers(self.session_user_data, stream.user_data)?;
        }

        let flags = HeadersFlags {
            end_request: frame.complete,
            trailers: stream.recv_state > HttpState::Hdrs,
        };
        self.deliver_headers(flags, &hdrs, stream.user_data)
    }

    fn on_push_promise_frame(&mut self, stream: &mut Stream, frame: ActiveFrame) -> Result<()> {
        if stream.recv_state == HttpState::Done {
            return Err(Error::RequestClosed);
        }

        let buf = frame.buf.as_deref().unwrap_or(&[]);
        let (push_id, hdrs) = frame::parse_push_promise_frame(&mut self.hdr_ctx, buf)?;

        if push_id > self.max_push_promise {
            return Err(Error::MalformedFrame);
        }

        // The multicast end-of-session marker rides in as a push promise.
        if self.role == Role::Client
            && self.mode == Mode::Multicast
            && header_has_value(&hdrs, ":path", "goaway")
            && header_has_value(&hdrs, "connection", "close")
        {
            info!("multicast goaway promise received, closing session");
            self.pending_close = true;
            return Ok(());
        }

        let promise_user = self.alloc_handle();
        let mut promised = Stream::new(promise_user);
        promised.push_id = Some(push_id);
        promised.recv_state = HttpState::Hdrs;
        self.promises
            .add(push_id, promised)
            .map_err(|_| Error::DuplicatePush)?;

        if !self
            .callbacks
            .on_begin_promise(self.session_user_data, stream.user_data, promise_user)
        {
            return Err(Error::NotInterested);
        }

        debug!(stream = ?stream.stream_id, push_id, "push promise received");

        let flags = HeadersFlags {
            end_request: frame.complete,
            trailers: false,
        };
        self.deliver_headers(flags, &hdrs, promise_user)
    }

    /// Hand decoded header fields to the user one at a time, raising the
    /// end-request flag only on the last.
    pub(crate) fn deliver_headers(
        &mut self,
        flags: HeadersFlags,
        hdrs: &[Header],
        user: UserHandle,
    ) -> Result<()> {
        let fin = flags.end_request;
        let mut flags = HeadersFlags {
            end_request: false,
            trailers: flags.trailers,
        };
        for (i, hdr) in hdrs.iter().enumerate() {
            if i + 1 == hdrs.len() {
                flags.end_request = fin;
            }
            self.callbacks.on_headers(flags, hdr.clone(), user)?;
        }
        Ok(())
    }
}

fn header_has_value(hdrs: &[Header], name: &str, value: &str) -> bool {
    hdrs.iter().any(|h| h.name_is(name) && h.value_is(value))
}
