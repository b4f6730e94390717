//! The send scheduler: packs queued frames into packets lowest-stream-first
//! under the bytes-in-flight ceiling, and flushes pre-built packets through
//! the socket callback (reflecting each one as a fabricated ACK on the
//! multicast server).

use crate::config::{MAX_BYTES_IN_FLIGHT, MIN_STREAM_PACKET_OVERHEAD};
use crate::error::{Error, Result};
use crate::multicast::ShortHeader;
use crate::session::Session;
use crate::stream::HttpState;
use crate::timer::timestamp_now;
use crate::{Mode, Role, SocketIo};
use hqm_x::{EngineError, StreamId};
use tracing::{debug, error};

impl Session {
    /// Drive queued stream data out through the engine.
    ///
    /// Iterates streams in ascending id order; each produced packet carries
    /// bytes from exactly one stream. Known limitation: a saturated low
    /// stream can starve higher ones.
    ///
    /// Returns `SessionBlocked` when the bytes-in-flight gate trips or the
    /// socket refuses bytes, `NoMoreData` when nothing was waiting.
    pub fn send(&mut self) -> Result<()> {
        if self.engine.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
            debug!("too many bytes in flight, session blocked");
            return Err(Error::SessionBlocked);
        }

        let mut rv = self.write_send_buffer();
        let mut current = self.transfers.next_after(None);

        loop {
            if matches!(rv, Err(Error::Eof) | Err(Error::Generic) | Err(Error::Transport)) {
                break;
            }

            if self.engine.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
                if rv == Err(Error::NoMoreData) {
                    return Err(Error::SessionBlocked);
                }
                break;
            }

            // Skip forward to the lowest stream with queued bytes.
            let id = loop {
                match current {
                    None => {
                        debug!("no more data to be sent on any stream");
                        return rv;
                    }
                    Some(id) => {
                        let has_data = self
                            .transfers
                            .find(id)
                            .map(|s| s.has_send_data())
                            .unwrap_or(false);
                        if has_data {
                            break id;
                        }
                        current = self.transfers.next_after(Some(id));
                    }
                }
            };

            debug!(stream = id, "got data to send");

            // Coalesce head buffers into one contiguous source up to the
            // packet payload budget.
            let budget = self.max_packet_size - MIN_STREAM_PACKET_OVERHEAD;
            let (source, last_data) = {
                let stream = self.transfers.find(id).ok_or(Error::Internal)?;
                let mut source = Vec::new();
                let mut last = false;
                for (i, seg) in stream.send_buf.iter().enumerate() {
                    if i > 0 && source.len() >= budget {
                        break;
                    }
                    source.extend_from_slice(seg.bytes());
                    last |= seg.complete;
                }
                (source, last)
            };

            let mut pkt = vec![0u8; self.max_packet_size];
            let written = self.engine.write_stream(
                &self.path,
                &mut pkt,
                Some(StreamId(id)),
                last_data,
                &source,
                timestamp_now(),
            );

            let written = match written {
                Err(
                    EngineError::StreamDataBlocked
                    | EngineError::StreamShutWr
                    | EngineError::StreamNotFound,
                ) => {
                    // No progress on this stream this round; not an error.
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "engine stream write failed");
                    rv = Err(Error::Transport);
                    break;
                }
                Ok(w) if w.packet_len == 0 => return Err(Error::SessionBlocked),
                Ok(w) => w,
            };

            // Retire whole buffers the engine consumed, then advance into a
            // partially-consumed head.
            let mut sent = written.accepted;
            {
                let stream = self.transfers.find_mut(id).ok_or(Error::Internal)?;
                while let Some(front) = stream.send_buf.front() {
                    if sent < front.remaining() {
                        break;
                    }
                    sent -= front.remaining();
                    debug!(stream = id, size = front.remaining(), "sent whole buffer");
                    stream.send_buf.pop_front();
                }
                if sent > 0 {
                    match stream.send_buf.front_mut() {
                        Some(front) => {
                            front.advance(sent);
                            debug!(
                                stream = id,
                                remaining = front.remaining(),
                                "partial buffer sent"
                            );
                        }
                        None => {
                            error!("engine accepted more than was queued");
                            return Err(Error::Internal);
                        }
                    }
                }
            }

            let finished = last_data
                && self
                    .transfers
                    .find(id)
                    .map(|s| !s.has_send_data())
                    .unwrap_or(false);

            pkt.truncate(written.packet_len);
            self.send_queue.push_back(pkt);

            self.update_timers()?;

            rv = self.write_send_buffer();

            if finished {
                debug!(stream = id, "ending stream");
                let (status, user) = {
                    let stream = self.transfers.find_mut(id).ok_or(Error::Internal)?;
                    stream.send_state = HttpState::Done;
                    (stream.status.map_or(Ok(()), Err), stream.user_data)
                };
                self.callbacks.on_request_close(status, user);
            }
        }

        rv
    }

    /// Flush pre-built packets through the send callback. On the multicast
    /// server every flushed packet is also reflected as a synthetic ACK onto
    /// the receive queue, so the engine observes its own packets being
    /// acknowledged.
    pub(crate) fn write_send_buffer(&mut self) -> Result<()> {
        let mut rv = Err(Error::NoMoreData);

        while let Some(pkt) = self.send_queue.front() {
            if self.handshake_complete {
                match self.callbacks.send(pkt) {
                    SocketIo::Data(n) if n == pkt.len() => {}
                    SocketIo::Data(0) | SocketIo::WouldBlock => {
                        return Err(Error::SessionBlocked);
                    }
                    SocketIo::Eof => return Err(Error::Eof),
                    SocketIo::Data(_) => return Err(Error::Generic),
                }
            }

            if self.mode == Mode::Multicast && self.role != Role::Client {
                if let Some(hdr) = ShortHeader::decode(pkt, self.session_id.len()) {
                    self.mcast_fake_ack(&hdr);
                }
            }

            self.send_queue.pop_front();
            rv = Ok(());
        }

        rv
    }
}
