//! Per-stream state: the send/receive HTTP state machines, the inbound
//! segment store, the outbound frame queue, and the active partial frames
//! being reassembled.

use crate::buffer::SegmentChain;
use crate::error::Error;
use crate::frame::FrameType;
use crate::UserHandle;
use bytes::BytesMut;
use hqm_x::StreamId;

/// The request/response lattice both state machines move through.
///
/// Transitions only ever move rightward: `Open → Hdrs → Body → Trailers →
/// Done`, with `Trailers` reachable only when the preceding header block
/// promised trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpState {
    Open,
    Hdrs,
    Body,
    Trailers,
    Done,
}

/// A half-open byte range `[begin, end)` within a frame that has not been
/// received yet. Gaps are disjoint and ordered by `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub begin: usize,
    pub end: usize,
}

/// A receive-side frame whose span is known but whose payload is still
/// filling in. Dispatch happens once the gap list is empty.
#[derive(Debug)]
pub struct ActiveFrame {
    pub frame_type: FrameType,
    /// Stream offset of the first frame byte (the type tag).
    pub offset: u64,
    /// Total frame size, header included.
    pub size: usize,
    /// Reassembly buffer. DATA frames own no buffer; their body bytes are
    /// streamed straight to the user callback as spans fill.
    pub buf: Option<BytesMut>,
    /// The frame contains the final byte of its stream.
    pub complete: bool,
    pub gaps: Vec<Gap>,
    /// Stream offset of the first payload byte (DATA frames only).
    pub end_header_offset: u64,
    /// Subtracted from stream offsets to rebase DATA payload bytes onto the
    /// application's running body offset.
    pub data_offset_adjust: u64,
}

impl ActiveFrame {
    pub fn new(frame_type: FrameType, offset: u64, size: usize) -> Self {
        let buf = if frame_type == FrameType::Data {
            None
        } else {
            Some(BytesMut::zeroed(size))
        };
        Self {
            frame_type,
            offset,
            size,
            buf,
            complete: false,
            gaps: vec![Gap {
                begin: 0,
                end: size,
            }],
            end_header_offset: 0,
            data_offset_adjust: 0,
        }
    }

    /// One past the last stream byte of the frame span.
    pub fn span_end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Whether the frame span overlaps the stream range `[at, at + len)`.
    pub fn overlaps(&self, at: u64, len: usize) -> bool {
        self.offset < at + len as u64 && self.span_end() > at
    }

    /// Copy received bytes at stream offset `at` into the frame and punch
    /// the covered range out of the gap list. Returns the bytes consumed
    /// (the overlap may be shorter than `data`).
    pub fn fill(&mut self, at: u64, data: &[u8], seg_complete: bool) -> usize {
        debug_assert!(at >= self.offset && at < self.span_end());
        let rel = (at - self.offset) as usize;
        let mut len = data.len();
        let mut complete = seg_complete;
        if len > self.size - rel {
            len = self.size - rel;
            // Not the last bytes of the source run, so completeness does not
            // transfer.
            complete = false;
        }
        if let Some(buf) = &mut self.buf {
            buf[rel..rel + len].copy_from_slice(&data[..len]);
        }
        self.complete |= complete;
        self.remove_gap(rel, rel + len);
        len
    }

    /// Subtract `[begin, end)` from the gap list. A punch may split a gap in
    /// two, truncate either end, or delete gaps entirely.
    fn remove_gap(&mut self, begin: usize, end: usize) {
        let mut out = Vec::with_capacity(self.gaps.len() + 1);
        for gap in &self.gaps {
            if gap.end <= begin || gap.begin >= end {
                out.push(*gap);
                continue;
            }
            if gap.begin < begin {
                out.push(Gap {
                    begin: gap.begin,
                    end: begin,
                });
            }
            if gap.end > end {
                out.push(Gap {
                    begin: end,
                    end: gap.end,
                });
            }
        }
        self.gaps = out;
    }

    /// Ready for dispatch: every byte of the span has arrived.
    pub fn is_filled(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Per-stream object. Lives in the session's transfers map under its
/// stream-id, or in the promises map under its push-id until the promise is
/// materialised.
#[derive(Debug)]
pub struct Stream {
    pub stream_id: Option<StreamId>,
    pub push_id: Option<u64>,
    /// Opaque user handle carried through every callback for this stream.
    pub user_data: UserHandle,
    pub recv_state: HttpState,
    pub send_state: HttpState,
    pub started: bool,
    /// A fed header block named a `trailer` field, so a post-body header
    /// block is legal.
    pub trailers_promised: bool,
    pub recv_buf: SegmentChain,
    pub send_buf: SegmentChain,
    pub active_frames: Vec<ActiveFrame>,
    /// Stream offset at which the next un-framed byte is expected.
    pub next_recv_offset: u64,
    /// Cumulative DATA payload bytes seen, used to rebase body offsets.
    pub data_frames_total: u64,
    /// Status reported through `on_request_close` when the stream ends.
    pub status: Option<Error>,
}

impl Stream {
    pub fn new(user_data: UserHandle) -> Self {
        Self {
            stream_id: None,
            push_id: None,
            user_data,
            recv_state: HttpState::Open,
            send_state: HttpState::Open,
            started: true,
            trailers_promised: false,
            recv_buf: SegmentChain::new(),
            send_buf: SegmentChain::new(),
            active_frames: Vec::new(),
            next_recv_offset: 0,
            data_frames_total: 0,
            status: None,
        }
    }

    pub fn with_id(stream_id: u64, user_data: UserHandle) -> Self {
        let mut stream = Self::new(user_data);
        stream.stream_id = Some(StreamId(stream_id));
        stream
    }

    pub fn id(&self) -> Option<u64> {
        self.stream_id.map(|s| s.0)
    }

    pub fn has_send_data(&self) -> bool {
        !self.send_buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_has_single_covering_gap() {
        let frame = ActiveFrame::new(FrameType::Headers, 10, 50);
        assert_eq!(frame.gaps, vec![Gap { begin: 0, end: 50 }]);
        assert!(!frame.is_filled());
        assert!(frame.buf.is_some());

        let data = ActiveFrame::new(FrameType::Data, 0, 10);
        assert!(data.buf.is_none());
    }

    // Gap-list coverage: any set of punches covering the span empties the
    // list exactly once.
    #[test]
    fn test_gap_punch_split_truncate_delete() {
        let mut frame = ActiveFrame::new(FrameType::Headers, 0, 100);

        // Middle punch splits the initial gap.
        frame.fill(40, &[0u8; 20], false);
        assert_eq!(
            frame.gaps,
            vec![Gap { begin: 0, end: 40 }, Gap { begin: 60, end: 100 }]
        );

        // Head punch truncates the first gap.
        frame.fill(0, &[0u8; 10], false);
        assert_eq!(
            frame.gaps,
            vec![Gap { begin: 10, end: 40 }, Gap { begin: 60, end: 100 }]
        );

        // A punch spanning both remaining gaps deletes one and truncates the
        // other.
        frame.fill(10, &[0u8; 80], false);
        assert_eq!(frame.gaps, vec![Gap { begin: 90, end: 100 }]);

        frame.fill(90, &[0u8; 10], true);
        assert!(frame.is_filled());
        assert!(frame.complete);
    }

    #[test]
    fn test_fill_truncates_to_span_and_drops_completeness() {
        let mut frame = ActiveFrame::new(FrameType::Headers, 0, 10);
        // 20 source bytes, only 10 fit; the eos mark belongs to the source
        // run's end, which lies outside the frame.
        let used = frame.fill(0, &[7u8; 20], true);
        assert_eq!(used, 10);
        assert!(frame.is_filled());
        assert!(!frame.complete);
        assert_eq!(&frame.buf.as_ref().unwrap()[..], &[7u8; 10]);
    }

    #[test]
    fn test_duplicate_fill_is_idempotent() {
        let mut frame = ActiveFrame::new(FrameType::Headers, 0, 8);
        frame.fill(0, &[1u8; 8], false);
        assert!(frame.is_filled());
        frame.fill(2, &[1u8; 4], false);
        assert!(frame.is_filled());
    }

    #[test]
    fn test_state_ordering() {
        assert!(HttpState::Open < HttpState::Hdrs);
        assert!(HttpState::Hdrs < HttpState::Body);
        assert!(HttpState::Body < HttpState::Trailers);
        assert!(HttpState::Trailers < HttpState::Done);
    }

    #[test]
    fn test_stream_defaults() {
        let stream = Stream::with_id(4, UserHandle(9));
        assert_eq!(stream.recv_state, HttpState::Open);
        assert_eq!(stream.send_state, HttpState::Open);
        assert!(stream.started);
        assert!(!stream.trailers_promised);
        assert_eq!(stream.id(), Some(4));
        assert!(stream.status.is_none());
    }
}
