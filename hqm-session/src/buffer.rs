//! Ordered byte-segment chains.
//!
//! A [`SegmentChain`] is the building block for both directions of a stream:
//! the receive side inserts byte ranges at arbitrary stream offsets and
//! merges them into contiguous runs, the send side appends encoded frames
//! and consumes them from the front as the scheduler packs packets.

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;

/// A contiguous run of stream bytes starting at `offset`.
#[derive(Debug)]
pub struct Segment {
    offset: u64,
    data: BytesMut,
    /// This segment contains the final byte of its stream.
    pub complete: bool,
}

impl Segment {
    pub fn new(data: impl AsRef<[u8]>, offset: u64, complete: bool) -> Self {
        Self {
            offset,
            data: BytesMut::from(data.as_ref()),
            complete,
        }
    }

    /// Stream offset of the first live byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stream offset one past the last live byte.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Live bytes still held.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume `n` bytes from the front.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.data.advance(n);
        self.offset += n as u64;
    }

    /// Extend this segment with `extra`, absorbing `eos` into the
    /// completeness flag.
    pub fn append(&mut self, extra: &[u8], eos: bool) {
        self.data.extend_from_slice(extra);
        self.complete |= eos;
    }
}

/// An ordered list of disjoint segments.
#[derive(Debug, Default)]
pub struct SegmentChain {
    segs: VecDeque<Segment>,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn clear(&mut self) {
        self.segs.clear();
    }

    /// Append a pre-built segment (send-side queueing).
    pub fn push(&mut self, seg: Segment) {
        self.segs.push_back(seg);
    }

    pub fn pop_front(&mut self) -> Option<Segment> {
        self.segs.pop_front()
    }

    pub fn front(&self) -> Option<&Segment> {
        self.segs.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Segment> {
        self.segs.front_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segs.iter()
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    /// Stream offset of the first byte held, if any.
    pub fn first_offset(&self) -> Option<u64> {
        self.segs.front().map(|s| s.offset)
    }

    /// Bounds of the `idx`-th segment as (offset, length).
    pub fn nth_bounds(&self, idx: usize) -> Option<(u64, usize)> {
        self.segs.get(idx).map(|s| (s.offset, s.data.len()))
    }

    /// Insert `data` at stream offset `offset`, tolerating duplication and
    /// overlap in either direction. Adjacent and overlapping segments are
    /// merged so the chain always holds disjoint runs in ascending order.
    pub fn insert(&mut self, data: &[u8], offset: u64, eos: bool) {
        if data.is_empty() {
            // A bare end-of-stream mark attaches to the run it terminates.
            if eos {
                if let Some(seg) = self.segs.iter_mut().find(|s| s.end() == offset) {
                    seg.complete = true;
                }
            }
            return;
        }

        // First segment whose end reaches the new range.
        let idx = self.segs.iter().position(|s| s.end() >= offset);

        let idx = match idx {
            None => {
                self.segs.push_back(Segment::new(data, offset, eos));
                return;
            }
            Some(idx) if self.segs[idx].offset > offset => {
                self.segs.insert(idx, Segment::new(data, offset, eos));
                idx
            }
            Some(idx) => {
                let seg = &mut self.segs[idx];
                let covered = (seg.end() - offset) as usize;
                if covered >= data.len() {
                    // Entirely duplicate data.
                    return;
                }
                seg.append(&data[covered..], eos);
                idx
            }
        };

        // Fold in any following segments the extended run now reaches.
        while idx + 1 < self.segs.len() && self.segs[idx + 1].offset <= self.segs[idx].end() {
            let next = self.segs.remove(idx + 1).unwrap();
            let covered = (self.segs[idx].end() - next.offset) as usize;
            if covered < next.data.len() {
                let tail = &next.data[covered..];
                self.segs[idx].data.extend_from_slice(tail);
            }
            self.segs[idx].complete |= next.complete;
        }
    }

    /// Readable bytes at `offset`: the slice from `offset` to the end of the
    /// segment containing it, plus that segment's completeness flag.
    pub fn read_at(&self, offset: u64) -> Option<(&[u8], bool)> {
        for seg in &self.segs {
            if seg.offset <= offset && offset < seg.end() {
                let rel = (offset - seg.offset) as usize;
                return Some((&seg.data[rel..], seg.complete));
            }
            if seg.offset > offset {
                break;
            }
        }
        None
    }

    /// Discard `len` consumed bytes at `offset`. The range may sit at the
    /// head, the tail, or the middle of a segment; a middle removal splits
    /// the segment in two.
    pub fn pop_range(&mut self, offset: u64, len: usize) {
        let Some(idx) = self
            .segs
            .iter()
            .position(|s| s.offset <= offset && offset < s.end())
        else {
            return;
        };

        let seg = &mut self.segs[idx];
        let rel = (offset - seg.offset) as usize;

        if rel == 0 {
            if len >= seg.data.len() {
                self.segs.remove(idx);
            } else {
                seg.advance(len);
            }
        } else if rel + len >= seg.data.len() {
            seg.data.truncate(rel);
            // The bytes that carried the end-of-stream mark are gone.
            seg.complete = false;
        } else {
            let tail_data = seg.data.split_off(rel + len);
            let tail = Segment {
                offset: offset + len as u64,
                data: tail_data,
                complete: seg.complete,
            };
            seg.data.truncate(rel);
            seg.complete = false;
            self.segs.insert(idx + 1, tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(chain: &SegmentChain) -> Vec<(u64, Vec<u8>, bool)> {
        chain
            .iter()
            .map(|s| (s.offset(), s.bytes().to_vec(), s.complete))
            .collect()
    }

    #[test]
    fn test_insert_in_order() {
        let mut chain = SegmentChain::new();
        chain.insert(b"hello", 0, false);
        chain.insert(b"world", 5, true);

        assert_eq!(contents(&chain), vec![(0, b"helloworld".to_vec(), true)]);
    }

    #[test]
    fn test_insert_with_hole_then_fill() {
        let mut chain = SegmentChain::new();
        chain.insert(b"cc", 4, true);
        chain.insert(b"aa", 0, false);
        assert_eq!(chain.len(), 2);

        chain.insert(b"bb", 2, false);
        assert_eq!(contents(&chain), vec![(0, b"aabbcc".to_vec(), true)]);
    }

    #[test]
    fn test_insert_duplicate_dropped() {
        let mut chain = SegmentChain::new();
        chain.insert(b"abcdef", 0, false);
        chain.insert(b"cd", 2, false);
        assert_eq!(contents(&chain), vec![(0, b"abcdef".to_vec(), false)]);
    }

    #[test]
    fn test_insert_overlapping_extension() {
        let mut chain = SegmentChain::new();
        chain.insert(b"abcd", 0, false);
        chain.insert(b"cdef", 2, false);
        assert_eq!(contents(&chain), vec![(0, b"abcdef".to_vec(), false)]);
    }

    #[test]
    fn test_insert_spanning_merge() {
        let mut chain = SegmentChain::new();
        chain.insert(b"aa", 0, false);
        chain.insert(b"cc", 4, false);
        chain.insert(b"ee", 8, true);
        // One insertion bridging all three runs.
        chain.insert(b"abbccdde", 1, false);
        assert_eq!(contents(&chain), vec![(0, b"aabbccddee".to_vec(), true)]);
    }

    // Reassembly idempotence: any insertion order whose union covers the
    // stream collapses to a single complete segment.
    #[test]
    fn test_insert_idempotence_permutations() {
        let stream: Vec<u8> = (0u8..=255).cycle().take(300).collect();
        let chunk = |off: usize, len: usize| &stream[off..off + len];

        let orders: &[&[(usize, usize)]] = &[
            &[(0, 100), (100, 100), (200, 100)],
            &[(200, 100), (0, 100), (100, 100)],
            &[(100, 100), (200, 100), (0, 100), (100, 100)],
            &[(0, 200), (150, 150), (0, 100)],
            &[(250, 50), (0, 300)],
        ];

        for order in orders {
            let mut chain = SegmentChain::new();
            for &(off, len) in order.iter() {
                let eos = off + len == 300;
                chain.insert(chunk(off, len), off as u64, eos);
            }
            assert_eq!(
                contents(&chain),
                vec![(0, stream.clone(), true)],
                "order {:?}",
                order
            );
        }
    }

    #[test]
    fn test_read_at() {
        let mut chain = SegmentChain::new();
        chain.insert(b"abcd", 0, false);
        chain.insert(b"xy", 10, true);

        let (bytes, complete) = chain.read_at(1).unwrap();
        assert_eq!(bytes, b"bcd");
        assert!(!complete);

        let (bytes, complete) = chain.read_at(10).unwrap();
        assert_eq!(bytes, b"xy");
        assert!(complete);

        assert!(chain.read_at(4).is_none());
        assert!(chain.read_at(12).is_none());
    }

    #[test]
    fn test_pop_range_head_tail_middle() {
        let mut chain = SegmentChain::new();
        chain.insert(b"abcdefgh", 0, true);

        chain.pop_range(0, 2); // head
        assert_eq!(contents(&chain), vec![(2, b"cdefgh".to_vec(), true)]);

        chain.pop_range(4, 2); // middle -> split
        assert_eq!(
            contents(&chain),
            vec![(2, b"cd".to_vec(), false), (6, b"gh".to_vec(), true)]
        );

        chain.pop_range(6, 2); // exact segment
        assert_eq!(contents(&chain), vec![(2, b"cd".to_vec(), false)]);
    }

    #[test]
    fn test_segment_advance() {
        let mut seg = Segment::new(b"abcdef", 10, false);
        seg.advance(4);
        assert_eq!(seg.offset(), 14);
        assert_eq!(seg.bytes(), b"ef");
        assert_eq!(seg.remaining(), 2);
    }
}
