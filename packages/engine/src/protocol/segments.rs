//! Scatter/gather segment lists and send cursors
//!
//! A logical send is an ordered list of byte ranges treated as one payload.
//! [`Position`] records exactly where a partially-completed send stopped so
//! a later write-ready event can resume from that byte.

use bytes::Bytes;

/// Ordered, non-contiguous byte ranges making up one logical payload.
pub type SegmentList = Vec<Bytes>;

/// Cursor into a segment list: which segment, and the offset inside it.
///
/// Invariant: `offset < segment length`, except in the finished
/// representation where `segment == list length` and `offset == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub segment: usize,
    pub offset: usize,
}

impl Position {
    #[must_use]
    pub fn new(segment: usize, offset: usize) -> Self {
        Self { segment, offset }
    }

    /// True when no byte at or after this position remains unsent.
    #[must_use]
    pub fn finished(&self, segments: &[Bytes]) -> bool {
        self.segment >= segments.len()
    }

    /// Advance the cursor by `count` bytes actually accepted by the OS,
    /// normalizing across segment boundaries and skipping empty segments.
    pub fn advance(&mut self, segments: &[Bytes], mut count: usize) {
        while self.segment < segments.len() {
            let remaining = segments[self.segment].len() - self.offset;
            if count < remaining {
                self.offset += count;
                return;
            }
            count -= remaining;
            self.segment += 1;
            self.offset = 0;
        }
        self.offset = 0;
    }

    /// Skip leading empty segments so the invariant holds after
    /// construction from caller input.
    pub fn normalize(&mut self, segments: &[Bytes]) {
        while self.segment < segments.len() && self.offset >= segments[self.segment].len() {
            self.segment += 1;
            self.offset = 0;
        }
    }

    /// Bytes left to send at or after this position.
    #[must_use]
    pub fn remaining(&self, segments: &[Bytes]) -> usize {
        if self.finished(segments) {
            return 0;
        }
        let mut total = segments[self.segment].len() - self.offset;
        for seg in &segments[self.segment + 1..] {
            total += seg.len();
        }
        total
    }
}
