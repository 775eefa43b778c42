//! Growable stereo frame storage shared by channels, effects and the mixer.

use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::frame::StereoFrame;

const MIN_CAPACITY: usize = 4;

/// Resizable run of [`StereoFrame`]s with a logical length that can be smaller
/// than the allocated storage.
///
/// Clearing or truncating keeps the allocation so the mixer can reuse the same
/// buffers every cycle without touching the allocator.
#[derive(Debug, Default, Clone)]
pub struct FrameBuffer {
    storage: Vec<StereoFrame>,
    count: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Self::new();
        buf.ensure_capacity(capacity);
        buf
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Drops all frames but keeps the allocation.
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Grows the storage to hold at least `min` frames. Never shrinks.
    ///
    /// Storage doubles (starting at 4); if doubling is not enough it jumps
    /// straight to `min`.
    pub fn ensure_capacity(&mut self, min: usize) {
        let current = self.storage.len();
        if min <= current {
            return;
        }
        let doubled = (current * 2).max(MIN_CAPACITY);
        let new_capacity = doubled.max(min);
        self.storage.resize(new_capacity, StereoFrame::SILENCE);
    }

    /// Sets the logical length. Frames exposed by growing are silent.
    pub fn resize(&mut self, len: usize) {
        if len > self.count {
            self.ensure_capacity(len);
            self.storage[self.count..len].fill(StereoFrame::SILENCE);
        }
        self.count = len;
    }

    /// Sets the length and silences every frame.
    pub fn reset_to(&mut self, len: usize) {
        self.ensure_capacity(len);
        self.storage[..len].fill(StereoFrame::SILENCE);
        self.count = len;
    }

    pub fn push(&mut self, frame: StereoFrame) {
        self.ensure_capacity(self.count + 1);
        self.storage[self.count] = frame;
        self.count += 1;
    }

    pub fn extend_from_slice(&mut self, frames: &[StereoFrame]) {
        let end = self.count + frames.len();
        self.ensure_capacity(end);
        self.storage[self.count..end].copy_from_slice(frames);
        self.count = end;
    }

    /// Removes `count` frames starting at `start`, shifting the tail left.
    ///
    /// The order of the remaining frames is unchanged, so `remove_range(0, n)`
    /// consumes the oldest `n` frames of a FIFO.
    pub fn remove_range(&mut self, start: usize, count: usize) -> Result<()> {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.count)
            .ok_or(Error::RangeOutOfBounds {
                start,
                count,
                len: self.count,
            })?;
        self.storage.copy_within(end..self.count, start);
        self.count -= count;
        Ok(())
    }

    /// Drops up to `count` of the oldest frames and returns how many went.
    pub fn consume_front(&mut self, count: usize) -> usize {
        let count = count.min(self.count);
        self.storage.copy_within(count..self.count, 0);
        self.count -= count;
        count
    }

    pub fn as_slice(&self) -> &[StereoFrame] {
        &self.storage[..self.count]
    }

    pub fn as_mut_slice(&mut self) -> &mut [StereoFrame] {
        &mut self.storage[..self.count]
    }

    /// Writes the frames as interleaved `L R L R ...` samples into `out`.
    pub fn write_interleaved(&self, out: &mut Vec<f32>, scale: f32) {
        out.clear();
        out.reserve(self.count * 2);
        for frame in self.as_slice() {
            out.push(frame.left * scale);
            out.push(frame.right * scale);
        }
    }
}

impl Deref for FrameBuffer {
    type Target = [StereoFrame];

    fn deref(&self) -> &[StereoFrame] {
        self.as_slice()
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [StereoFrame] {
        self.as_mut_slice()
    }
}

impl From<Vec<StereoFrame>> for FrameBuffer {
    fn from(storage: Vec<StereoFrame>) -> Self {
        let count = storage.len();
        Self { storage, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(i: usize) -> StereoFrame {
        StereoFrame::new(i as f32, -(i as f32))
    }

    #[test]
    fn capacity_doubles_with_minimum_of_four() {
        let mut buf = FrameBuffer::new();
        buf.push(frame(0));
        assert_eq!(buf.capacity(), 4);
        for i in 1..5 {
            buf.push(frame(i));
        }
        assert_eq!(buf.capacity(), 8);
        buf.ensure_capacity(100);
        assert_eq!(buf.capacity(), 100);
        buf.ensure_capacity(10);
        assert_eq!(buf.capacity(), 100, "ensure_capacity must never shrink");
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = FrameBuffer::with_capacity(64);
        buf.resize(32);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn resize_after_truncate_zero_fills_stale_frames() {
        let mut buf = FrameBuffer::new();
        for i in 1..=8 {
            buf.push(frame(i));
        }
        buf.resize(2);
        buf.resize(8);
        assert!(buf[2..].iter().all(StereoFrame::is_silent));
        assert_eq!(buf[1], frame(2));
    }

    #[test]
    fn remove_range_rejects_out_of_bounds() {
        let mut buf = FrameBuffer::new();
        buf.resize(4);
        assert_eq!(
            buf.remove_range(3, 2),
            Err(Error::RangeOutOfBounds {
                start: 3,
                count: 2,
                len: 4
            })
        );
        assert!(buf.remove_range(usize::MAX, 2).is_err());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn interleaved_output_scales_samples() {
        let mut buf = FrameBuffer::new();
        buf.push(StereoFrame::new(16384.0, -32768.0));
        let mut out = Vec::new();
        buf.write_interleaved(&mut out, 1.0 / 32768.0);
        assert_eq!(out, vec![0.5, -1.0]);
    }

    proptest! {
        #[test]
        fn resize_exposes_silence(initial in 0usize..64, grown in 0usize..256) {
            let mut buf = FrameBuffer::new();
            for i in 0..initial {
                buf.push(frame(i + 1));
            }
            buf.resize(grown);
            prop_assert_eq!(buf.len(), grown);
            if grown > initial {
                prop_assert!(buf[initial..].iter().all(StereoFrame::is_silent));
            }
            prop_assert!(buf.len() <= buf.capacity());
        }

        #[test]
        fn remove_front_is_fifo(len in 0usize..128, take in 0usize..128) {
            let mut buf = FrameBuffer::new();
            for i in 0..len {
                buf.push(frame(i));
            }
            let before: Vec<_> = buf.to_vec();
            let result = buf.remove_range(0, take);
            if take > len {
                prop_assert!(result.is_err());
                prop_assert_eq!(buf.len(), len);
            } else {
                prop_assert!(result.is_ok());
                prop_assert_eq!(buf.len(), len - take);
                for i in 0..buf.len() {
                    prop_assert_eq!(buf[i], before[i + take]);
                }
            }
        }

        #[test]
        fn consume_front_never_overruns(len in 0usize..128, take in 0usize..256) {
            let mut buf = FrameBuffer::new();
            for i in 0..len {
                buf.push(frame(i));
            }
            let consumed = buf.consume_front(take);
            prop_assert_eq!(consumed, take.min(len));
            prop_assert_eq!(buf.len(), len - consumed);
            for i in 0..buf.len() {
                prop_assert_eq!(buf[i], frame(i + consumed));
            }
        }

        #[test]
        fn remove_middle_keeps_order(len in 1usize..64, start in 0usize..64, count in 0usize..64) {
            prop_assume!(start + count <= len);
            let mut buf = FrameBuffer::new();
            for i in 0..len {
                buf.push(frame(i));
            }
            buf.remove_range(start, count).unwrap();
            let expected: Vec<_> = (0..len)
                .filter(|i| *i < start || *i >= start + count)
                .map(frame)
                .collect();
            prop_assert_eq!(buf.to_vec(), expected);
        }
    }
}
