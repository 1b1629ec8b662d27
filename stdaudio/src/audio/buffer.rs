//! Interleaved sample buffer view
//!
//! A processing callback receives an [`InterleavedBuffer`] that borrows the
//! memory the backend handed out for the current period. The view is only
//! valid for the duration of the callback: the backend reclaims the memory
//! as soon as the callback returns, which the borrow on `'a` enforces.
//!
//! # Layout
//!
//! ```text
//! frame 0          frame 1          frame 2
//! [L0 R0 C0 ...]   [L1 R1 C1 ...]   [L2 R2 C2 ...]
//! ```
//!
//! Sample `(frame, channel)` lives at `frame * channels + channel`.
//!
//! # Example
//!
//! ```
//! use stdaudio::audio::buffer::InterleavedBuffer;
//!
//! let mut storage = vec![0.0f32; 480 * 2];
//! let mut buffer = InterleavedBuffer::new(&mut storage, 480, 2);
//!
//! for frame in 0..buffer.frames() {
//!     *buffer.at_mut(frame, 0) = 0.25;
//!     *buffer.at_mut(frame, 1) = -0.25;
//! }
//! assert_eq!(storage[1], -0.25);
//! ```

use std::ptr::NonNull;

use crate::audio::types::MAX_CHANNELS;

/// Borrowed view over contiguous interleaved `f32` samples
#[derive(Debug)]
pub struct InterleavedBuffer<'a> {
    samples: &'a mut [f32],
    frames: usize,
    channels: usize,
}

impl<'a> InterleavedBuffer<'a> {
    /// Wrap a mutable slice holding at least `frames * channels` samples
    ///
    /// # Panics
    ///
    /// Panics if `channels` exceeds [`MAX_CHANNELS`] or the slice is too short.
    pub fn new(samples: &'a mut [f32], frames: usize, channels: usize) -> Self {
        assert!(
            channels <= MAX_CHANNELS,
            "{channels} channels exceeds the maximum of {MAX_CHANNELS}"
        );
        let len = frames * channels;
        assert!(
            samples.len() >= len,
            "buffer holds {} samples, {len} required",
            samples.len()
        );

        Self {
            samples: &mut samples[..len],
            frames,
            channels,
        }
    }

    /// Wrap backend-owned memory
    ///
    /// # Safety
    ///
    /// `data` must point to `frames * channels` initialised, properly aligned
    /// `f32` values that stay valid and unaliased for `'a`.
    ///
    /// # Panics
    ///
    /// Panics if `channels` exceeds [`MAX_CHANNELS`].
    pub unsafe fn from_raw_parts(data: NonNull<f32>, frames: usize, channels: usize) -> Self {
        assert!(
            channels <= MAX_CHANNELS,
            "{channels} channels exceeds the maximum of {MAX_CHANNELS}"
        );
        // SAFETY: upheld by the caller.
        let samples = unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), frames * channels) };

        Self {
            samples,
            frames,
            channels,
        }
    }

    /// Number of frames in the period
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Number of interleaved channels
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Total samples (`frames * channels`)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `(frame, channel)`
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    #[inline]
    pub fn at(&self, frame: usize, channel: usize) -> &f32 {
        &self.samples[self.offset(frame, channel)]
    }

    /// Mutable sample at `(frame, channel)`
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    #[inline]
    pub fn at_mut(&mut self, frame: usize, channel: usize) -> &mut f32 {
        let offset = self.offset(frame, channel);
        &mut self.samples[offset]
    }

    /// All channels of one frame
    pub fn frame(&self, frame: usize) -> &[f32] {
        assert!(frame < self.frames, "frame {frame} out of range");
        let start = frame * self.channels;
        &self.samples[start..start + self.channels]
    }

    /// All channels of one frame, mutable
    pub fn frame_mut(&mut self, frame: usize) -> &mut [f32] {
        assert!(frame < self.frames, "frame {frame} out of range");
        let start = frame * self.channels;
        &mut self.samples[start..start + self.channels]
    }

    /// Iterate frames as channel slices
    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        // chunks_exact_mut rejects 0; a zero-channel view has no samples anyway
        self.samples.chunks_exact_mut(self.channels.max(1))
    }

    /// Raw interleaved samples
    pub fn as_slice(&self) -> &[f32] {
        self.samples
    }

    /// Raw interleaved samples, mutable
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.samples
    }

    /// Set every sample to `value`
    pub fn fill(&mut self, value: f32) {
        self.samples.fill(value);
    }

    #[inline]
    fn offset(&self, frame: usize, channel: usize) -> usize {
        assert!(
            frame < self.frames && channel < self.channels,
            "({frame}, {channel}) out of range for {} frames x {} channels",
            self.frames,
            self.channels
        );
        frame * self.channels + channel
    }
}
