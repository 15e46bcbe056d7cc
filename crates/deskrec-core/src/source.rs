//! Capture-side seams: [`FrameSource`] hands out GPU frames, [`FrameTransfer`]
//! brings one of them into CPU memory as a [`StagingBuffer`].
//!
//! ```text
//! acquire(timeout) ──► Frame ──► copy_to_staging ──► StagingBuffer (mapped)
//!        │                                                 │ drop → unmap
//!        └────────────── release() ◄───────────────────────┘
//! ```

use std::time::Duration;

use crate::errors::CaptureError;
use crate::types::{AdapterInfo, PixelFormat, Resolution};

/// Result of a bounded-wait acquisition.
#[derive(Debug)]
pub enum Acquired<F> {
    /// A new desktop image is held by the caller until `release()`.
    Frame(F),
    /// Nothing changed on screen within the timeout. Nothing to release.
    Timeout,
}

/// A handle to one captured image.
pub trait CapturedFrame {
    fn resolution(&self) -> Resolution;
}

/// A duplication-capable source of desktop frames.
///
/// At most one frame is outstanding: every `Acquired::Frame` must be followed by exactly one
/// `release()` before the next `acquire()`.
pub trait FrameSource {
    type Frame: CapturedFrame;

    /// Output resolution reported by the source when it was opened.
    fn resolution(&self) -> Resolution;

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgra8
    }

    /// GPU adapter backing the source, if any.
    fn adapter(&self) -> Option<AdapterInfo> {
        None
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Acquired<Self::Frame>, CaptureError>;

    fn release(&mut self) -> Result<(), CaptureError>;
}

/// Copies a GPU frame into a CPU-readable staging target.
pub trait FrameTransfer: FrameSource {
    /// Copy `frame` to staging, wait for the copy to complete, and map it.
    fn copy_to_staging(&mut self, frame: &Self::Frame) -> Result<StagingBuffer<'_>, CaptureError>;
}

/// A mapped, read-only view of one frame.
///
/// `row_pitch` may exceed `width * 4`. The backing map is released exactly once when the
/// buffer is dropped.
pub struct StagingBuffer<'a> {
    data: &'a [u8],
    row_pitch: usize,
    resolution: Resolution,
    unmap: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> StagingBuffer<'a> {
    pub fn new(data: &'a [u8], row_pitch: usize, resolution: Resolution) -> Self {
        Self { data, row_pitch, resolution, unmap: None }
    }

    /// Attach the action that unmaps the backing resource.
    pub fn on_unmap(mut self, unmap: impl FnOnce() + 'a) -> Self {
        self.unmap = Some(Box::new(unmap));
        self
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

impl std::fmt::Debug for StagingBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("len", &self.data.len())
            .field("row_pitch", &self.row_pitch)
            .field("resolution", &self.resolution)
            .finish()
    }
}
