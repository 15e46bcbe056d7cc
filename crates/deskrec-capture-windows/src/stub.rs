//! Non-Windows stub for DesktopDuplication (CI + cross-compilation).

use std::time::Duration;

use deskrec_core::{
    Acquired, CaptureError, CapturedFrame, FrameSource, FrameTransfer, Resolution, StagingBuffer,
};

/// Never constructed off Windows.
pub struct DuplicatedFrame {
    resolution: Resolution,
}

impl CapturedFrame for DuplicatedFrame {
    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

pub struct DesktopDuplication {
    resolution: Resolution,
}

impl DesktopDuplication {
    pub fn open_first_attached() -> Result<Self, CaptureError> {
        tracing::warn!("DesktopDuplication::open_first_attached stub (non-Windows)");
        Err(CaptureError::Unsupported)
    }
}

impl FrameSource for DesktopDuplication {
    type Frame = DuplicatedFrame;

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn acquire(&mut self, _timeout: Duration) -> Result<Acquired<DuplicatedFrame>, CaptureError> {
        Err(CaptureError::Unsupported)
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::NoFrameOutstanding)
    }
}

impl FrameTransfer for DesktopDuplication {
    fn copy_to_staging(&mut self, _frame: &DuplicatedFrame) -> Result<StagingBuffer<'_>, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

/// Nothing to set up off Windows.
pub struct SessionScaffold;

impl SessionScaffold {
    pub fn enter() -> Result<Self, CaptureError> {
        Ok(Self)
    }
}
