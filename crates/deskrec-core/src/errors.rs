use thiserror::Error;

use crate::types::Resolution;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Configuration parse error: {0}")]
    ConfigurationParse(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("Encoder error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Frame resolution changed from {expected} to {actual} mid-recording")]
    ResolutionChanged { expected: Resolution, actual: Resolution },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Desktop duplication is not supported on this platform")]
    Unsupported,

    #[error("No duplicable output found; tried: {}", attempts.join("; "))]
    NoDuplicableOutput { attempts: Vec<String> },

    #[error("Device error: {reason}")]
    Device { reason: String },

    #[error("Duplication access lost")]
    AccessLost,

    #[error("Frame acquisition failed: {reason}")]
    AcquireFailed { reason: String },

    #[error("A frame is already outstanding; release it before acquiring again")]
    FrameOutstanding,

    #[error("No frame is outstanding")]
    NoFrameOutstanding,

    #[error("Frame release failed: {reason}")]
    ReleaseFailed { reason: String },

    #[error("GPU copy to staging failed: {reason}")]
    CopyFailed { reason: String },

    #[error("GPU copy did not complete within {ms}ms")]
    BarrierTimeout { ms: u64 },

    #[error("Failed to map staging texture: {reason}")]
    MapFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Frame has no pixels ({resolution})")]
    EmptyFrame { resolution: Resolution },

    #[error("Staging buffer is {actual}, sample builder expects {expected}")]
    DimensionMismatch { expected: Resolution, actual: Resolution },

    #[error("Row pitch {row_pitch} is smaller than the row width {row_bytes}")]
    PitchTooSmall { row_pitch: usize, row_bytes: usize },

    #[error("Mapped buffer holds {available} bytes, {needed} needed")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Failed to allocate {bytes} bytes for a sample")]
    AllocationFailed { bytes: usize },
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Encoder backend initialisation failed: {reason}")]
    InitFailed { reason: String },

    #[error("Stream negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("No encoder element available for {codec}")]
    EncoderUnavailable { codec: crate::types::VideoCodec },

    #[error("Encoder pipeline error: {0}")]
    Pipeline(String),

    #[error("Cannot {operation} while the session is {state}")]
    InvalidState { operation: &'static str, state: &'static str },

    #[error("Sample timestamp {pts_hns} does not follow previous timestamp {previous_hns}")]
    TimestampOrder { pts_hns: u64, previous_hns: u64 },

    #[error("Failed to write sample: {reason}")]
    WriteFailed { reason: String },

    #[error("Failed to finalize output: {reason}")]
    FinalizeFailed { reason: String },
}

/// Coarse failure category surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Setup,
    PerFrame,
    Finalize,
    Other,
}

impl ErrorCategory {
    /// Process exit code for this category.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Other => 1,
            Self::Setup => 2,
            Self::PerFrame => 3,
            Self::Finalize => 4,
        }
    }
}

impl RecorderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigurationInvalid { .. } => ErrorCategory::Setup,
            Self::Capture(e) => e.category(),
            Self::Sample(_) | Self::ResolutionChanged { .. } => ErrorCategory::PerFrame,
            Self::Encode(e) => e.category(),
            Self::ConfigurationParse(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.category().exit_code()
    }
}

impl CaptureError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unsupported | Self::NoDuplicableOutput { .. } | Self::Device { .. } => {
                ErrorCategory::Setup
            }
            _ => ErrorCategory::PerFrame,
        }
    }
}

impl EncodeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InitFailed { .. }
            | Self::Negotiation { .. }
            | Self::EncoderUnavailable { .. }
            | Self::Pipeline(_) => ErrorCategory::Setup,
            Self::FinalizeFailed { .. } => ErrorCategory::Finalize,
            Self::InvalidState { .. } | Self::TimestampOrder { .. } | Self::WriteFailed { .. } => {
                ErrorCategory::PerFrame
            }
        }
    }
}
