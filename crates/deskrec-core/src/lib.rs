//! deskrec-core: types, configuration, errors and the capture → encode pipeline shared by
//! every deskrec crate.
//!
//! Platform backends plug in through two seams:
//! - [`source::FrameSource`] + [`source::FrameTransfer`] on the capture side
//! - [`sink::EncodeSink`] on the encoder side

pub mod config;
pub mod errors;
pub mod pipeline;
pub mod sample;
pub mod sink;
pub mod source;
pub mod types;

pub use config::{RecorderConfig, SourceKind, MAX_TARGET_FPS};
pub use errors::{CaptureError, EncodeError, ErrorCategory, RecorderError, SampleError};
pub use pipeline::{CapturePipeline, PipelineState, PipelineStatus, RecordingSummary};
pub use sample::SampleBuilder;
pub use sink::{EncodeSink, FrameRate, InterlaceMode, SessionSpec, StreamDescriptor, StreamFormat};
pub use source::{Acquired, CapturedFrame, FrameSource, FrameTransfer, StagingBuffer};
pub use types::*;
