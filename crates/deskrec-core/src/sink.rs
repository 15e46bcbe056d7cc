//! Encoder-side seam: the [`EncodeSink`] trait and the stream descriptors negotiated when a
//! session is opened.

use std::path::PathBuf;

use crate::config::RecorderConfig;
use crate::errors::EncodeError;
use crate::types::{AdapterInfo, MediaSample, PixelFormat, Resolution, RowOrder, VideoCodec};

/// Exact rational frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub fn per_second(fps: u32) -> Self {
        Self { numerator: fps, denominator: 1 }
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlaceMode {
    Progressive,
}

/// What travels on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Uncompressed, fixed-format pixels.
    Raw { format: PixelFormat, row_order: RowOrder },
    /// Compressed video.
    Compressed { codec: VideoCodec, bitrate_bps: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub format: StreamFormat,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub interlace: InterlaceMode,
}

/// Everything an encoder needs to open one recording.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub output_path: PathBuf,
    /// What the container will hold.
    pub output: StreamDescriptor,
    /// What [`EncodeSink::write_sample`] will be fed.
    pub input: StreamDescriptor,
    /// GPU adapter of the capture device, for hardware encoders that can share it.
    pub adapter: Option<AdapterInfo>,
}

impl SessionSpec {
    /// Describe a recording of `resolution` frames according to `config`.
    ///
    /// Input samples are packed bottom-up (see [`crate::sample::pack_rows_flipped`]).
    pub fn new(config: &RecorderConfig, resolution: Resolution, adapter: Option<AdapterInfo>) -> Self {
        let frame_rate = FrameRate::per_second(config.target_fps);
        let bitrate_bps = u32::try_from(config.bitrate_bps).unwrap_or(u32::MAX);
        Self {
            output_path: config.output_path.clone(),
            output: StreamDescriptor {
                format: StreamFormat::Compressed { codec: config.codec, bitrate_bps },
                resolution,
                frame_rate,
                interlace: InterlaceMode::Progressive,
            },
            input: StreamDescriptor {
                format: StreamFormat::Raw { format: PixelFormat::Bgrx8, row_order: RowOrder::BottomUp },
                resolution,
                frame_rate,
                interlace: InterlaceMode::Progressive,
            },
            adapter,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.output.resolution
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.output.frame_rate
    }

    /// Check that both descriptors are acceptable and agree with each other.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let fail = |reason: String| -> Result<(), EncodeError> { Err(EncodeError::Negotiation { reason }) };

        let StreamFormat::Compressed { bitrate_bps, .. } = self.output.format else {
            return fail("output stream must be compressed".into());
        };
        if !matches!(self.input.format, StreamFormat::Raw { .. }) {
            return fail("input stream must be uncompressed".into());
        }
        if bitrate_bps == 0 {
            return fail("output bitrate is zero".into());
        }
        for (name, desc) in [("output", &self.output), ("input", &self.input)] {
            let Resolution { width, height } = desc.resolution;
            if width == 0 || height == 0 {
                return fail(format!("{name} frame size {} is empty", desc.resolution));
            }
            // 4:2:0 chroma subsampling in every supported codec.
            if width % 2 != 0 || height % 2 != 0 {
                return fail(format!("{name} frame size {} is not even", desc.resolution));
            }
            if desc.frame_rate.numerator == 0 || desc.frame_rate.denominator == 0 {
                return fail(format!("{name} frame rate {} is invalid", desc.frame_rate));
            }
        }
        if self.input.resolution != self.output.resolution {
            return fail(format!(
                "input size {} differs from output size {}",
                self.input.resolution, self.output.resolution
            ));
        }
        if self.input.frame_rate != self.output.frame_rate {
            return fail(format!(
                "input rate {} differs from output rate {}",
                self.input.frame_rate, self.output.frame_rate
            ));
        }
        Ok(())
    }
}

/// A streaming encoder writing one video stream into one container.
///
/// Lifecycle: opened (implementation-specific constructor) → `begin_writing` once →
/// `write_sample`* → `finalize` exactly once.
pub trait EncodeSink {
    fn begin_writing(&mut self) -> Result<(), EncodeError>;

    /// Submit one sample. Timestamps must strictly increase.
    fn write_sample(&mut self, sample: MediaSample) -> Result<(), EncodeError>;

    /// Flush the encoder and close the container.
    fn finalize(&mut self) -> Result<(), EncodeError>;
}
