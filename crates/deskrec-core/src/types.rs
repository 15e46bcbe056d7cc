use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Media timestamps are expressed in 100-nanosecond units.
pub const HNS_PER_SECOND: u64 = 10_000_000;

// MARK: - Resolution

/// Output resolution of a capture source (and therefore of the encoded stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const QHD: Self = Self { width: 2560, height: 1440 };
    pub const UHD: Self = Self { width: 3840, height: 2160 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size in bytes of one tightly packed frame at `format`.
    pub fn packed_len(&self, format: PixelFormat) -> usize {
        self.total_pixels() as usize * format.bytes_per_pixel()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::H265 => write!(f, "H.265"),
        }
    }
}

// MARK: - PixelFormat

/// Pixel layout of captured and packed frames. Always 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Blue, green, red, alpha. What desktop duplication hands out.
    Bgra8,
    /// Blue, green, red, unused. The same bytes, with alpha ignored by the encoder.
    Bgrx8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

// MARK: - RowOrder

/// Vertical order of rows in a packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    TopDown,
    BottomUp,
}

// MARK: - AdapterInfo

/// Identity of the GPU adapter a capture source lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Locally unique identifier of the adapter (`LUID` packed as high << 32 | low).
    pub luid: i64,
    pub description: String,
}

// MARK: - MediaSample

/// One encoder-ready frame: tightly packed pixels plus timing.
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    /// Presentation timestamp in 100 ns units.
    pub pts_hns: u64,
    /// Duration in 100 ns units.
    pub duration_hns: u64,
    pub resolution: Resolution,
    pub format: PixelFormat,
}

impl MediaSample {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pts_ns(&self) -> u64 {
        self.pts_hns * 100
    }

    pub fn duration_ns(&self) -> u64 {
        self.duration_hns * 100
    }
}
