use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RecorderError;
use crate::types::{VideoCodec, HNS_PER_SECOND};

/// Highest accepted frame rate. Keeps the per-frame duration well above one 100 ns tick.
pub const MAX_TARGET_FPS: u32 = 1000;

/// Recording configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    #[serde(alias = "outputPath")]
    pub output_path: PathBuf,
    #[serde(alias = "targetFPS")]
    pub target_fps: u32,
    #[serde(alias = "durationSecs")]
    pub duration_secs: u32,
    #[serde(alias = "bitrateBps")]
    pub bitrate_bps: u64,
    pub codec: VideoCodec,
    #[serde(alias = "acquireTimeoutMs")]
    pub acquire_timeout_ms: u32,
    pub source: SourceKind,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    /// The first desktop-attached output that supports duplication.
    Desktop,
    /// A generated test pattern, available on every platform.
    Synthetic {
        width: u32,
        height: u32,
        /// Extra bytes appended to each row, emulating hardware pitch alignment.
        #[serde(default, alias = "rowPadding")]
        row_padding: u32,
    },
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output.mp4"),
            target_fps: 30,
            duration_secs: 5,
            bitrate_bps: 8_000_000,
            codec: VideoCodec::H264,
            acquire_timeout_ms: 1000,
            source: SourceKind::Desktop,
        }
    }
}

impl RecorderConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        let invalid = |reason: &str| -> Result<(), RecorderError> {
            Err(RecorderError::ConfigurationInvalid { reason: reason.to_owned() })
        };
        if self.target_fps == 0 || self.target_fps > MAX_TARGET_FPS {
            return invalid("target_fps must be between 1 and 1000");
        }
        if self.duration_secs == 0 {
            return invalid("duration_secs must be greater than zero");
        }
        if self.bitrate_bps == 0 || self.bitrate_bps > u32::MAX as u64 {
            return invalid("bitrate_bps must be between 1 and 4294967295");
        }
        if self.acquire_timeout_ms == 0 {
            return invalid("acquire_timeout_ms must be greater than zero");
        }
        if self.output_path.as_os_str().is_empty() {
            return invalid("output_path is empty");
        }
        if let SourceKind::Synthetic { width, height, .. } = self.source {
            if width == 0 || height == 0 {
                return invalid("synthetic source needs a non-zero width and height");
            }
        }
        Ok(())
    }

    /// Number of loop iterations: `fps × duration`.
    pub fn frame_count(&self) -> u64 {
        self.target_fps as u64 * self.duration_secs as u64
    }

    /// Fixed per-frame duration in 100 ns units.
    pub fn frame_duration_hns(&self) -> u64 {
        HNS_PER_SECOND / self.target_fps as u64
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms as u64)
    }
}
