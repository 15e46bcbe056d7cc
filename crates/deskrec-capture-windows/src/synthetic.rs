//! Synthetic capture source: a moving test pattern behind the same seams as DXGI.
//!
//! Rows are padded like a hardware staging texture so the pitch handling downstream is
//! exercised on every platform.

use std::thread;
use std::time::{Duration, Instant};

use deskrec_core::{
    Acquired, CaptureError, CapturedFrame, FrameSource, FrameTransfer, Resolution, StagingBuffer,
};
use tracing::{debug, info};

const CHECKER_SIZE: u32 = 32;
const BAR_WIDTH: u32 = 16;
/// Fill byte for the pitch padding, never part of a visible pixel.
const PADDING_BYTE: u8 = 0xCD;

pub struct SyntheticFrame {
    resolution: Resolution,
    sequence:   u64,
}

impl SyntheticFrame {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl CapturedFrame for SyntheticFrame {
    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

pub struct SyntheticSource {
    resolution:     Resolution,
    row_pitch:      usize,
    frame_interval: Duration,
    last_frame:     Option<Instant>,
    outstanding:    bool,
    sequence:       u64,
    staging:        Vec<u8>,
}

impl SyntheticSource {
    /// A source of `resolution` frames whose rows carry `row_padding` extra bytes.
    pub fn new(resolution: Resolution, row_padding: u32) -> Self {
        let row_pitch = resolution.width as usize * 4 + row_padding as usize;
        info!(
            "Synthetic capture initialized {} (row pitch {} bytes)",
            resolution, row_pitch
        );
        Self {
            resolution,
            row_pitch,
            frame_interval: Duration::ZERO,
            last_frame: None,
            outstanding: false,
            sequence: 0,
            staging: vec![PADDING_BYTE; row_pitch * resolution.height as usize],
        }
    }

    /// Pace frames like a display refreshing every `interval`.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn frames_acquired(&self) -> u64 {
        self.sequence
    }

    fn render(&mut self, sequence: u64) {
        let Resolution { width, height } = self.resolution;
        let bar_x = (sequence as u32 * 8) % width.max(1);
        for y in 0..height {
            let row = &mut self.staging[y as usize * self.row_pitch..][..width as usize * 4];
            for (x, px) in (0..width).zip(row.chunks_exact_mut(4)) {
                let bgra = if x >= bar_x && x < bar_x + BAR_WIDTH {
                    [255, 255, 255, 255]
                } else if ((x / CHECKER_SIZE) + (y / CHECKER_SIZE)) % 2 == 0 {
                    [160, 80, 40, 255]
                } else {
                    [112, 56, 28, 255]
                };
                px.copy_from_slice(&bgra);
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    type Frame = SyntheticFrame;

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Acquired<SyntheticFrame>, CaptureError> {
        if self.outstanding {
            return Err(CaptureError::FrameOutstanding);
        }

        if let Some(last) = self.last_frame {
            let wait = (last + self.frame_interval).saturating_duration_since(Instant::now());
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(Acquired::Timeout);
            }
            thread::sleep(wait);
        }

        self.last_frame = Some(Instant::now());
        self.outstanding = true;
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Acquired::Frame(SyntheticFrame { resolution: self.resolution, sequence }))
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if !self.outstanding {
            return Err(CaptureError::NoFrameOutstanding);
        }
        self.outstanding = false;
        Ok(())
    }
}

impl FrameTransfer for SyntheticSource {
    fn copy_to_staging(&mut self, frame: &SyntheticFrame) -> Result<StagingBuffer<'_>, CaptureError> {
        self.render(frame.sequence);
        let sequence = frame.sequence;
        Ok(StagingBuffer::new(&self.staging, self.row_pitch, frame.resolution)
            .on_unmap(move || debug!("Synthetic frame {sequence} unmapped")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_beyond_logical_width() {
        let mut source = SyntheticSource::new(Resolution::new(64, 8), 48);
        assert_eq!(source.row_pitch(), 64 * 4 + 48);

        let Acquired::Frame(frame) = source.acquire(Duration::from_millis(10)).unwrap() else {
            panic!("synthetic source produces a frame immediately");
        };
        {
            let staging = source.copy_to_staging(&frame).unwrap();
            assert_eq!(staging.row_pitch(), 304);
            let first_row = &staging.data()[..304];
            assert!(first_row[..256].chunks_exact(4).all(|px| px[3] == 255));
            assert!(first_row[256..].iter().all(|&b| b == PADDING_BYTE));
        }
        source.release().unwrap();
    }

    #[test]
    fn one_frame_outstanding_at_a_time() {
        let mut source = SyntheticSource::new(Resolution::new(8, 8), 0);
        let timeout = Duration::from_millis(10);

        assert!(matches!(source.release(), Err(CaptureError::NoFrameOutstanding)));
        assert!(matches!(source.acquire(timeout), Ok(Acquired::Frame(_))));
        assert!(matches!(source.acquire(timeout), Err(CaptureError::FrameOutstanding)));
        source.release().unwrap();
        assert!(matches!(source.acquire(timeout), Ok(Acquired::Frame(_))));
        assert_eq!(source.frames_acquired(), 2);
    }

    #[test]
    fn slow_refresh_times_out() {
        let mut source = SyntheticSource::new(Resolution::new(8, 8), 0)
            .with_frame_interval(Duration::from_secs(60));
        let timeout = Duration::from_millis(5);

        assert!(matches!(source.acquire(timeout), Ok(Acquired::Frame(_))));
        source.release().unwrap();
        assert!(matches!(source.acquire(timeout), Ok(Acquired::Timeout)));
        // A timeout leaves nothing outstanding.
        assert!(matches!(source.release(), Err(CaptureError::NoFrameOutstanding)));
    }

    #[test]
    fn bar_moves_between_frames() {
        let mut source = SyntheticSource::new(Resolution::new(64, 2), 0);
        let timeout = Duration::from_millis(10);
        let mut first_rows = Vec::new();
        for _ in 0..2 {
            let Acquired::Frame(frame) = source.acquire(timeout).unwrap() else { unreachable!() };
            first_rows.push(source.copy_to_staging(&frame).unwrap().data()[..256].to_vec());
            source.release().unwrap();
        }
        assert_ne!(first_rows[0], first_rows[1]);
    }
}
