//! Repacks a mapped frame into a tightly packed, vertically inverted buffer and wraps it
//! in a [`MediaSample`].

use bytes::Bytes;

use crate::errors::SampleError;
use crate::source::StagingBuffer;
use crate::types::{MediaSample, PixelFormat, Resolution};

/// Builds encoder samples of one fixed resolution and per-frame duration.
#[derive(Debug, Clone)]
pub struct SampleBuilder {
    resolution: Resolution,
    format: PixelFormat,
    frame_duration_hns: u64,
}

impl SampleBuilder {
    pub fn new(resolution: Resolution, format: PixelFormat, frame_duration_hns: u64) -> Self {
        Self { resolution, format, frame_duration_hns }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn frame_duration_hns(&self) -> u64 {
        self.frame_duration_hns
    }

    /// Pack `staging` into a new sample stamped at `pts_hns`.
    pub fn build(&self, staging: &StagingBuffer<'_>, pts_hns: u64) -> Result<MediaSample, SampleError> {
        if staging.resolution() != self.resolution {
            return Err(SampleError::DimensionMismatch {
                expected: self.resolution,
                actual: staging.resolution(),
            });
        }

        let len = self.resolution.packed_len(self.format);
        let mut packed = Vec::new();
        packed
            .try_reserve_exact(len)
            .map_err(|_| SampleError::AllocationFailed { bytes: len })?;
        packed.resize(len, 0);

        pack_rows_flipped(staging.data(), staging.row_pitch(), self.resolution, &mut packed)?;

        Ok(MediaSample {
            data: Bytes::from(packed),
            pts_hns,
            duration_hns: self.frame_duration_hns,
            resolution: self.resolution,
            format: self.format,
        })
    }
}

/// Copy `resolution.height` rows of `width * 4` bytes from `src` (rows `row_pitch` apart) into
/// `dst`, last source row first. `dst` must be exactly `width * height * 4` bytes.
pub fn pack_rows_flipped(
    src: &[u8],
    row_pitch: usize,
    resolution: Resolution,
    dst: &mut [u8],
) -> Result<(), SampleError> {
    if resolution.is_empty() {
        return Err(SampleError::EmptyFrame { resolution });
    }

    let row_bytes = resolution.width as usize * 4;
    let height = resolution.height as usize;
    if row_pitch < row_bytes {
        return Err(SampleError::PitchTooSmall { row_pitch, row_bytes });
    }

    // The last row need not carry its padding.
    let needed = (height - 1) * row_pitch + row_bytes;
    if src.len() < needed {
        return Err(SampleError::BufferTooSmall { needed, available: src.len() });
    }
    if dst.len() != row_bytes * height {
        return Err(SampleError::BufferTooSmall { needed: row_bytes * height, available: dst.len() });
    }

    for (dst_row, src_y) in dst.chunks_exact_mut(row_bytes).zip((0..height).rev()) {
        let start = src_y * row_pitch;
        dst_row.copy_from_slice(&src[start..start + row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rows filled with their own index; padding filled with 0xEE.
    fn padded_rows(res: Resolution, row_pitch: usize) -> Vec<u8> {
        let row_bytes = res.width as usize * 4;
        let mut buf = vec![0xEE; row_pitch * res.height as usize];
        for y in 0..res.height as usize {
            buf[y * row_pitch..y * row_pitch + row_bytes].fill(y as u8);
        }
        buf
    }

    #[test]
    fn inverts_rows_and_strips_padding() {
        let res = Resolution::new(3, 4);
        let pitch = 3 * 4 + 20;
        let src = padded_rows(res, pitch);
        let mut dst = vec![0u8; res.packed_len(PixelFormat::Bgra8)];

        pack_rows_flipped(&src, pitch, res, &mut dst).unwrap();

        let rows: Vec<&[u8]> = dst.chunks_exact(12).collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].iter().all(|&b| b == 3), "top output row is the last input row");
        assert!(rows[3].iter().all(|&b| b == 0), "bottom output row is the first input row");
        assert!(!dst.contains(&0xEE), "padding must not leak into packed output");
    }

    #[test]
    fn flipping_twice_restores_order() {
        let res = Resolution::new(5, 7);
        let pitch = 5 * 4 + 12;
        let src = padded_rows(res, pitch);

        let mut once = vec![0u8; res.packed_len(PixelFormat::Bgra8)];
        pack_rows_flipped(&src, pitch, res, &mut once).unwrap();
        let mut twice = vec![0u8; once.len()];
        pack_rows_flipped(&once, 5 * 4, res, &mut twice).unwrap();

        for (y, row) in twice.chunks_exact(20).enumerate() {
            assert!(row.iter().all(|&b| b == y as u8));
        }
    }

    #[test]
    fn accepts_unpadded_last_row() {
        let res = Resolution::new(2, 2);
        let pitch = 16;
        // Second row ends right after its 8 logical bytes.
        let src = [vec![1u8; 8], vec![0xEE; 8], vec![2u8; 8]].concat();
        let mut dst = vec![0u8; 16];
        pack_rows_flipped(&src, pitch, res, &mut dst).unwrap();
        assert_eq!(&dst[..8], &[2u8; 8]);
        assert_eq!(&dst[8..], &[1u8; 8]);
    }

    #[test]
    fn rejects_pitch_narrower_than_row() {
        let res = Resolution::new(4, 2);
        let mut dst = vec![0u8; 32];
        let err = pack_rows_flipped(&[0u8; 64], 8, res, &mut dst).unwrap_err();
        assert!(matches!(err, SampleError::PitchTooSmall { row_pitch: 8, row_bytes: 16 }));
    }

    #[test]
    fn rejects_short_mapping() {
        let res = Resolution::new(4, 4);
        let mut dst = vec![0u8; 64];
        let err = pack_rows_flipped(&[0u8; 40], 16, res, &mut dst).unwrap_err();
        assert!(matches!(err, SampleError::BufferTooSmall { needed: 64, available: 40 }));
    }

    #[test]
    fn builds_timestamped_sample() {
        let res = Resolution::new(8, 2);
        let pitch = 64;
        let src = padded_rows(res, pitch);
        let staging = StagingBuffer::new(&src, pitch, res);
        let builder = SampleBuilder::new(res, PixelFormat::Bgra8, 333_333);

        let sample = builder.build(&staging, 666_666).unwrap();
        assert_eq!(sample.len(), 8 * 2 * 4);
        assert_eq!(sample.pts_hns, 666_666);
        assert_eq!(sample.duration_hns, 333_333);
        assert_eq!(sample.pts_ns(), 66_666_600);
        assert!(sample.data[..32].iter().all(|&b| b == 1));
    }

    #[test]
    fn mismatched_staging_yields_no_sample() {
        let src = vec![0u8; 4 * 4 * 4];
        let staging = StagingBuffer::new(&src, 16, Resolution::new(4, 4));
        let builder = SampleBuilder::new(Resolution::new(8, 2), PixelFormat::Bgra8, 1);
        assert!(matches!(
            builder.build(&staging, 0),
            Err(SampleError::DimensionMismatch { .. })
        ));
    }
}
