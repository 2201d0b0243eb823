//! Caller-owned output frames.
//!
//! A `Frame` owns its pixel buffer outright. It never borrows from the
//! device's buffer pool, so it can outlive the session that produced it.

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::Instant;

/// Output encoding name for single-channel frames (ROS `sensor_msgs` style).
pub const MONO8: &str = "mono8";
/// Output encoding name for three-channel frames.
pub const RGB8: &str = "rgb8";

#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// 1 (mono) or 3 (RGB).
    pub channels: u8,
    /// Bytes per row. Always `width * channels`.
    pub stride: usize,
    /// Device frame counter of the capture this frame came from.
    pub frame_id: u64,
    /// When the acquirer finished converting the frame.
    pub converted_at: Instant,
    data: Vec<u8>,
}

impl Frame {
    /// Build a frame from a packed pixel buffer.
    pub fn new(width: u32, height: u32, channels: u8, frame_id: u64, data: Vec<u8>) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let stride = (width as usize)
            .checked_mul(channels as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let expected = stride
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            channels,
            stride,
            frame_id,
            converted_at: Instant::now(),
            data,
        })
    }

    /// Wrap a packed Mono8 buffer produced by the converter, which already
    /// guarantees `data.len() == width * height`.
    pub(crate) fn mono8(width: u32, height: u32, frame_id: u64, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels: 1,
            stride: width as usize,
            frame_id,
            converted_at: Instant::now(),
            data,
        }
    }

    pub fn encoding(&self) -> &'static str {
        if self.channels == 3 {
            RGB8
        } else {
            MONO8
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        self.data.get(start..start + self.stride)
    }

    /// Channel values of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width {
            return None;
        }
        let channels = self.channels as usize;
        let start = x as usize * channels;
        self.row(y).map(|row| &row[start..start + channels])
    }

    /// Average sample value over the whole buffer.
    pub fn mean_luminance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f64 / self.data.len() as f64
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoding", &self.encoding())
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_frame_accessors() -> Result<()> {
        let frame = Frame::new(3, 2, 1, 7, vec![0, 1, 2, 10, 11, 12])?;
        assert_eq!(frame.stride, 3);
        assert_eq!(frame.encoding(), MONO8);
        assert_eq!(frame.row(1), Some(&[10u8, 11, 12][..]));
        assert_eq!(frame.pixel(2, 0), Some(&[2u8][..]));
        assert_eq!(frame.pixel(3, 0), None);
        assert_eq!(frame.row(2), None);
        assert!((frame.mean_luminance() - 6.0).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn rgb_frame_pixels() -> Result<()> {
        let frame = Frame::new(2, 1, 3, 0, vec![1, 2, 3, 4, 5, 6])?;
        assert_eq!(frame.encoding(), RGB8);
        assert_eq!(frame.pixel(1, 0), Some(&[4u8, 5, 6][..]));
        Ok(())
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(Frame::new(2, 2, 2, 0, vec![0; 8]).is_err());
        assert!(Frame::new(2, 2, 1, 0, vec![0; 3]).is_err());
    }
}
