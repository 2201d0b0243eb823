//! Native sensor encodings and conversion to 8-bit luminance.
//!
//! Every frame leaving the acquirer is Mono8. Conversion honors the source
//! row stride and always produces a tightly packed buffer (stride == width).
//!
//! Bayer mosaics are reconstructed with the selected `ColorProcessing` mode
//! before BT.601 luma weighting. The result is meant to look the same as a
//! vendor SDK's "high quality linear" output, not to match it bit for bit.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "mono8")]
    Mono8,
    /// 16-bit little-endian mono; the high byte is kept.
    #[serde(rename = "mono16")]
    Mono16,
    /// Polarization mosaic (0/45/90/135 degree cells). Each site is already
    /// a luminance sample.
    #[serde(rename = "polarized8")]
    Polarized8,
    #[serde(rename = "bayer_rg8")]
    BayerRG8,
    #[serde(rename = "bayer_gr8")]
    BayerGR8,
    #[serde(rename = "bayer_gb8")]
    BayerGB8,
    #[serde(rename = "bayer_bg8")]
    BayerBG8,
    #[serde(rename = "rgb8")]
    Rgb8,
    /// Packed 4:2:2, Y0 U Y1 V.
    #[serde(rename = "yuyv")]
    Yuyv,
}

impl PixelFormat {
    /// Minimum number of bytes in one row of `width` pixels.
    pub fn min_stride(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Mono8
            | PixelFormat::Polarized8
            | PixelFormat::BayerRG8
            | PixelFormat::BayerGR8
            | PixelFormat::BayerGB8
            | PixelFormat::BayerBG8 => width,
            PixelFormat::Mono16 | PixelFormat::Yuyv => width * 2,
            PixelFormat::Rgb8 => width * 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Polarized8 => "Polarized8",
            PixelFormat::BayerRG8 => "BayerRG8",
            PixelFormat::BayerGR8 => "BayerGR8",
            PixelFormat::BayerGB8 => "BayerGB8",
            PixelFormat::BayerBG8 => "BayerBG8",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Yuyv => "YUYV",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interpolation used when a conversion has to reconstruct color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorProcessing {
    /// Bilinear demosaic over the 3x3 neighborhood of every site.
    #[default]
    HqLinear,
    /// Each 2x2 Bayer cell collapses to one color.
    NearestNeighbor,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("frame has zero width or height")]
    Empty,
    #[error("frame dimensions overflow")]
    DimensionsOverflow,
    #[error("{format} stride {stride} is smaller than one row ({min} bytes)")]
    StrideTooSmall {
        format: PixelFormat,
        stride: usize,
        min: usize,
    },
    #[error("{format} buffer truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Convert a native frame to a packed Mono8 buffer of `width * height` bytes.
pub fn convert_to_mono8(
    pixels: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    processing: ColorProcessing,
) -> Result<Vec<u8>, ConversionError> {
    if width == 0 || height == 0 {
        return Err(ConversionError::Empty);
    }
    let min = format.min_stride(width);
    if stride < min {
        return Err(ConversionError::StrideTooSmall {
            format,
            stride,
            min,
        });
    }
    // The last row may omit its padding.
    let expected = stride
        .checked_mul(height as usize - 1)
        .and_then(|v| v.checked_add(min))
        .ok_or(ConversionError::DimensionsOverflow)?;
    if pixels.len() < expected {
        return Err(ConversionError::Truncated {
            format,
            expected,
            actual: pixels.len(),
        });
    }

    let plane = Plane {
        pixels,
        stride,
        width: width as usize,
        height: height as usize,
    };
    let out = match format {
        PixelFormat::Mono8 | PixelFormat::Polarized8 => plane.map(|row, x| row[x]),
        PixelFormat::Mono16 => plane.map(|row, x| row[2 * x + 1]),
        PixelFormat::Yuyv => plane.map(|row, x| row[2 * x]),
        PixelFormat::Rgb8 => plane.map(|row, x| {
            luma(
                row[3 * x] as u32,
                row[3 * x + 1] as u32,
                row[3 * x + 2] as u32,
            )
        }),
        PixelFormat::BayerRG8 => demosaic(&plane, BayerPattern::Rggb, processing),
        PixelFormat::BayerGR8 => demosaic(&plane, BayerPattern::Grbg, processing),
        PixelFormat::BayerGB8 => demosaic(&plane, BayerPattern::Gbrg, processing),
        PixelFormat::BayerBG8 => demosaic(&plane, BayerPattern::Bggr, processing),
    };
    Ok(out)
}

/// BT.601 luma with 8-bit fixed point weights (77 + 150 + 29 = 256).
fn luma(r: u32, g: u32, b: u32) -> u8 {
    ((77 * r + 150 * g + 29 * b + 128) >> 8).min(255) as u8
}

struct Plane<'a> {
    pixels: &'a [u8],
    stride: usize,
    width: usize,
    height: usize,
}

impl Plane<'_> {
    fn row(&self, y: usize) -> &[u8] {
        &self.pixels[y * self.stride..]
    }

    fn map(&self, f: impl Fn(&[u8], usize) -> u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            let row = self.row(y);
            for x in 0..self.width {
                out.push(f(row, x));
            }
        }
        out
    }

    /// Sample with mirror reflection at the borders. Reflection keeps the
    /// coordinate parity, so the Bayer color of the sample is preserved,
    /// except along a dimension of length 1 where every index folds to 0.
    fn at(&self, x: isize, y: isize) -> u32 {
        let x = reflect(x, self.width);
        let y = reflect(y, self.height);
        self.pixels[y * self.stride + x] as u32
    }
}

fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i.clamp(0, n - 1) as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BayerPattern {
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Site {
    Red,
    /// Green on a row shared with red samples.
    GreenRed,
    /// Green on a row shared with blue samples.
    GreenBlue,
    Blue,
}

impl BayerPattern {
    fn site(self, x: usize, y: usize) -> Site {
        let cell = (x & 1, y & 1);
        match (self, cell) {
            (BayerPattern::Rggb, (0, 0)) => Site::Red,
            (BayerPattern::Rggb, (1, 0)) => Site::GreenRed,
            (BayerPattern::Rggb, (0, 1)) => Site::GreenBlue,
            (BayerPattern::Rggb, _) => Site::Blue,
            (BayerPattern::Grbg, (0, 0)) => Site::GreenRed,
            (BayerPattern::Grbg, (1, 0)) => Site::Red,
            (BayerPattern::Grbg, (0, 1)) => Site::Blue,
            (BayerPattern::Grbg, _) => Site::GreenBlue,
            (BayerPattern::Gbrg, (0, 0)) => Site::GreenBlue,
            (BayerPattern::Gbrg, (1, 0)) => Site::Blue,
            (BayerPattern::Gbrg, (0, 1)) => Site::Red,
            (BayerPattern::Gbrg, _) => Site::GreenRed,
            (BayerPattern::Bggr, (0, 0)) => Site::Blue,
            (BayerPattern::Bggr, (1, 0)) => Site::GreenBlue,
            (BayerPattern::Bggr, (0, 1)) => Site::GreenRed,
            (BayerPattern::Bggr, _) => Site::Red,
        }
    }
}

fn demosaic(plane: &Plane<'_>, pattern: BayerPattern, processing: ColorProcessing) -> Vec<u8> {
    match processing {
        ColorProcessing::HqLinear => demosaic_bilinear(plane, pattern),
        ColorProcessing::NearestNeighbor => demosaic_nearest(plane, pattern),
    }
}

fn demosaic_bilinear(plane: &Plane<'_>, pattern: BayerPattern) -> Vec<u8> {
    let mut out = Vec::with_capacity(plane.width * plane.height);
    for y in 0..plane.height {
        for x in 0..plane.width {
            let (xi, yi) = (x as isize, y as isize);
            let center = plane.at(xi, yi);
            let cross = (plane.at(xi - 1, yi)
                + plane.at(xi + 1, yi)
                + plane.at(xi, yi - 1)
                + plane.at(xi, yi + 1)
                + 2)
                / 4;
            let diagonal = (plane.at(xi - 1, yi - 1)
                + plane.at(xi + 1, yi - 1)
                + plane.at(xi - 1, yi + 1)
                + plane.at(xi + 1, yi + 1)
                + 2)
                / 4;
            let horizontal = (plane.at(xi - 1, yi) + plane.at(xi + 1, yi) + 1) / 2;
            let vertical = (plane.at(xi, yi - 1) + plane.at(xi, yi + 1) + 1) / 2;

            let (r, g, b) = match pattern.site(x, y) {
                Site::Red => (center, cross, diagonal),
                Site::Blue => (diagonal, cross, center),
                Site::GreenRed => (horizontal, center, vertical),
                Site::GreenBlue => (vertical, center, horizontal),
            };
            out.push(luma(r, g, b));
        }
    }
    out
}

fn demosaic_nearest(plane: &Plane<'_>, pattern: BayerPattern) -> Vec<u8> {
    let mut out = Vec::with_capacity(plane.width * plane.height);
    for y in 0..plane.height {
        for x in 0..plane.width {
            let (cx, cy) = ((x & !1) as isize, (y & !1) as isize);
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (sx, sy) = (
                    reflect(cx + dx, plane.width),
                    reflect(cy + dy, plane.height),
                );
                let value = plane.pixels[sy * plane.stride + sx] as u32;
                match pattern.site(sx, sy) {
                    Site::Red => r = value,
                    Site::Blue => b = value,
                    Site::GreenRed | Site::GreenBlue => g += value,
                }
            }
            out.push(luma(r, (g + 1) / 2, b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono8_drops_row_padding() -> Result<(), ConversionError> {
        // 2x2 image with 2 bytes of padding per row.
        let pixels = [1, 2, 0xEE, 0xEE, 3, 4, 0xEE, 0xEE];
        let out = convert_to_mono8(
            &pixels,
            2,
            2,
            4,
            PixelFormat::Mono8,
            ColorProcessing::HqLinear,
        )?;
        assert_eq!(out, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn last_row_padding_is_optional() -> Result<(), ConversionError> {
        let pixels = [1, 2, 0xEE, 3, 4];
        let out = convert_to_mono8(
            &pixels,
            2,
            2,
            3,
            PixelFormat::Polarized8,
            ColorProcessing::HqLinear,
        )?;
        assert_eq!(out, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn uniform_bayer_stays_uniform() -> Result<(), ConversionError> {
        let pixels = vec![128u8; 6 * 4];
        for processing in [ColorProcessing::HqLinear, ColorProcessing::NearestNeighbor] {
            for format in [
                PixelFormat::BayerRG8,
                PixelFormat::BayerGR8,
                PixelFormat::BayerGB8,
                PixelFormat::BayerBG8,
            ] {
                let out = convert_to_mono8(&pixels, 6, 4, 6, format, processing)?;
                assert_eq!(out, vec![128u8; 24], "{format} {processing:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn bayer_red_field_is_dim() -> Result<(), ConversionError> {
        // Pure red scene: only red sites are lit.
        let (w, h) = (4usize, 4usize);
        let mut pixels = vec![0u8; w * h];
        for y in (0..h).step_by(2) {
            for x in (0..w).step_by(2) {
                pixels[y * w + x] = 255;
            }
        }
        let out = convert_to_mono8(
            &pixels,
            w as u32,
            h as u32,
            w,
            PixelFormat::BayerRG8,
            ColorProcessing::HqLinear,
        )?;
        assert!(out.iter().all(|&v| v == luma(255, 0, 0)));
        Ok(())
    }

    #[test]
    fn nearest_single_column_keeps_site_colors() -> Result<(), ConversionError> {
        // One RGGB column: a red sample over a green one, no blue at all.
        let out = convert_to_mono8(
            &[200, 100],
            1,
            2,
            1,
            PixelFormat::BayerRG8,
            ColorProcessing::NearestNeighbor,
        )?;
        assert_eq!(out, vec![luma(200, 100, 0); 2]);
        Ok(())
    }

    #[test]
    fn rgb_uses_bt601_weights() -> Result<(), ConversionError> {
        let pixels = [255, 255, 255, 0, 0, 0, 0, 255, 0];
        let out = convert_to_mono8(
            &pixels,
            3,
            1,
            9,
            PixelFormat::Rgb8,
            ColorProcessing::HqLinear,
        )?;
        assert_eq!(out, vec![255, 0, 149]);
        Ok(())
    }

    #[test]
    fn mono16_keeps_high_byte_and_yuyv_keeps_luma() -> Result<(), ConversionError> {
        let mono16 = [0x34, 0x12, 0xFF, 0xAB];
        let out = convert_to_mono8(
            &mono16,
            2,
            1,
            4,
            PixelFormat::Mono16,
            ColorProcessing::HqLinear,
        )?;
        assert_eq!(out, vec![0x12, 0xAB]);

        let yuyv = [10, 128, 20, 128];
        let out = convert_to_mono8(
            &yuyv,
            2,
            1,
            4,
            PixelFormat::Yuyv,
            ColorProcessing::HqLinear,
        )?;
        assert_eq!(out, vec![10, 20]);
        Ok(())
    }

    #[test]
    fn rejects_short_buffers_and_strides() {
        let err = convert_to_mono8(&[0; 3], 2, 2, 2, PixelFormat::Mono8, ColorProcessing::HqLinear)
            .unwrap_err();
        assert_eq!(
            err,
            ConversionError::Truncated {
                format: PixelFormat::Mono8,
                expected: 4,
                actual: 3
            }
        );

        let err = convert_to_mono8(&[0; 12], 2, 2, 3, PixelFormat::Rgb8, ColorProcessing::HqLinear)
            .unwrap_err();
        assert!(matches!(err, ConversionError::StrideTooSmall { min: 6, .. }));

        let err = convert_to_mono8(&[], 0, 2, 0, PixelFormat::Mono8, ColorProcessing::HqLinear)
            .unwrap_err();
        assert_eq!(err, ConversionError::Empty);
    }

    #[test]
    fn pixel_format_names_parse_from_config() {
        let format: PixelFormat = serde_json::from_str("\"bayer_rg8\"").unwrap();
        assert_eq!(format, PixelFormat::BayerRG8);
        let processing: ColorProcessing = serde_json::from_str("\"nearest_neighbor\"").unwrap();
        assert_eq!(processing, ColorProcessing::NearestNeighbor);
    }
}
