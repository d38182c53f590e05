//! Pixel layouts and the pixel-source collaborator

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileError};
use crate::measure::Rect;

/// Packed 8-bit memory layouts a surface can be rasterised into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    R8G8B8,
    B8G8R8,
    R8G8B8A8,
    B8G8R8A8,
    A8R8G8B8,
    R8G8B8A8Premultiplied,
    B8G8R8A8Premultiplied,
    G8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::G8 => 1,
            PixelFormat::R8G8B8 | PixelFormat::B8G8R8 => 3,
            PixelFormat::R8G8B8A8
            | PixelFormat::B8G8R8A8
            | PixelFormat::A8R8G8B8
            | PixelFormat::R8G8B8A8Premultiplied
            | PixelFormat::B8G8R8A8Premultiplied => 4,
        }
    }

    pub const fn has_alpha(self) -> bool {
        self.bytes_per_pixel() == 4
    }

    /// Byte length of a tightly packed `width` x `height` buffer.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Appends one straight-alpha `[r, g, b, a]` pixel in this layout.
    pub fn push_rgba(self, [r, g, b, a]: [u8; 4], out: &mut Vec<u8>) {
        match self {
            PixelFormat::R8G8B8 => out.extend_from_slice(&[r, g, b]),
            PixelFormat::B8G8R8 => out.extend_from_slice(&[b, g, r]),
            PixelFormat::R8G8B8A8 => out.extend_from_slice(&[r, g, b, a]),
            PixelFormat::B8G8R8A8 => out.extend_from_slice(&[b, g, r, a]),
            PixelFormat::A8R8G8B8 => out.extend_from_slice(&[a, r, g, b]),
            PixelFormat::R8G8B8A8Premultiplied => {
                let [r, g, b] = premultiply([r, g, b], a);
                out.extend_from_slice(&[r, g, b, a]);
            }
            PixelFormat::B8G8R8A8Premultiplied => {
                let [r, g, b] = premultiply([r, g, b], a);
                out.extend_from_slice(&[b, g, r, a]);
            }
            PixelFormat::G8 => {
                let luma = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
                out.push(luma as u8);
            }
        }
    }

    /// Reads pixel `index` of a packed buffer back as `[r, g, b, a]`.
    /// Premultiplied layouts are returned as stored.
    pub fn rgba_at(self, bytes: &[u8], index: usize) -> [u8; 4] {
        let bpp = self.bytes_per_pixel();
        let p = &bytes[index * bpp..(index + 1) * bpp];
        match self {
            PixelFormat::R8G8B8 => [p[0], p[1], p[2], 0xFF],
            PixelFormat::B8G8R8 => [p[2], p[1], p[0], 0xFF],
            PixelFormat::R8G8B8A8 | PixelFormat::R8G8B8A8Premultiplied => [p[0], p[1], p[2], p[3]],
            PixelFormat::B8G8R8A8 | PixelFormat::B8G8R8A8Premultiplied => [p[2], p[1], p[0], p[3]],
            PixelFormat::A8R8G8B8 => [p[1], p[2], p[3], p[0]],
            PixelFormat::G8 => [p[0], p[0], p[0], 0xFF],
        }
    }
}

fn premultiply(rgb: [u8; 3], a: u8) -> [u8; 3] {
    rgb.map(|c| ((u16::from(c) * u16::from(a) + 127) / 255) as u8)
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Row-major, tightly packed pixels handed over by a [`PixelSource`].
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, bytes: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            bytes,
        }
    }

    /// Zero-filled buffer.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::new(width, height, format, vec![0; format.buffer_len(width, height)])
    }

    pub fn expected_len(&self) -> usize {
        self.format.buffer_len(self.width, self.height)
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Checks the byte length agrees with the declared shape.
    pub fn validate(&self) -> Result<()> {
        if self.bytes.len() != self.expected_len() {
            return Err(TileError::contract(format!(
                "{}x{} {} buffer holds {} bytes, expected {}",
                self.width,
                self.height,
                self.format,
                self.bytes.len(),
                self.expected_len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes.len", &self.bytes.len())
            .finish()
    }
}

/// Rasteriser supplying the pixels of a logical region at a zoom scale.
///
/// `rect` carries the unit and the virtual dpi of the grid being filled, so
/// `rect.to_pixel_rect()` gives the exact pixel region expected back.
pub trait PixelSource: Send + Sync {
    fn fetch(&self, rect: &Rect, scale: u32) -> Result<PixelBuffer>;
}

impl<F> PixelSource for F
where
    F: Fn(&Rect, u32) -> Result<PixelBuffer> + Send + Sync,
{
    fn fetch(&self, rect: &Rect, scale: u32) -> Result<PixelBuffer> {
        self(rect, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(PixelFormat::G8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::R8G8B8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::B8G8R8A8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::R8G8B8.buffer_len(100, 100), 30_000);
    }

    #[test]
    fn validate_rejects_short_buffers() {
        let ok = PixelBuffer::new(100, 100, PixelFormat::R8G8B8, vec![0; 30_000]);
        assert!(ok.validate().is_ok());
        let short = PixelBuffer::new(100, 100, PixelFormat::R8G8B8, vec![0; 29_999]);
        assert!(matches!(
            short.validate(),
            Err(TileError::ContractViolation { .. })
        ));
    }

    #[test]
    fn channel_layouts() {
        let mut out = Vec::new();
        PixelFormat::A8R8G8B8.push_rgba([1, 2, 3, 4], &mut out);
        assert_eq!(out, [4, 1, 2, 3]);
        assert_eq!(PixelFormat::A8R8G8B8.rgba_at(&out, 0), [1, 2, 3, 4]);

        out.clear();
        PixelFormat::B8G8R8A8Premultiplied.push_rgba([255, 128, 0, 128], &mut out);
        assert_eq!(out, [0, 64, 128, 128]);

        out.clear();
        PixelFormat::G8.push_rgba([30, 60, 90, 255], &mut out);
        assert_eq!(out, [60]);
    }

    #[test]
    fn closures_are_sources() {
        let source = |rect: &Rect, _scale: u32| -> Result<PixelBuffer> {
            let px = rect.to_pixel_rect()?;
            Ok(PixelBuffer::blank(px.width, px.height, PixelFormat::G8))
        };
        let rect = Rect::new(0.0, 0.0, 10.0, 5.0, crate::measure::Unit::Pixel, 72.0);
        let buf = source.fetch(&rect, 1).unwrap();
        assert_eq!((buf.width, buf.height), (10, 5));
    }
}
