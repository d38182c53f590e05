//! Procedural pixel source
//!
//! Colours depend only on absolute pixel coordinates, so any region fetched
//! in one piece is byte-identical to the same region stitched from tiles.

use crate::error::Result;
use crate::measure::Rect;
use crate::pixel::{PixelBuffer, PixelFormat, PixelSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternKind {
    /// Red follows x, green follows y, blue is their xor
    Gradient,
    /// Alternating squares of `cell` pixels
    Checker { cell: u32 },
}

#[derive(Clone, Copy, Debug)]
pub struct Pattern {
    format: PixelFormat,
    kind: PatternKind,
}

impl Pattern {
    pub fn new(format: PixelFormat, kind: PatternKind) -> Self {
        Self { format, kind }
    }

    pub fn gradient(format: PixelFormat) -> Self {
        Self::new(format, PatternKind::Gradient)
    }

    pub fn checker(format: PixelFormat, cell: u32) -> Self {
        Self::new(format, PatternKind::Checker { cell: cell.max(1) })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// `[r, g, b, a]` at absolute pixel `(x, y)`.
    pub fn rgba(&self, x: i64, y: i64) -> [u8; 4] {
        match self.kind {
            PatternKind::Gradient => [x as u8, y as u8, (x ^ y) as u8, 0xFF],
            PatternKind::Checker { cell } => {
                let c = i64::from(cell);
                if (x.div_euclid(c) + y.div_euclid(c)) % 2 == 0 {
                    [0xEE, 0xEE, 0xEE, 0xFF]
                } else {
                    [0x22, 0x44, 0x66, 0xFF]
                }
            }
        }
    }
}

impl PixelSource for Pattern {
    /// The rect's dpi already carries the zoom, so `scale` is not needed.
    fn fetch(&self, rect: &Rect, _scale: u32) -> Result<PixelBuffer> {
        let px = rect.to_pixel_rect()?;
        let mut bytes = Vec::with_capacity(self.format.buffer_len(px.width, px.height));
        for y in px.y..px.y1() {
            for x in px.x..px.x1() {
                self.format.push_rgba(self.rgba(x, y), &mut bytes);
            }
        }
        Ok(PixelBuffer::new(px.width, px.height, self.format, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::Unit;

    #[test]
    fn fetch_matches_declared_shape() {
        let rect = Rect::new(0.0, 0.0, 1.0, 0.5, Unit::Inch, 40.0);
        for format in [PixelFormat::G8, PixelFormat::R8G8B8, PixelFormat::A8R8G8B8] {
            let buf = Pattern::gradient(format).fetch(&rect, 1).unwrap();
            assert_eq!((buf.width, buf.height), (40, 20));
            assert!(buf.validate().is_ok());
        }
    }

    #[test]
    fn pieces_equal_the_whole() {
        let p = Pattern::checker(PixelFormat::B8G8R8, 5);
        let whole = p
            .fetch(&Rect::new(0.0, 0.0, 20.0, 1.0, Unit::Point, 72.0), 1)
            .unwrap();
        let left = p
            .fetch(&Rect::new(0.0, 0.0, 8.0, 1.0, Unit::Point, 72.0), 1)
            .unwrap();
        let right = p
            .fetch(&Rect::new(8.0, 0.0, 12.0, 1.0, Unit::Point, 72.0), 1)
            .unwrap();
        assert_eq!([left.bytes, right.bytes].concat(), whole.bytes);
    }

    #[test]
    fn channel_order_follows_format() {
        let p = Pattern::gradient(PixelFormat::B8G8R8A8);
        let buf = p
            .fetch(&Rect::new(3.0, 5.0, 1.0, 1.0, Unit::Pixel, 72.0), 1)
            .unwrap();
        assert_eq!(buf.bytes, [6, 5, 3, 0xFF]);
    }
}
