//! A single compressed grid cell

use std::fmt;
use std::sync::Arc;

use super::codec;
use crate::error::{Result, TileError};
use crate::measure::{PixelRect, Rect};
use crate::pixel::{PixelBuffer, PixelFormat};

/// Result of encoding a tile's pixels, ready to be published into the tile.
#[derive(Clone)]
pub struct Compressed {
    bytes: Arc<[u8]>,
    uncompressed_len: usize,
}

impl Compressed {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn uncompressed_len(&self) -> usize {
        self.uncompressed_len
    }
}

/// One rectangular region of the surface, holding at most one compressed
/// snapshot of its pixels.
///
/// A tile without buffer reports zero for both sizes; with a buffer both
/// sizes are positive. Compression is all-or-nothing: a failed attempt
/// leaves the previous buffer in place.
#[derive(Clone)]
pub struct Tile {
    rect: Rect,
    pixel_rect: PixelRect,
    format: PixelFormat,
    compressed: Option<Arc<[u8]>>,
    uncompressed_len: usize,
    compressed_len: usize,
    generation: u64,
}

impl Tile {
    /// `rect` is the logical region, `pixel_rect` its footprint in the
    /// grid's pixel space.
    pub fn new(rect: Rect, pixel_rect: PixelRect, format: PixelFormat) -> Self {
        Self {
            rect,
            pixel_rect,
            format,
            compressed: None,
            uncompressed_len: 0,
            compressed_len: 0,
            generation: 0,
        }
    }

    pub fn rect(&self) -> &Rect {
        &self.rect
    }

    pub fn pixel_rect(&self) -> PixelRect {
        self.pixel_rect
    }

    pub fn pixel_size(&self) -> (u32, u32) {
        (self.pixel_rect.width, self.pixel_rect.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes the decompressed pixels occupy.
    pub fn byte_len(&self) -> usize {
        self.format
            .buffer_len(self.pixel_rect.width, self.pixel_rect.height)
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    pub fn compressed(&self) -> Option<Arc<[u8]>> {
        self.compressed.clone()
    }

    pub fn uncompressed_len(&self) -> usize {
        self.uncompressed_len
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed_len
    }

    /// Uncompressed over compressed size, `0.0` without buffer.
    pub fn ratio(&self) -> f64 {
        if self.compressed_len == 0 {
            0.0
        } else {
            self.uncompressed_len as f64 / self.compressed_len as f64
        }
    }

    /// Bumped on every publish and every invalidation of a buffer.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Encodes `bytes` without touching the tile.
    pub fn encode(&self, bytes: &[u8], format: PixelFormat) -> Result<Compressed> {
        codec::ensure_block_capacity(self.byte_len())?;
        codec::ensure_block_capacity(bytes.len())?;
        if format != self.format {
            return Err(TileError::contract(format!(
                "tile stores {} pixels, got {}",
                self.format, format
            )));
        }
        if bytes.len() != self.byte_len() {
            return Err(TileError::contract(format!(
                "{}x{} {} tile needs {} bytes, got {}",
                self.pixel_rect.width,
                self.pixel_rect.height,
                self.format,
                self.byte_len(),
                bytes.len()
            )));
        }
        let packed = codec::compress(bytes, self.format.bytes_per_pixel())?;
        Ok(Compressed {
            bytes: packed.into(),
            uncompressed_len: bytes.len(),
        })
    }

    /// Checks a source buffer matches this tile before encoding it.
    pub fn encode_buffer(&self, buf: &PixelBuffer) -> Result<Compressed> {
        if (buf.width, buf.height) != self.pixel_size() {
            return Err(TileError::contract(format!(
                "pixel source returned {}x{}, tile is {}x{}",
                buf.width, buf.height, self.pixel_rect.width, self.pixel_rect.height
            )));
        }
        buf.validate()?;
        self.encode(&buf.bytes, buf.format)
    }

    /// Replaces the current buffer in one step.
    pub fn publish(&mut self, compressed: Compressed) {
        self.compressed_len = compressed.len();
        self.uncompressed_len = compressed.uncompressed_len;
        self.compressed = Some(compressed.bytes);
        self.generation += 1;
    }

    pub fn compress(&mut self, bytes: &[u8], format: PixelFormat) -> Result<()> {
        let compressed = self.encode(bytes, format)?;
        self.publish(compressed);
        Ok(())
    }

    /// Drops the buffer. Safe to call any number of times; every call
    /// moves the generation on so in-flight publishes are refused.
    pub fn invalidate(&mut self) {
        self.compressed = None;
        self.generation += 1;
        self.uncompressed_len = 0;
        self.compressed_len = 0;
    }

    pub fn decompress(&self) -> Result<Vec<u8>> {
        let mut out = codec::alloc_scratch(self.byte_len())?;
        self.decompress_into(&mut out)?;
        Ok(out)
    }

    pub fn decompress_into(&self, out: &mut [u8]) -> Result<()> {
        let Some(bytes) = &self.compressed else {
            return Err(TileError::not_ready(format!(
                "tile at {:?} has no pixels",
                self.pixel_rect
            )));
        };
        if out.len() != self.uncompressed_len {
            return Err(TileError::contract(format!(
                "decompression target holds {} bytes, tile has {}",
                out.len(),
                self.uncompressed_len
            )));
        }
        codec::decompress_into(bytes, self.format.bytes_per_pixel(), out)
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("pixel_rect", &self.pixel_rect)
            .field("format", &self.format)
            .field("uncompressed_len", &self.uncompressed_len)
            .field("compressed_len", &self.compressed_len)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::Unit;

    fn rgb_tile(w: u32, h: u32) -> Tile {
        let px = PixelRect::new(0, 0, w, h);
        let rect = px.to_rect(Unit::Pixel, 72.0).unwrap();
        Tile::new(rect, px, PixelFormat::R8G8B8)
    }

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn fresh_tile_has_no_buffer() {
        let tile = rgb_tile(100, 100);
        assert!(!tile.is_compressed());
        assert_eq!(tile.uncompressed_len(), 0);
        assert_eq!(tile.compressed_len(), 0);
        assert_eq!(tile.ratio(), 0.0);
        assert!(matches!(tile.decompress(), Err(TileError::NotReady { .. })));
    }

    #[test]
    fn compress_accepts_exact_size_only() {
        let mut tile = rgb_tile(100, 100);
        assert!(tile.compress(&gradient(30_000), PixelFormat::R8G8B8).is_ok());
        assert!(tile.is_compressed());
        assert_eq!(tile.uncompressed_len(), 30_000);
        assert!(tile.compressed_len() > 0);
        assert!(tile.ratio() > 1.0);

        let mut other = rgb_tile(100, 100);
        let err = other.compress(&gradient(29_999), PixelFormat::R8G8B8);
        assert!(matches!(err, Err(TileError::ContractViolation { .. })));
        assert!(!other.is_compressed());
    }

    #[test]
    fn failed_compress_keeps_previous_buffer() {
        let mut tile = rgb_tile(10, 10);
        let data = gradient(300);
        tile.compress(&data, PixelFormat::R8G8B8).unwrap();
        let generation = tile.generation();

        assert!(tile.compress(&data[..299], PixelFormat::R8G8B8).is_err());
        assert!(tile.compress(&data, PixelFormat::G8).is_err());
        assert_eq!(tile.generation(), generation);
        assert_eq!(tile.decompress().unwrap(), data);
    }

    #[test]
    fn round_trip_is_lossless() {
        let mut tile = rgb_tile(37, 11);
        let data = gradient(37 * 11 * 3);
        tile.compress(&data, PixelFormat::R8G8B8).unwrap();
        assert_eq!(tile.decompress().unwrap(), data);
    }

    #[test]
    fn invalidate_is_idempotent() {
        let mut tile = rgb_tile(4, 4);
        tile.compress(&gradient(48), PixelFormat::R8G8B8).unwrap();
        let generation = tile.generation();
        tile.invalidate();
        tile.invalidate();
        assert!(!tile.is_compressed());
        assert_eq!(tile.compressed_len(), 0);
        assert_eq!(tile.uncompressed_len(), 0);
        assert_eq!(tile.generation(), generation + 2);
    }

    #[test]
    fn invalidating_empty_tile_moves_generation() {
        let mut tile = rgb_tile(4, 4);
        let generation = tile.generation();
        tile.invalidate();
        assert!(!tile.is_compressed());
        assert_ne!(tile.generation(), generation);
    }

    #[test]
    fn oversize_tile_is_refused_before_reading_pixels() {
        // 46341 * 46341 bytes is just above 2^31
        let px = PixelRect::new(0, 0, 46_341, 46_341);
        let rect = px.to_rect(Unit::Pixel, 72.0).unwrap();
        let mut tile = Tile::new(rect, px, PixelFormat::G8);
        assert!(matches!(
            tile.compress(&[0; 16], PixelFormat::G8),
            Err(TileError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn source_buffer_shape_is_checked() {
        let tile = rgb_tile(10, 10);
        let wrong = PixelBuffer::blank(10, 9, PixelFormat::R8G8B8);
        assert!(tile.encode_buffer(&wrong).is_err());
        let right = PixelBuffer::blank(10, 10, PixelFormat::R8G8B8);
        assert!(tile.encode_buffer(&right).is_ok());
    }
}
