//! Sliding render window and the clips it produces
//!
//! A [`RenderTile`] is an N x M view over a [`TilesGrid`]. Rendering
//! decompresses the window's tiles column by column into vertical bands,
//! then interleaves the bands row by row into one row-major buffer.
//!
//! Output is double-buffered: the clip of the last successful render stays
//! readable through [`RenderTile::current_clip`] while the window moves and
//! the next clip is built. The slots only flip once a new clip is complete.
//!
//! Rendering is split so the heavy part can run off-thread:
//! [`RenderTile::plan`] snapshots the window into a [`RenderJob`],
//! [`RenderJob::run`] decodes and merges, and [`RenderTile::install`]
//! accepts the result only if the window did not move in the meantime.

use std::fmt;
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use super::cache::{self, DecodeKey, SharedDecodeCache};
use super::codec;
use super::grid::TilesGrid;
use super::tile::Tile;
use crate::error::{Result, TileError};
use crate::pixel::PixelFormat;
use crate::scheduler::CancelToken;

/// Rendered pixels of a window, ready for a display sink.
#[derive(Clone, Default)]
pub struct Clip {
    /// Logical origin of the window, in the surface's unit
    pub x: f64,
    pub y: f64,
    /// Size in pixels
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Row-major pixels, `None` for the empty clip
    pub pixels: Option<Arc<[u8]>>,
}

impl Clip {
    /// Clip returned when there is nothing to show yet.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_none()
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.pixels.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clip")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.bytes().len())
            .finish()
    }
}

/// Snapshot of a fully compressed window, decoded and merged by
/// [`RenderJob::run`].
pub struct RenderJob {
    generation: u64,
    scale: u32,
    format: PixelFormat,
    cols: usize,
    rows: usize,
    /// Row-major, `cols * rows` entries
    tiles: Vec<Tile>,
    origin: (f64, f64),
    cache: Option<SharedDecodeCache>,
}

impl RenderJob {
    /// Fails with `NotReady` unless every tile of `view` holds a buffer.
    pub fn from_view(
        view: &TilesGrid,
        generation: u64,
        cache: Option<SharedDecodeCache>,
    ) -> Result<Self> {
        let (cols, rows) = view.shape();
        let tiles: Vec<Tile> = view.tiles().collect();
        let missing = tiles.iter().filter(|t| !t.is_compressed()).count();
        if tiles.len() != cols * rows || missing > 0 {
            return Err(TileError::not_ready(format!(
                "{missing} of {} window tiles not compressed",
                cols * rows
            )));
        }
        let ext = view.compute_extents()?;
        Ok(Self {
            generation,
            scale: view.scale(),
            format: view.memory_format(),
            cols,
            rows,
            tiles,
            origin: (ext.x(), ext.y()),
            cache,
        })
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn tile(&self, col: usize, row: usize) -> &Tile {
        &self.tiles[row * self.cols + col]
    }

    /// Decodes every tile and merges them into a clip.
    pub fn run(&self, token: &CancelToken) -> Result<Clip> {
        let bpp = self.format.bytes_per_pixel();
        let widths: Vec<usize> = (0..self.cols)
            .map(|c| self.tile(c, 0).pixel_size().0 as usize)
            .collect();
        let heights: Vec<usize> = (0..self.rows)
            .map(|r| self.tile(0, r).pixel_size().1 as usize)
            .collect();
        let width: usize = widths.iter().sum();
        let height: usize = heights.iter().sum();

        let total: usize = self.tiles.iter().map(Tile::byte_len).sum();
        if total != width * height * bpp {
            return Err(TileError::contract(format!(
                "window tiles hold {total} bytes, a {width}x{height} clip needs {}",
                width * height * bpp
            )));
        }

        let bands = (0..self.cols)
            .into_par_iter()
            .map(|c| self.band(c, token))
            .collect::<Result<Vec<_>>>()?;

        if token.is_cancelled() {
            return Err(TileError::Cancelled);
        }
        let mut out = codec::alloc_scratch(total)?;
        merge_bands(&bands, &widths, bpp, &mut out);

        debug!(
            "scale {}: merged {}x{} tiles into {width}x{height}px",
            self.scale, self.cols, self.rows
        );
        Ok(Clip {
            x: self.origin.0,
            y: self.origin.1,
            width: width as u32,
            height: height as u32,
            format: self.format,
            pixels: Some(out.into()),
        })
    }

    /// Column `col` decoded top to bottom into one contiguous band.
    fn band(&self, col: usize, token: &CancelToken) -> Result<Vec<u8>> {
        let len = (0..self.rows).map(|r| self.tile(col, r).byte_len()).sum();
        let mut band = codec::alloc_scratch(len)?;
        let mut offset = 0;
        for row in 0..self.rows {
            if token.is_cancelled() {
                return Err(TileError::Cancelled);
            }
            let tile = self.tile(col, row);
            let pixels = self.decoded(tile)?;
            band[offset..offset + pixels.len()].copy_from_slice(&pixels);
            offset += pixels.len();
        }
        Ok(band)
    }

    fn decoded(&self, tile: &Tile) -> Result<Arc<[u8]>> {
        let Some(shared) = &self.cache else {
            return Ok(tile.decompress()?.into());
        };
        let key = DecodeKey::for_tile(self.scale, tile);
        if let Some(hit) = cache::lock(shared).get(&key) {
            return Ok(hit);
        }
        let pixels = tile.decompress()?;
        Ok(cache::lock(shared).insert(key, pixels))
    }
}

/// Interleaves column bands into row-major `out`.
fn merge_bands(bands: &[Vec<u8>], widths: &[usize], bpp: usize, out: &mut [u8]) {
    let stride: usize = widths.iter().sum::<usize>() * bpp;
    if stride == 0 {
        return;
    }
    for (y, dst_row) in out.chunks_exact_mut(stride).enumerate() {
        let mut x = 0;
        for (band, w) in bands.iter().zip(widths) {
            let n = w * bpp;
            dst_row[x..x + n].copy_from_slice(&band[y * n..(y + 1) * n]);
            x += n;
        }
    }
}

/// Movable N x M window over one grid.
pub struct RenderTile {
    base: TilesGrid,
    view: TilesGrid,
    shape: (usize, usize),
    clips: [Clip; 2],
    front: usize,
    valid: bool,
    generation: u64,
    cache: Option<SharedDecodeCache>,
}

impl RenderTile {
    /// Window of `shape` at the top-left corner of `grid`'s base. The shape
    /// is reduced to the grid's if the grid is smaller.
    pub fn new(
        grid: &TilesGrid,
        shape: (usize, usize),
        cache: Option<SharedDecodeCache>,
    ) -> Result<Self> {
        let base = grid.base();
        let shape = (shape.0.min(base.width()), shape.1.min(base.height()));
        if shape.0 == 0 || shape.1 == 0 {
            return Err(TileError::contract(format!(
                "render window {}x{} over a {}x{} grid",
                shape.0,
                shape.1,
                base.width(),
                base.height()
            )));
        }
        let view = base.slice(0..shape.0, 0..shape.1)?;
        Ok(Self {
            base,
            view,
            shape,
            clips: [Clip::empty(), Clip::empty()],
            front: 0,
            valid: false,
            generation: 0,
            cache,
        })
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Top-left tile of the window in the base grid.
    #[must_use]
    pub fn position(&self) -> (usize, usize) {
        self.view.origin()
    }

    #[must_use]
    pub fn view(&self) -> &TilesGrid {
        &self.view
    }

    #[must_use]
    pub fn base(&self) -> &TilesGrid {
        &self.base
    }

    #[must_use]
    pub fn scale(&self) -> u32 {
        self.base.scale()
    }

    /// Bumped on every move; clips built for an older generation are
    /// rejected by [`RenderTile::install`].
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether [`RenderTile::current_clip`] shows the current position.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Moves the window's top-left tile to `(x, y)`, clamped so the window
    /// stays inside the grid. Returns whether the window moved.
    pub fn move_to(&mut self, x: usize, y: usize) -> Result<bool> {
        let x = x.min(self.base.width() - self.shape.0);
        let y = y.min(self.base.height() - self.shape.1);
        if (x, y) == self.position() {
            return Ok(false);
        }
        self.view = self.base.slice(x..x + self.shape.0, y..y + self.shape.1)?;
        self.invalidate();
        Ok(true)
    }

    /// Marks the current position as needing a new render. The last clip
    /// stays readable.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.generation += 1;
    }

    /// Last successfully rendered clip, possibly of a previous position.
    #[must_use]
    pub fn current_clip(&self) -> &Clip {
        &self.clips[self.front]
    }

    /// Snapshot of the window for off-thread rendering, `None` when the
    /// current clip is already up to date.
    pub fn plan(&self) -> Result<Option<RenderJob>> {
        if self.valid {
            return Ok(None);
        }
        RenderJob::from_view(&self.view, self.generation, self.cache.clone()).map(Some)
    }

    /// Publishes `clip` if it was built for the current position.
    pub fn install(&mut self, generation: u64, clip: Clip) -> bool {
        if self.valid || generation != self.generation {
            return false;
        }
        let back = 1 - self.front;
        self.clips[back] = clip;
        self.front = back;
        self.valid = true;
        true
    }

    /// Renders the window on the calling thread. Fails with `NotReady` if
    /// any tile of the window lacks a buffer; the previous clip is kept.
    pub fn render_texture(&mut self) -> Result<&Clip> {
        if let Some(job) = self.plan()? {
            let clip = job.run(&CancelToken::new())?;
            self.install(job.generation(), clip);
        }
        Ok(self.current_clip())
    }
}

impl fmt::Debug for RenderTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTile")
            .field("scale", &self.scale())
            .field("shape", &self.shape)
            .field("position", &self.position())
            .field("generation", &self.generation)
            .field("valid", &self.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{Rect, Unit};
    use crate::pattern::Pattern;
    use crate::pixel::PixelSource;
    use crate::tiles::cache::DecodeCache;

    fn grid(w_pt: f64, h_pt: f64, tile_px: u32) -> TilesGrid {
        let surface = Rect::new(0.0, 0.0, w_pt, h_pt, Unit::Point, 72.0);
        TilesGrid::plan(&surface, 1, tile_px, PixelFormat::R8G8B8).unwrap()
    }

    fn expected(view: &TilesGrid, source: &dyn PixelSource) -> Vec<u8> {
        let rect = view
            .pixel_extents()
            .unwrap()
            .to_rect(view.tile_unit(), view.virtual_dpi())
            .unwrap();
        source.fetch(&rect, view.scale()).unwrap().bytes
    }

    #[test]
    fn move_to_clamps_inside_grid() {
        let g = grid(400.0, 400.0, 100);
        let mut rt = RenderTile::new(&g, (2, 2), None).unwrap();
        assert_eq!(rt.position(), (0, 0));
        assert!(rt.move_to(3, 3).unwrap());
        assert_eq!(rt.position(), (2, 2));
        assert!(!rt.move_to(3, 3).unwrap());
        assert!(!rt.move_to(usize::MAX, 2).unwrap());
        assert!(rt.move_to(0, 1).unwrap());
        assert_eq!(rt.position(), (0, 1));
    }

    #[test]
    fn window_never_leaves_grid() {
        let g = grid(500.0, 300.0, 100);
        let mut rt = RenderTile::new(&g, (3, 2), None).unwrap();
        for x in 0..9 {
            for y in 0..9 {
                rt.move_to(x, y).unwrap();
                let (px, py) = rt.position();
                assert!(px + 3 <= 5 && py + 2 <= 3);
                assert_eq!(rt.view().shape(), (3, 2));
            }
        }
    }

    #[test]
    fn shape_is_reduced_to_small_grids() {
        let g = grid(100.0, 300.0, 100);
        let rt = RenderTile::new(&g, (2, 2), None).unwrap();
        assert_eq!(rt.shape(), (1, 2));
        assert!(RenderTile::new(&g, (0, 2), None).is_err());
    }

    #[test]
    fn render_before_compress_is_not_ready() {
        let g = grid(400.0, 400.0, 100);
        let mut rt = RenderTile::new(&g, (2, 2), None).unwrap();
        assert!(matches!(rt.render_texture(), Err(TileError::NotReady { .. })));
        assert!(rt.current_clip().is_empty());
        assert!(!rt.is_valid());
    }

    #[test]
    fn merged_clip_matches_direct_fetch() {
        // 250 x 170 px with 100 px tiles: columns 84/84/82, rows 85/85
        let g = grid(250.0, 170.0, 100);
        let source = Pattern::gradient(PixelFormat::R8G8B8);
        g.compress(&source).unwrap();

        let mut rt = RenderTile::new(&g, (2, 2), None).unwrap();
        rt.move_to(1, 0).unwrap();
        let clip = rt.render_texture().unwrap().clone();
        assert_eq!((clip.width, clip.height), (166, 170));
        assert_eq!(clip.stride(), 498);
        assert!((clip.x - 84.0).abs() < 1e-9);
        assert_eq!(clip.bytes(), expected(rt.view(), &source).as_slice());
        assert!(rt.is_valid());
    }

    #[test]
    fn previous_clip_survives_a_move() {
        let g = grid(400.0, 400.0, 100);
        let source = Pattern::checker(PixelFormat::R8G8B8, 7);
        g.compress(&source).unwrap();
        let mut rt = RenderTile::new(&g, (2, 2), None).unwrap();
        let first = rt.render_texture().unwrap().clone();

        rt.move_to(2, 2).unwrap();
        assert!(!rt.is_valid());
        assert_eq!(rt.current_clip().x, first.x);
        assert_eq!(rt.current_clip().bytes(), first.bytes());

        let second = rt.render_texture().unwrap();
        assert!((second.x - 200.0).abs() < 1e-9);
    }

    #[test]
    fn stale_results_are_rejected() {
        let g = grid(400.0, 400.0, 100);
        g.compress(&Pattern::gradient(PixelFormat::R8G8B8)).unwrap();
        let mut rt = RenderTile::new(&g, (2, 2), None).unwrap();

        let job = rt.plan().unwrap().unwrap();
        rt.move_to(1, 1).unwrap();
        let clip = job.run(&CancelToken::new()).unwrap();
        assert!(!rt.install(job.generation(), clip));
        assert!(rt.current_clip().is_empty());

        let job = rt.plan().unwrap().unwrap();
        let clip = job.run(&CancelToken::new()).unwrap();
        assert!(rt.install(job.generation(), clip));
        assert!(rt.plan().unwrap().is_none());
    }

    #[test]
    fn cancelled_job_leaves_clips_alone() {
        let g = grid(400.0, 400.0, 100);
        g.compress(&Pattern::gradient(PixelFormat::R8G8B8)).unwrap();
        let rt = RenderTile::new(&g, (2, 2), None).unwrap();
        let job = rt.plan().unwrap().unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(job.run(&token), Err(TileError::Cancelled)));
        assert!(rt.current_clip().is_empty());
    }

    #[test]
    fn decode_cache_is_reused_across_moves() {
        let g = grid(400.0, 400.0, 100);
        let source = Pattern::gradient(PixelFormat::R8G8B8);
        g.compress(&source).unwrap();
        let cache = DecodeCache::shared(16);
        let mut rt = RenderTile::new(&g, (2, 2), Some(Arc::clone(&cache))).unwrap();
        rt.render_texture().unwrap();
        assert_eq!(cache::lock(&cache).len(), 4);

        rt.move_to(1, 0).unwrap();
        let clip = rt.render_texture().unwrap().clone();
        // only the newly entered column is decoded
        assert_eq!(cache::lock(&cache).len(), 6);
        assert_eq!(clip.bytes(), expected(rt.view(), &source).as_slice());
    }

    #[test]
    fn merge_interleaves_rows() {
        // two 1px-wide single-byte columns, 2 rows
        let bands = vec![vec![1, 2], vec![3, 4]];
        let mut out = vec![0; 4];
        merge_bands(&bands, &[1, 1], 1, &mut out);
        assert_eq!(out, [1, 3, 2, 4]);
    }
}
