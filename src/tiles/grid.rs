//! One zoom level's tiling of the surface

use std::fmt;
use std::ops::{AddAssign, RangeBounds};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use super::tile::{Compressed, Tile};
use crate::error::{Result, TileError};
use crate::grid::TypedGrid;
use crate::measure::{Measurable, PixelRect, Rect, Unit, factor, format_size};
use crate::pixel::{PixelFormat, PixelSource};
use crate::scheduler::CancelToken;

/// Running totals shared by a grid and all of its views.
#[derive(Debug, Default)]
struct Totals {
    compressed_tiles: AtomicUsize,
    uncompressed: AtomicU64,
    compressed: AtomicU64,
}

impl Totals {
    /// Accounts for a tile going from `before` to `after` (lengths are
    /// `(uncompressed, compressed)`, zero when empty).
    fn record(&self, before: (usize, usize), after: (usize, usize)) {
        match (before.1 > 0, after.1 > 0) {
            (false, true) => {
                self.compressed_tiles.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.compressed_tiles.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.uncompressed.fetch_add(after.0 as u64, Ordering::Relaxed);
        self.uncompressed.fetch_sub(before.0 as u64, Ordering::Relaxed);
        self.compressed.fetch_add(after.1 as u64, Ordering::Relaxed);
        self.compressed.fetch_sub(before.1 as u64, Ordering::Relaxed);
    }
}

/// Size figures of a grid or a set of grids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct GridStats {
    pub tiles: usize,
    pub compressed_tiles: usize,
    pub total_uncompressed: u64,
    pub total_compressed: u64,
}

impl GridStats {
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total_compressed == 0 {
            0.0
        } else {
            self.total_uncompressed as f64 / self.total_compressed as f64
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.compressed_tiles == self.tiles
    }
}

impl AddAssign for GridStats {
    fn add_assign(&mut self, rhs: Self) {
        self.tiles += rhs.tiles;
        self.compressed_tiles += rhs.compressed_tiles;
        self.total_uncompressed += rhs.total_uncompressed;
        self.total_compressed += rhs.total_compressed;
    }
}

impl fmt::Display for GridStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tiles, {} -> {} ({:.1}x)",
            self.compressed_tiles,
            self.tiles,
            format_size(self.total_uncompressed, None, 2),
            format_size(self.total_compressed, None, 2),
            self.ratio()
        )
    }
}

/// Grid of [`Tile`]s covering the surface at one scale.
///
/// Cloning gives another handle on the same tiles. [`TilesGrid::slice`]
/// returns a view sharing the tiles and the totals of its base grid.
#[derive(Clone)]
pub struct TilesGrid {
    tiles: TypedGrid<Tile>,
    format: PixelFormat,
    scale: u32,
    unit: Unit,
    dpi: f64,
    surface_unit: Unit,
    surface_dpi: f64,
    totals: Arc<Totals>,
}

/// Pixel edges closer than this to a boundary are taken as on it.
const EDGE_TOLERANCE: f64 = 1e-6;

/// Pixel rect of a surface being planned. Unit conversion leaves noise
/// on exact edges, so edges within [`EDGE_TOLERANCE`] of a boundary snap
/// to it and the others round outward.
fn surface_pixels(logical: &Rect) -> Result<PixelRect> {
    let t = factor(logical.unit(), Unit::Pixel, logical.dpi())?;
    let snap = |v: f64, outward: fn(f64) -> f64| {
        let nearest = v.round();
        if (v - nearest).abs() <= EDGE_TOLERANCE {
            nearest
        } else {
            outward(v)
        }
    };
    let x0 = snap(logical.x() * t, f64::floor);
    let y0 = snap(logical.y() * t, f64::floor);
    let x1 = snap(logical.x1() * t, f64::ceil).max(x0);
    let y1 = snap(logical.y1() * t, f64::ceil).max(y0);
    Ok(PixelRect::new(
        x0 as i64,
        y0 as i64,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}

impl TilesGrid {
    /// Splits `surface` into tiles of at most `max_tile_px` pixels per edge,
    /// rasterised at `round(surface.dpi * scale)`.
    pub fn plan(surface: &Rect, scale: u32, max_tile_px: u32, format: PixelFormat) -> Result<Self> {
        if scale == 0 || max_tile_px == 0 {
            return Err(TileError::contract(format!(
                "scale {scale} and tile edge {max_tile_px} must be positive"
            )));
        }
        let dpi = (surface.dpi() * f64::from(scale)).round();
        // pixel surfaces are measured in inches so they can grow with the scale
        let unit = match surface.unit() {
            Unit::Pixel => Unit::Inch,
            unit => unit,
        };
        let logical = surface.convert_to(unit)?.with_dpi(dpi);
        let px = surface_pixels(&logical)?;
        if px.width == 0 || px.height == 0 {
            return Err(TileError::contract(format!("surface {surface} has no pixels")));
        }

        let cols = px.width.div_ceil(max_tile_px);
        let rows = px.height.div_ceil(max_tile_px);
        let tile_w = px.width.div_ceil(cols);
        let tile_h = px.height.div_ceil(rows);

        let mut failed = None;
        let tiles = TypedGrid::from_fn(cols as usize, rows as usize, |x, y| {
            let (x, y) = (x as u32, y as u32);
            let width = if x + 1 == cols { px.width - tile_w * x } else { tile_w };
            let height = if y + 1 == rows { px.height - tile_h * y } else { tile_h };
            let tile_px = PixelRect::new(
                px.x + i64::from(tile_w * x),
                px.y + i64::from(tile_h * y),
                width,
                height,
            );
            let rect = match tile_px.to_rect(unit, dpi) {
                Ok(rect) => rect,
                Err(e) => {
                    failed.get_or_insert(e);
                    Rect::new(0.0, 0.0, 0.0, 0.0, unit, dpi)
                }
            };
            Tile::new(rect, tile_px, format)
        })?;
        if let Some(e) = failed {
            return Err(e);
        }

        info!(
            "planned scale {scale}: {cols}x{rows} tiles of {tile_w}x{tile_h}px at {dpi}dpi ({})",
            format_size(format.buffer_len(px.width, px.height) as u64, None, 2)
        );
        Ok(Self {
            tiles,
            format,
            scale,
            unit,
            dpi,
            surface_unit: surface.unit(),
            surface_dpi: surface.dpi(),
            totals: Arc::new(Totals::default()),
        })
    }

    pub fn width(&self) -> usize {
        self.tiles.width()
    }

    pub fn height(&self) -> usize {
        self.tiles.height()
    }

    /// `(columns, rows)`.
    pub fn shape(&self) -> (usize, usize) {
        self.tiles.shape()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn memory_format(&self) -> PixelFormat {
        self.format
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Unit of the surface; extents and the points given to
    /// [`TilesGrid::get_tile_indices`] use it.
    pub fn unit(&self) -> Unit {
        self.surface_unit
    }

    /// Unit of the tile rects handed to the pixel source. Differs from
    /// [`TilesGrid::unit`] only for pixel surfaces, which are tiled in
    /// inches.
    pub fn tile_unit(&self) -> Unit {
        self.unit
    }

    /// Resolution the tiles are rasterised at.
    pub fn virtual_dpi(&self) -> f64 {
        self.dpi
    }

    /// Top-left cell of this view in the base grid.
    pub fn origin(&self) -> (usize, usize) {
        self.tiles.origin()
    }

    pub fn is_view(&self) -> bool {
        self.tiles.is_view()
    }

    pub fn base(&self) -> TilesGrid {
        TilesGrid {
            tiles: self.tiles.base(),
            ..self.clone()
        }
    }

    pub fn shares_tiles(&self, other: &TilesGrid) -> bool {
        self.tiles.shares_store(&other.tiles)
    }

    /// View over `cols` x `rows`, relative to this grid.
    pub fn slice(
        &self,
        cols: impl RangeBounds<usize>,
        rows: impl RangeBounds<usize>,
    ) -> Result<TilesGrid> {
        Ok(TilesGrid {
            tiles: self.tiles.slice(cols, rows)?,
            ..self.clone()
        })
    }

    /// Snapshot of the tile at `(x, y)`; compressed bytes are shared, not
    /// copied.
    pub fn tile(&self, x: isize, y: isize) -> Result<Tile> {
        self.tiles
            .get(x, y)?
            .ok_or_else(|| TileError::not_ready(format!("no tile at ({x}, {y})")))
    }

    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        self.tiles.iter().flatten()
    }

    pub fn is_compressed(&self, x: isize, y: isize) -> Result<bool> {
        self.tiles
            .with_item(x, y, |tile| tile.is_some_and(Tile::is_compressed))
    }

    /// Number of tiles in this view lacking a buffer.
    pub fn missing(&self) -> usize {
        self.tiles().filter(|t| !t.is_compressed()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    /// Bounding rect of this view in the surface's unit and dpi, from the
    /// first tile's origin to the last tile's far corner.
    pub fn compute_extents(&self) -> Result<Rect> {
        if self.is_empty() {
            return Err(TileError::not_ready("empty grid has no extents"));
        }
        let first = self.tile(0, 0)?;
        let last = self.tile(-1, -1)?;
        let (a, b) = (first.rect(), last.rect());
        let t = factor(self.unit, self.surface_unit, self.surface_dpi)?;
        Ok(Rect::from_corners(
            a.x() * t,
            a.y() * t,
            b.x1() * t,
            b.y1() * t,
            self.surface_unit,
            self.surface_dpi,
        ))
    }

    /// Pixel footprint of this view.
    pub fn pixel_extents(&self) -> Result<PixelRect> {
        if self.is_empty() {
            return Err(TileError::not_ready("empty grid has no extents"));
        }
        let a = self.tile(0, 0)?.pixel_rect();
        let b = self.tile(-1, -1)?.pixel_rect();
        Ok(PixelRect::new(
            a.x,
            a.y,
            (b.x1() - a.x) as u32,
            (b.y1() - a.y) as u32,
        ))
    }

    /// Tile holding the point `(x, y)` given in [`TilesGrid::unit`].
    /// Points outside the grid map to the nearest border tile.
    pub fn get_tile_indices(&self, x: f64, y: f64) -> (usize, usize) {
        let Ok(ext) = self.compute_extents() else {
            return (0, 0);
        };
        (
            axis_index(x, ext.x(), ext.x1(), self.width()),
            axis_index(y, ext.y(), ext.y1(), self.height()),
        )
    }

    /// Fetches and compresses every tile lacking a buffer, in parallel.
    ///
    /// Tiles that fail stay empty and are retried on the next pass; the
    /// first failure is returned once every other tile had its chance.
    pub fn compress(&self, source: &dyn PixelSource) -> Result<usize> {
        let token = CancelToken::new();
        let outcomes: Vec<Result<bool>> = self
            .compress_jobs(&token)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|job| job.run(source))
            .collect();

        let mut done = 0;
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!("scale {}: compressed {done} tiles", self.scale);
        match first_error {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    /// One unit of work per tile currently lacking a buffer. Every unit
    /// checks `token` before and after fetching pixels.
    pub fn compress_jobs(&self, token: &CancelToken) -> impl Iterator<Item = CompressJob> + use<> {
        let grid = self.clone();
        let token = token.clone();
        self.tiles
            .positions()
            .filter(move |&(x, y)| !grid.is_compressed(x as isize, y as isize).unwrap_or(true))
            .map({
                let grid = self.clone();
                move |(x, y)| CompressJob {
                    grid: grid.clone(),
                    x,
                    y,
                    token: token.clone(),
                }
            })
    }

    /// Drops every buffer of this view.
    pub fn invalidate(&self) {
        for (x, y) in self.tiles.positions() {
            let _ = self.tiles.update(x as isize, y as isize, |slot| {
                if let Some(tile) = slot {
                    let before = (tile.uncompressed_len(), tile.compressed_len());
                    tile.invalidate();
                    self.totals.record(before, (0, 0));
                }
            });
        }
        debug!("scale {}: invalidated {} tiles", self.scale, self.len());
    }

    /// Publishes `compressed` unless the tile changed since `generation`.
    fn publish(&self, x: usize, y: usize, generation: u64, compressed: Compressed) -> Result<bool> {
        self.tiles.update(x as isize, y as isize, |slot| {
            let Some(tile) = slot else {
                return false;
            };
            if tile.generation() != generation {
                return false;
            }
            let before = (tile.uncompressed_len(), tile.compressed_len());
            tile.publish(compressed);
            self.totals
                .record(before, (tile.uncompressed_len(), tile.compressed_len()));
            true
        })
    }

    /// Totals of the base grid, kept up to date on every publish.
    pub fn totals(&self) -> GridStats {
        GridStats {
            tiles: self.tiles.base_shape().0 * self.tiles.base_shape().1,
            compressed_tiles: self.totals.compressed_tiles.load(Ordering::Relaxed),
            total_uncompressed: self.totals.uncompressed.load(Ordering::Relaxed),
            total_compressed: self.totals.compressed.load(Ordering::Relaxed),
        }
    }

    /// Figures for this view.
    pub fn stats(&self) -> GridStats {
        if !self.is_view() {
            return self.totals();
        }
        self.tiles().fold(
            GridStats {
                tiles: self.len(),
                ..GridStats::default()
            },
            |mut s, t| {
                if t.is_compressed() {
                    s.compressed_tiles += 1;
                    s.total_uncompressed += t.uncompressed_len() as u64;
                    s.total_compressed += t.compressed_len() as u64;
                }
                s
            },
        )
    }
}

impl fmt::Debug for TilesGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilesGrid")
            .field("scale", &self.scale)
            .field("shape", &self.shape())
            .field("origin", &self.origin())
            .field("format", &self.format)
            .field("dpi", &self.dpi)
            .finish()
    }
}

fn axis_index(v: f64, lo: f64, hi: f64, n: usize) -> usize {
    if n == 0 || hi <= lo || !v.is_finite() {
        return 0;
    }
    let i = (n as f64 * (v - lo) / (hi - lo)).floor();
    i.clamp(0.0, (n - 1) as f64) as usize
}

/// Compression of a single tile, detached from the grid so it can run on
/// any thread.
pub struct CompressJob {
    grid: TilesGrid,
    x: usize,
    y: usize,
    token: CancelToken,
}

impl CompressJob {
    /// Position in the view the job was created from.
    pub fn position(&self) -> (usize, usize) {
        (self.x, self.y)
    }

    pub fn scale(&self) -> u32 {
        self.grid.scale
    }

    /// Fetches, encodes and publishes the tile. Returns `false` when there
    /// was nothing to do (already compressed, or overtaken by another
    /// writer).
    pub fn run(&self, source: &dyn PixelSource) -> Result<bool> {
        if self.token.is_cancelled() {
            return Err(TileError::Cancelled);
        }
        let (ix, iy) = (self.x as isize, self.y as isize);
        let tile = self.grid.tile(ix, iy)?;
        if tile.is_compressed() {
            return Ok(false);
        }

        let encoded = source
            .fetch(tile.rect(), self.grid.scale)
            .and_then(|buf| tile.encode_buffer(&buf));
        let compressed = match encoded {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "scale {} tile ({}, {}) failed: {e}",
                    self.grid.scale, self.x, self.y
                );
                return Err(e);
            }
        };
        if self.token.is_cancelled() {
            return Err(TileError::Cancelled);
        }

        let published = self
            .grid
            .publish(self.x, self.y, tile.generation(), compressed)?;
        if published {
            debug!("scale {} tile ({}, {}) compressed", self.grid.scale, self.x, self.y);
        }
        Ok(published)
    }
}
