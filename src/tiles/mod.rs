//! Tiling, compression and rendering of large surfaces

pub mod cache;
pub mod codec;
mod grid;
mod pool;
mod render;
mod request;
mod tile;

pub use cache::{DecodeCache, DecodeKey, SharedDecodeCache};
pub use grid::{CompressJob, GridStats, TilesGrid};
pub use pool::{PoolStats, TilesConfig, TilesPool, Viewport};
pub use render::{Clip, RenderJob, RenderTile};
pub use request::{RenderResponse, RequestId};
pub use tile::{Compressed, Tile};

/// Zoom factors available by default.
pub const DEFAULT_SCALES: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Render window in tiles, `(columns, rows)`.
pub const DEFAULT_RENDER_SHAPE: (usize, usize) = (2, 2);

pub const DEFAULT_MAX_TILE_PX: u32 = 1024;

/// Decoded tiles kept between renders
pub const DEFAULT_DECODE_CACHE: usize = 16;

/// Cores left to the caller when sizing the worker pool
pub const DEFAULT_WORKER_RESERVE: usize = 2;
