pub mod error;
pub mod grid;
pub mod measure;
pub mod panic_handler;
pub mod pattern;
pub mod pixel;
pub mod scheduler;
pub mod settings;
pub mod tiles;

#[cfg(feature = "pdf")]
pub mod pdf_source;

pub mod test_utils;

pub use error::{Result, TileError};
pub use measure::{Measurable, PixelRect, Point, Rect, Unit};
pub use pixel::{PixelBuffer, PixelFormat, PixelSource};
pub use scheduler::{Batch, BatchId, CancelToken, Priority, Scheduler};
pub use settings::Settings;
pub use tiles::{Clip, RenderResponse, RequestId, TilesConfig, TilesGrid, TilesPool, Viewport};
