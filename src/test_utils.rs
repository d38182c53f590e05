pub mod test_helpers {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::{Result, TileError};
    use crate::measure::{Rect, Unit};
    use crate::pattern::Pattern;
    use crate::pixel::{PixelBuffer, PixelFormat, PixelSource};
    use crate::tiles::{TilesConfig, Viewport};

    /// Wraps a [`Pattern`] and counts every fetch.
    #[derive(Clone)]
    pub struct CountingSource {
        pattern: Pattern,
        calls: Arc<AtomicUsize>,
    }

    impl CountingSource {
        pub fn new(pattern: Pattern) -> Self {
            Self {
                pattern,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Shared counter, readable after the source moved into a pool.
        pub fn counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl PixelSource for CountingSource {
        fn fetch(&self, rect: &Rect, scale: u32) -> Result<PixelBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pattern.fetch(rect, scale)
        }
    }

    /// Always fails, like a rasteriser whose document went away.
    pub struct FailingSource;

    impl PixelSource for FailingSource {
        fn fetch(&self, rect: &Rect, _scale: u32) -> Result<PixelBuffer> {
            Err(TileError::source(format!("cannot rasterise {rect}")))
        }
    }

    /// Returns buffers one row short of the requested region.
    pub struct ShortSource(pub PixelFormat);

    impl PixelSource for ShortSource {
        fn fetch(&self, rect: &Rect, _scale: u32) -> Result<PixelBuffer> {
            let px = rect.to_pixel_rect()?;
            let height = px.height.saturating_sub(1);
            Ok(PixelBuffer::new(
                px.width,
                px.height,
                self.0,
                vec![0; self.0.buffer_len(px.width, height)],
            ))
        }
    }

    /// `width_px` x `height_px` surface at 72 dpi in points, so one point
    /// is one pixel at scale 1.
    pub fn surface_px(width_px: u32, height_px: u32) -> Rect {
        Rect::new(
            0.0,
            0.0,
            f64::from(width_px),
            f64::from(height_px),
            Unit::Point,
            72.0,
        )
    }

    /// Cooperative config with a single scale and no prefetch.
    pub fn small_config(width_px: u32, height_px: u32, max_tile_px: u32) -> TilesConfig {
        let mut config = TilesConfig::new(
            surface_px(width_px, height_px),
            Viewport::new(f64::from(width_px), f64::from(height_px), Unit::Point, 72.0),
        );
        config.scales = vec![1];
        config.max_tile_px = max_tile_px;
        config.workers = 0;
        config.prefetch = false;
        config
    }
}
