//! Stack of grids, one per zoom scale, and the active render window
//!
//! The pool follows the request/response shape of a render service:
//! compression work is queued on a [`Scheduler`], asynchronous renders come
//! back as [`RenderResponse`]s on a flume channel and are installed into the
//! render window by [`TilesPool::poll_responses`] (or
//! [`TilesPool::handle_response`] when the receiver is awaited directly).

use std::sync::Arc;

use flume::{Receiver, Sender};
use log::{debug, info, warn};
use serde::Serialize;

use super::cache::{self, DecodeCache, SharedDecodeCache};
use super::grid::{GridStats, TilesGrid};
use super::render::{Clip, RenderJob, RenderTile};
use super::request::{RenderResponse, RequestId};
use super::{
    DEFAULT_DECODE_CACHE, DEFAULT_MAX_TILE_PX, DEFAULT_RENDER_SHAPE, DEFAULT_SCALES,
    DEFAULT_WORKER_RESERVE,
};
use crate::error::{Result, TileError};
use crate::measure::{Measurable, Rect, Unit};
use crate::pixel::{PixelFormat, PixelSource};
use crate::scheduler::{Batch, CancelToken, Priority, Scheduler};

/// Logical size of the area the clips are shown in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub unit: Unit,
    pub dpi: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64, unit: Unit, dpi: f64) -> Self {
        Self {
            width,
            height,
            unit,
            dpi,
        }
    }

    /// A viewport that is not realised yet.
    pub fn empty() -> Self {
        Self::new(0.0, 0.0, Unit::Pixel, 0.0)
    }

    pub fn is_sized(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

impl Measurable for Viewport {
    fn unit(&self) -> Unit {
        self.unit
    }

    fn dpi(&self) -> f64 {
        self.dpi
    }

    fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }
}

/// Everything the pool needs to know, supplied by the embedding program.
#[derive(Clone, Debug)]
pub struct TilesConfig {
    /// Zoom factors, strictly ascending
    pub scales: Vec<u32>,
    /// Render window in tiles, `(columns, rows)`
    pub render_shape: (usize, usize),
    pub memory_format: PixelFormat,
    /// Largest tile edge in pixels
    pub max_tile_px: u32,
    pub surface: Rect,
    pub viewport: Viewport,
    /// Background threads; `0` runs work only when the owner drives the
    /// scheduler
    pub workers: usize,
    /// Decoded tiles kept for reuse between renders
    pub decode_cache: usize,
    /// Queue compression of the next finer scale at low priority
    pub prefetch: bool,
}

impl TilesConfig {
    pub fn new(surface: Rect, viewport: Viewport) -> Self {
        Self {
            scales: DEFAULT_SCALES.to_vec(),
            render_shape: DEFAULT_RENDER_SHAPE,
            memory_format: PixelFormat::default(),
            max_tile_px: DEFAULT_MAX_TILE_PX,
            surface,
            viewport,
            workers: Scheduler::default_workers(DEFAULT_WORKER_RESERVE),
            decode_cache: DEFAULT_DECODE_CACHE,
            prefetch: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            return Err(TileError::contract("no zoom scales configured"));
        }
        if self.scales[0] == 0 || self.scales.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TileError::contract(format!(
                "scales must be positive and strictly ascending, got {:?}",
                self.scales
            )));
        }
        if self.render_shape.0 == 0 || self.render_shape.1 == 0 {
            return Err(TileError::contract(format!(
                "render shape {:?} is empty",
                self.render_shape
            )));
        }
        if self.max_tile_px == 0 {
            return Err(TileError::contract("tile edge must be positive"));
        }
        if self.surface.is_empty() {
            return Err(TileError::contract(format!(
                "surface {} is empty",
                self.surface
            )));
        }
        Ok(())
    }
}

/// Figures for every grid of the pool.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolStats {
    pub current: Option<usize>,
    pub scales: Vec<u32>,
    pub grids: Vec<GridStats>,
    pub total: GridStats,
}

/// Owns the grids of every scale and renders the active window.
pub struct TilesPool {
    config: TilesConfig,
    source: Arc<dyn PixelSource>,
    scheduler: Scheduler,
    stack: Vec<TilesGrid>,
    batches: Vec<Option<Batch>>,
    current: Option<usize>,
    render_tile: Option<RenderTile>,
    cache: SharedDecodeCache,
    render_batch: Batch,
    response_tx: Sender<RenderResponse>,
    response_rx: Receiver<RenderResponse>,
    next_request_id: u64,
    pending: Option<(RequestId, CancelToken)>,
}

impl TilesPool {
    /// Builds the pool. Grids are planned right away when the viewport has
    /// a size, otherwise on the first call that sees a sized viewport.
    pub fn new(config: TilesConfig, source: Arc<dyn PixelSource>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.workers);
        let render_batch = scheduler.batch();
        let (response_tx, response_rx) = flume::unbounded();

        let mut pool = Self {
            cache: DecodeCache::shared(config.decode_cache),
            config,
            source,
            scheduler,
            stack: Vec::new(),
            batches: Vec::new(),
            current: None,
            render_tile: None,
            render_batch,
            response_tx,
            response_rx,
            next_request_id: 1,
            pending: None,
        };
        pool.ensure_grids()?;
        Ok(pool)
    }

    fn ensure_grids(&mut self) -> Result<bool> {
        if self.is_ready() {
            return Ok(true);
        }
        if !self.config.viewport.is_sized() {
            debug!("viewport not realised yet, deferring grid construction");
            return Ok(false);
        }
        let c = &self.config;
        let stack = c
            .scales
            .iter()
            .map(|&s| TilesGrid::plan(&c.surface, s, c.max_tile_px, c.memory_format))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "built {} grids for {} (scales {:?})",
            stack.len(),
            c.surface,
            c.scales
        );
        self.batches = vec![None; stack.len()];
        self.stack = stack;
        Ok(true)
    }

    /// Whether the grids exist.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.stack.is_empty()
    }

    #[must_use]
    pub fn config(&self) -> &TilesConfig {
        &self.config
    }

    #[must_use]
    pub fn scales(&self) -> &[u32] {
        &self.config.scales
    }

    #[must_use]
    pub fn current_scale_index(&self) -> Option<usize> {
        self.current
    }

    #[must_use]
    pub fn grid(&self, scale_index: usize) -> Option<&TilesGrid> {
        self.stack.get(scale_index)
    }

    #[must_use]
    pub fn render_tile(&self) -> Option<&RenderTile> {
        self.render_tile.as_ref()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Applies a new viewport. A changed viewport drops the render window
    /// (the next [`TilesPool::set_rendering`] rebuilds it); grids are built
    /// if they were still deferred. Returns whether the pool is ready.
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<bool> {
        if viewport != self.config.viewport {
            debug!("viewport changed to {viewport:?}");
            self.config.viewport = viewport;
            self.cancel_pending();
            self.render_tile = None;
            self.current = None;
        }
        self.ensure_grids()
    }

    /// Points the render window at `(x, y)`, given in the surface's unit,
    /// on the grid of `scale_index`. The window is centred on the tile
    /// holding the point. Returns whether the scale or the window changed.
    pub fn set_rendering(&mut self, x: f64, y: f64, scale_index: usize) -> Result<bool> {
        if !self.ensure_grids()? {
            return Ok(false);
        }
        let Some(grid) = self.stack.get(scale_index).cloned() else {
            return Err(TileError::OutOfRange {
                x: scale_index as isize,
                y: 0,
                width: self.stack.len(),
                height: 1,
            });
        };

        let switched = self.current != Some(scale_index);
        if switched {
            self.switch_scale(scale_index)?;
        }

        let (ix, iy) = grid.get_tile_indices(x, y);

        let Some(rt) = self.render_tile.as_mut() else {
            return Ok(switched);
        };
        let (w, h) = rt.shape();
        let moved = rt.move_to(ix.saturating_sub(w / 2), iy.saturating_sub(h / 2))?;
        if moved {
            debug!("window moved to {:?} on scale {}", rt.position(), grid.scale());
            self.cancel_pending();
        }
        Ok(switched || moved)
    }

    fn switch_scale(&mut self, index: usize) -> Result<()> {
        let previous = self.current.replace(index);
        self.cancel_pending();
        info!(
            "switching to scale {} (index {index})",
            self.config.scales[index]
        );

        let prefetch = (self.config.prefetch && index + 1 < self.stack.len()).then_some(index + 1);
        for (i, slot) in self.batches.iter_mut().enumerate() {
            if i == index || Some(i) == previous || Some(i) == prefetch {
                continue;
            }
            if let Some(batch) = slot.take() {
                self.scheduler.cancel(&batch);
            }
        }

        self.render_tile = Some(RenderTile::new(
            &self.stack[index],
            self.config.render_shape,
            Some(Arc::clone(&self.cache)),
        )?);

        if let Some(prev) = previous {
            self.schedule_grid(prev, Priority::Idle);
        }
        self.schedule_grid(index, Priority::Now);
        if let Some(next) = prefetch {
            self.schedule_grid(next, Priority::Next);
        }
        Ok(())
    }

    /// Queues compression of every empty tile of a grid, or moves the
    /// already queued batch to `priority`.
    fn schedule_grid(&mut self, index: usize, priority: Priority) {
        let queued = self.batches[index]
            .as_ref()
            .filter(|b| !b.is_cancelled() && self.scheduler.pending_in(b.id()) > 0)
            .map(Batch::id);
        if let Some(id) = queued {
            match priority {
                Priority::Now => self.scheduler.promote(id),
                other => self.scheduler.demote(id, other),
            };
            return;
        }

        let grid = &self.stack[index];
        if priority != Priority::Now && grid.is_complete() {
            return;
        }
        let batch = self.scheduler.batch();
        let mut queued = 0;
        for job in grid.compress_jobs(batch.token()) {
            let source = Arc::clone(&self.source);
            self.scheduler.submit(&batch, priority, move || {
                if let Err(e) = job.run(source.as_ref()) {
                    debug!("tile {:?} not compressed: {e}", job.position());
                }
            });
            queued += 1;
        }
        debug!(
            "queued {queued} tiles of scale {} at {priority:?}",
            grid.scale()
        );
        self.batches[index] = Some(batch);
    }

    /// Renders the window on the calling thread, compressing its missing
    /// tiles first. Returns the empty clip while there is no window.
    pub fn render(&mut self) -> Result<Clip> {
        let Some(rt) = self.render_tile.as_mut() else {
            return Ok(Clip::empty());
        };
        if !rt.is_valid() {
            rt.view().compress(self.source.as_ref())?;
        }
        Ok(rt.render_texture()?.clone())
    }

    /// Queues a render of the window and returns its id. Exactly one
    /// [`RenderResponse`] is sent for every id; a newer request, a move or
    /// a scale switch turns an older one into `Cancelled`.
    pub fn render_async(&mut self) -> RequestId {
        let id = self.next_id();
        self.cancel_pending();
        let token = CancelToken::new();
        self.pending = Some((id, token.clone()));

        let Some(rt) = self.render_tile.as_ref() else {
            self.send(RenderResponse::Clip {
                id,
                generation: 0,
                clip: Clip::empty(),
            });
            return id;
        };
        if rt.is_valid() {
            let response = RenderResponse::Clip {
                id,
                generation: rt.generation(),
                clip: rt.current_clip().clone(),
            };
            self.send(response);
            return id;
        }

        let view = rt.view().clone();
        let generation = rt.generation();
        let cache = Arc::clone(&self.cache);
        let source = Arc::clone(&self.source);
        let tx = self.response_tx.clone();
        self.scheduler
            .submit_front(&self.render_batch, Priority::Now, move || {
                let response = match render_window(&view, generation, cache, source.as_ref(), &token) {
                    Ok(clip) => RenderResponse::Clip {
                        id,
                        generation,
                        clip,
                    },
                    Err(TileError::Cancelled) => RenderResponse::Cancelled(id),
                    Err(error) => RenderResponse::Error { id, error },
                };
                if tx.send(response).is_err() {
                    debug!("render {id:?} finished after the pool was dropped");
                }
            });
        id
    }

    fn send(&self, response: RenderResponse) {
        // the pool holds the receiver, so this cannot fail
        let _ = self.response_tx.send(response);
    }

    /// Installs a response from [`TilesPool::response_receiver`] into the
    /// window. Clips that no longer match the pending request or the window
    /// position come back as `Cancelled`.
    pub fn handle_response(&mut self, response: RenderResponse) -> RenderResponse {
        let id = response.id();
        let is_pending = self.pending.as_ref().is_some_and(|(p, _)| *p == id);
        if is_pending {
            self.pending = None;
        }

        match response {
            RenderResponse::Clip {
                id,
                generation,
                clip,
            } => {
                if !is_pending {
                    debug!("dropping superseded render {id:?}");
                    return RenderResponse::Cancelled(id);
                }
                let accepted = match self.render_tile.as_mut() {
                    None => clip.is_empty(),
                    Some(rt) => {
                        rt.install(generation, clip.clone())
                            || (rt.is_valid() && rt.generation() == generation)
                    }
                };
                if accepted {
                    RenderResponse::Clip {
                        id,
                        generation,
                        clip,
                    }
                } else {
                    debug!("dropping stale render {id:?}");
                    RenderResponse::Cancelled(id)
                }
            }
            RenderResponse::Error { id, error } => {
                if !is_pending {
                    debug!("dropping superseded failure {id:?}: {error}");
                    return RenderResponse::Cancelled(id);
                }
                if !error.is_recoverable() {
                    warn!("render {id:?} failed: {error}");
                }
                RenderResponse::Error { id, error }
            }
            cancelled => cancelled,
        }
    }

    /// Drains finished renders without blocking.
    pub fn poll_responses(&mut self) -> Vec<RenderResponse> {
        let mut responses = vec![];
        while let Ok(response) = self.response_rx.try_recv() {
            let response = self.handle_response(response);
            responses.push(response);
        }
        responses
    }

    /// Receiver for awaiting responses; pass them to
    /// [`TilesPool::handle_response`].
    pub fn response_receiver(&self) -> &Receiver<RenderResponse> {
        &self.response_rx
    }

    /// Id of the render still awaiting its response.
    #[must_use]
    pub fn pending_request(&self) -> Option<RequestId> {
        self.pending.as_ref().map(|(id, _)| *id)
    }

    fn cancel_pending(&mut self) {
        if let Some((id, token)) = self.pending.take() {
            debug!("cancelling render {id:?}");
            token.cancel();
        }
    }

    /// Last successfully rendered clip, the empty clip before the first.
    #[must_use]
    pub fn current_clip(&self) -> Clip {
        self.render_tile
            .as_ref()
            .map(|rt| rt.current_clip().clone())
            .unwrap_or_default()
    }

    /// Drops every buffer of a non-active grid, e.g. under memory pressure.
    pub fn invalidate_scale(&mut self, scale_index: usize) -> Result<()> {
        let Some(grid) = self.stack.get(scale_index) else {
            return Err(TileError::OutOfRange {
                x: scale_index as isize,
                y: 0,
                width: self.stack.len(),
                height: 1,
            });
        };
        if self.current == Some(scale_index) {
            return Err(TileError::contract(format!(
                "scale index {scale_index} is being rendered"
            )));
        }
        if let Some(batch) = self.batches[scale_index].take() {
            self.scheduler.cancel(&batch);
        }
        grid.invalidate();
        cache::lock(&self.cache).invalidate_scale(grid.scale());
        info!("evicted scale {}", grid.scale());
        Ok(())
    }

    /// Runs queued work on the calling thread; the way to make progress
    /// when the pool has no workers.
    pub fn run_pending(&self) -> usize {
        self.scheduler.run_until_idle()
    }

    /// Blocks until all queued work is done.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let grids: Vec<GridStats> = self.stack.iter().map(TilesGrid::stats).collect();
        let mut total = GridStats::default();
        for g in &grids {
            total += *g;
        }
        PoolStats {
            current: self.current,
            scales: self.config.scales.clone(),
            grids,
            total,
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    /// Cancels every queued batch and the pending render.
    pub fn shutdown(&mut self) {
        self.cancel_pending();
        for batch in self.batches.iter_mut().filter_map(Option::take) {
            self.scheduler.cancel(&batch);
        }
    }
}

impl Drop for TilesPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Compresses the missing tiles of `view`, then decodes and merges them.
fn render_window(
    view: &TilesGrid,
    generation: u64,
    cache: SharedDecodeCache,
    source: &dyn PixelSource,
    token: &CancelToken,
) -> Result<Clip> {
    for job in view.compress_jobs(token) {
        job.run(source)?;
    }
    RenderJob::from_view(view, generation, Some(cache))?.run(token)
}
