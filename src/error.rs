//! Error taxonomy for the tiling pipeline

use crate::measure::Unit;

/// Errors raised by grids, tiles, the render window and the pool.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// A collaborator handed over data that does not match its declared shape.
    #[error("contract violation: {detail}")]
    ContractViolation { detail: String },

    /// A region is too large to be compressed as a single block.
    #[error("{len} bytes exceed the {limit} bytes block limit")]
    CapacityExceeded { len: usize, limit: usize },

    /// Grid index outside the bounds of a view.
    #[error("index ({x}, {y}) out of range for a {width}x{height} grid")]
    OutOfRange {
        x: isize,
        y: isize,
        width: usize,
        height: usize,
    },

    /// Content requested before it was produced.
    #[error("not ready: {detail}")]
    NotReady { detail: String },

    /// Work superseded by a newer request.
    #[error("cancelled")]
    Cancelled,

    /// Scratch buffers for decompression or merging could not be allocated.
    #[error("cannot allocate {bytes} bytes")]
    AllocationFailure { bytes: usize },

    /// Conversion that needs a unit or a dpi that is not set.
    #[error("cannot convert from {from:?} to {to:?} (dpi {dpi})")]
    Unit { from: Unit, to: Unit, dpi: f64 },

    /// Compressor failure.
    #[error("codec: {0}")]
    Codec(#[from] std::io::Error),

    /// Pixel source failure.
    #[error("pixel source: {detail}")]
    Source { detail: String },
}

impl TileError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation { detail: msg.into() }
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady { detail: msg.into() }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source { detail: msg.into() }
    }

    /// Whether re-requesting later can succeed without any caller change.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::Cancelled)
    }
}

pub type Result<T, E = TileError> = std::result::Result<T, E>;
