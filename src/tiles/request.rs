//! Render request and response types

use super::render::Clip;
use crate::error::TileError;

/// Unique identifier for render requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Response from background render work
#[derive(Debug)]
pub enum RenderResponse {
    /// Merged pixels of the render window. `generation` is the window
    /// position the clip was built for.
    Clip {
        id: RequestId,
        generation: u64,
        clip: Clip,
    },

    /// Request was superseded or its window moved away
    Cancelled(RequestId),

    /// Error during compression or rendering
    Error { id: RequestId, error: TileError },
}

impl RenderResponse {
    #[must_use]
    pub fn id(&self) -> RequestId {
        match self {
            Self::Clip { id, .. } | Self::Cancelled(id) | Self::Error { id, .. } => *id,
        }
    }
}
