//! Error types for the presentation pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::types::SurfaceId;

/// Failure reported by a display backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("present rejected: {0}")]
    Rejected(String),
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
    #[error("display backend is disconnected")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool capacity must be at least 2, got {0}")]
    InvalidCapacity(usize),
    /// No free buffer right now. Only the non-blocking lookup reports this.
    #[error("no free buffer available")]
    PoolExhausted,
    #[error("cannot rebuild buffers while a flip is pending")]
    ResizeWhileBusy,
    #[error("gave up after {0:?} waiting for the pending flip")]
    TeardownTimeout(Duration),
    #[error("buffer pool has been torn down")]
    Released,
    /// The write reservation predates a resize and no longer names a live buffer.
    #[error("write reservation is stale")]
    StaleReservation,
    #[error(transparent)]
    Allocation(#[from] BackendError),
}

#[derive(Error, Debug)]
pub enum PresentError {
    #[error("backend rejected frame: {0}")]
    BackendRejected(#[source] BackendError),
    #[error("surface {0} is not open")]
    UnknownSurface(SurfaceId),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Resize(#[from] ResizeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start vsync dispatcher: {0}")]
    Vsync(#[from] std::io::Error),
}

impl PresentError {
    /// True when only the current frame was lost and the next one may be submitted.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PresentError::BackendRejected(_)
                | PresentError::InvalidFrame(_)
                | PresentError::Pool(PoolError::StaleReservation)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResizeError {
    #[error("surface {0} is not open")]
    UnknownSurface(SurfaceId),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
