//! Flip scheduling for one surface.
//!
//! ```text
//!          submit_frame(b)                 vsync complete(b)
//!   Idle ------------------> FlipPending -------------------> Idle
//!          b: Free -> InFlight             b: InFlight -> Current
//!                                          previous Current -> Free
//! ```
//!
//! `submit_frame` while a flip is pending blocks until it completes; there
//! is never more than one request outstanding with the backend, so buffers
//! reach the screen in submission order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, PresentRequest};
use crate::buffer::{BufferHandle, WriteTarget};
use crate::error::{PoolError, PresentError};
use crate::logging::{log, LogCategory, LogLevel};
use crate::pool::BufferPool;
use crate::vsync::VsyncNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipPhase {
    Idle,
    FlipPending,
}

pub struct PresentationScheduler {
    pool: Arc<BufferPool>,
    backend: Arc<dyn Backend>,
    notifier: VsyncNotifier,
}

impl PresentationScheduler {
    pub fn new(pool: Arc<BufferPool>, backend: Arc<dyn Backend>, notifier: VsyncNotifier) -> Self {
        Self {
            pool,
            backend,
            notifier,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn phase(&self) -> FlipPhase {
        if self.pool.is_pending() {
            FlipPhase::FlipPending
        } else {
            FlipPhase::Idle
        }
    }

    /// Hand a written buffer to the backend for the next vsync.
    ///
    /// Waits for any pending flip first. If the backend refuses the buffer it
    /// goes back to `Free` and the frame is dropped.
    pub fn submit_frame(&self, target: WriteTarget) -> Result<(), PresentError> {
        let surface = self.pool.surface();
        let started = Instant::now();
        let (mut inner, waited) =
            self.pool
                .wait_until(self.pool.lock(), None, "the pending flip", |inner| {
                    inner.released() || inner.in_flight().is_none()
                });
        if inner.released() {
            return Err(PoolError::Released.into());
        }
        if waited {
            inner.stats.record_wait(started.elapsed());
        }

        let index = inner.begin_flip(target)?;
        let buffer = inner.buffer(index);
        let handle = buffer.handle();
        let request = PresentRequest {
            surface,
            handle,
            geometry: buffer.geometry(),
            pitch: buffer.pitch(),
            pixels: buffer.pixels().unwrap_or_default(),
        };

        // The lock stays held across present so a completion cannot be
        // applied before the request is recorded as pending.
        let result = self.backend.present(request, &self.notifier);
        match result {
            Ok(()) => {
                inner.stats.submitted += 1;
                drop(inner);
                log(LogCategory::Flip, LogLevel::Trace, || {
                    format!("{}: flip to buffer {} ({:?}) issued", surface, index, handle)
                });
                Ok(())
            }
            Err(err) => {
                inner.abort_flip(index);
                inner.stats.dropped += 1;
                drop(inner);
                self.pool.notify();
                log(LogCategory::Flip, LogLevel::Warn, || {
                    format!("{}: backend refused buffer {}: {}", surface, index, err)
                });
                Err(PresentError::BackendRejected(err))
            }
        }
    }

    /// Completion handler; safe to call from any thread.
    pub fn on_vsync_complete(&self, handle: BufferHandle) -> bool {
        self.pool.complete_flip(handle)
    }

    /// Block until no flip is pending (`None` waits indefinitely).
    pub fn drain(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        self.pool.drain(timeout)
    }
}
