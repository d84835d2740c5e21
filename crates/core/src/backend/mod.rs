//! Display backend abstraction
//!
//! A backend owns the hardware side of presentation: it hands out buffer
//! handles, accepts "show this buffer at the next vsync" requests and reports
//! each completed flip through the [`VsyncNotifier`] it was given.
//!
//! Contract for [`Backend::present`]:
//! - return before the flip is visible;
//! - on `Ok`, call `notifier.notify_complete(handle)` exactly once, in the
//!   order the presents were issued;
//! - on `Err`, never notify for that request.
//!
//! A completion may be posted from inside `present` (a backend that handles
//! its events synchronously does). It is only applied after `present`
//! returns: the pool lock is held across the call and notifying only sends
//! on the vsync channel, so the flip is always recorded as pending first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferHandle;
use crate::error::BackendError;
use crate::types::{Geometry, SurfaceId};
use crate::vsync::VsyncNotifier;

mod manual;
mod virtual_display;

pub use manual::ManualBackend;
pub use virtual_display::{ScanoutRecord, VirtualDisplay};

/// 60 Hz
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

/// One flip request: the buffer to show and its pixels as written.
#[derive(Debug, Clone, Copy)]
pub struct PresentRequest<'a> {
    pub surface: SurfaceId,
    pub handle: BufferHandle,
    pub geometry: Geometry,
    pub pitch: usize,
    pub pixels: &'a [u8],
}

pub trait Backend: Send + Sync {
    /// Backend name (for logs and the CLI)
    fn name(&self) -> &str;

    /// Create one display buffer for `surface`.
    fn allocate(
        &self,
        surface: SurfaceId,
        geometry: &Geometry,
        pitch: usize,
    ) -> Result<BufferHandle, BackendError>;

    /// Destroy a buffer created by `allocate`.
    fn release(&self, surface: SurfaceId, handle: BufferHandle);

    /// Queue a flip to `request.handle` at the next vsync.
    fn present(
        &self,
        request: PresentRequest<'_>,
        notifier: &VsyncNotifier,
    ) -> Result<(), BackendError>;

    /// Show or hide a surface without tearing it down.
    fn set_visible(&self, _surface: SurfaceId, _visible: bool) {}

    /// Time between vsyncs
    fn refresh_interval(&self) -> Duration {
        DEFAULT_REFRESH_INTERVAL
    }
}

/// Explicitly owned handle to the display backend, shared by every surface
/// of a presenter.
#[derive(Clone)]
pub struct BackendContext {
    backend: Arc<dyn Backend>,
}

impl BackendContext {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.backend.refresh_interval()
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Monotonic handle source; handles are never reused within a backend.
#[derive(Debug)]
pub(crate) struct HandleAllocator(AtomicU64);

impl HandleAllocator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> BufferHandle {
        BufferHandle(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// FNV-1a over the visible part of each row.
pub(crate) fn frame_checksum(request: &PresentRequest<'_>) -> u32 {
    let row_bytes = request.geometry.row_bytes().min(request.pitch);
    let mut hash: u32 = 0x811c_9dc5;
    for row in request.pixels.chunks(request.pitch.max(1)) {
        for &byte in &row[..row_bytes.min(row.len())] {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    hash
}
