//! Step-driven backend: flips complete only when told to.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{frame_checksum, Backend, HandleAllocator, PresentRequest};
use crate::buffer::BufferHandle;
use crate::error::BackendError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::types::{Geometry, SurfaceId};
use crate::vsync::VsyncNotifier;

#[derive(Default)]
struct ManualState {
    queued: VecDeque<(BufferHandle, VsyncNotifier)>,
    live: HashSet<BufferHandle>,
    released: Vec<BufferHandle>,
    presented: Vec<(SurfaceId, BufferHandle, u32)>,
    reject_next: usize,
    allocations_left: Option<usize>,
    visible: HashMap<SurfaceId, bool>,
}

/// Headless backend for harnesses and tests.
///
/// In the default mode every accepted present is queued until
/// [`ManualBackend::complete_next`] fires it. [`ManualBackend::synchronous`]
/// posts the completion before `present` returns, like a backend whose event
/// handler runs inside the render loop.
pub struct ManualBackend {
    state: Mutex<ManualState>,
    handles: HandleAllocator,
    synchronous: bool,
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState::default()),
            handles: HandleAllocator::new(),
            synchronous: false,
        }
    }

    /// Post each completion from inside `present`. The pool still applies
    /// it after `present` returns.
    pub fn synchronous() -> Self {
        Self {
            synchronous: true,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the oldest queued flip. Returns its handle.
    pub fn complete_next(&self) -> Option<BufferHandle> {
        let (handle, notifier) = self.state().queued.pop_front()?;
        notifier.notify_complete(handle);
        Some(handle)
    }

    /// Fire every queued flip in order. Returns how many fired.
    pub fn complete_all(&self) -> usize {
        let mut fired = 0;
        while self.complete_next().is_some() {
            fired += 1;
        }
        fired
    }

    /// Accepted presents not yet completed.
    pub fn pending_flips(&self) -> usize {
        self.state().queued.len()
    }

    /// Reject the next `count` presents.
    pub fn reject_next(&self, count: usize) {
        self.state().reject_next = count;
    }

    /// Let `count` more allocations succeed, then fail every later one.
    pub fn fail_allocations_after(&self, count: usize) {
        self.state().allocations_left = Some(count);
    }

    /// Accepted presents in issue order.
    pub fn presented(&self) -> Vec<BufferHandle> {
        self.state().presented.iter().map(|&(_, h, _)| h).collect()
    }

    /// Checksum of the pixels most recently presented on `surface`.
    pub fn last_checksum(&self, surface: SurfaceId) -> Option<u32> {
        self.state()
            .presented
            .iter()
            .rev()
            .find(|(s, _, _)| *s == surface)
            .map(|&(_, _, checksum)| checksum)
    }

    pub fn live_buffers(&self) -> usize {
        self.state().live.len()
    }

    pub fn released(&self) -> Vec<BufferHandle> {
        self.state().released.clone()
    }

    pub fn is_visible(&self, surface: SurfaceId) -> Option<bool> {
        self.state().visible.get(&surface).copied()
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &str {
        "manual"
    }

    fn allocate(
        &self,
        _surface: SurfaceId,
        _geometry: &Geometry,
        _pitch: usize,
    ) -> Result<BufferHandle, BackendError> {
        let mut state = self.state();
        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return Err(BackendError::Allocation("allocation limit reached".into()));
            }
            *left -= 1;
        }
        let handle = self.handles.next();
        state.live.insert(handle);
        Ok(handle)
    }

    fn release(&self, _surface: SurfaceId, handle: BufferHandle) {
        let mut state = self.state();
        if state.live.remove(&handle) {
            state.released.push(handle);
        } else {
            log(LogCategory::Backend, LogLevel::Warn, || {
                format!("manual: release of unknown {:?}", handle)
            });
        }
    }

    fn present(
        &self,
        request: PresentRequest<'_>,
        notifier: &VsyncNotifier,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if !state.live.contains(&request.handle) {
            return Err(BackendError::Rejected(format!(
                "{:?} is not a live buffer",
                request.handle
            )));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(BackendError::Rejected("injected failure".into()));
        }
        let checksum = frame_checksum(&request);
        state
            .presented
            .push((request.surface, request.handle, checksum));
        if self.synchronous {
            drop(state);
            notifier.notify_complete(request.handle);
        } else {
            state.queued.push_back((request.handle, notifier.clone()));
        }
        Ok(())
    }

    fn set_visible(&self, surface: SurfaceId, visible: bool) {
        self.state().visible.insert(surface, visible);
    }
}
