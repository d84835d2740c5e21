//! Fixed set of display buffers for one surface.
//!
//! The buffer state table and the pending-flip slot live behind a single
//! mutex. Every transition (reserve, submit, complete, resize, teardown)
//! happens under that lock, and every blocking wait is a condition wait on
//! it (or, in polled vsync mode, a pump of the completion channel with the
//! lock released).
//!
//! Invariants, checked in debug builds after each transition:
//! - `free + in_flight + current == capacity`
//! - at most one buffer is `InFlight`, and it is the one named by `in_flight`
//! - at most one buffer is `Current`, and it is the one named by `current`

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::Backend;
use crate::buffer::{Buffer, BufferHandle, BufferState, WriteTarget};
use crate::error::PoolError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::stats::FrameStats;
use crate::types::{Geometry, SurfaceId};
use crate::vsync::Waiter;

/// Tunables a presenter passes down from its config.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Row stride alignment in bytes
    pub pitch_alignment: usize,
    /// A writer blocked this long gets a warning (it keeps waiting)
    pub stall_warning: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pitch_alignment: 64,
            stall_warning: Duration::from_millis(500),
        }
    }
}

/// Point-in-time copy of a pool's state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub surface: SurfaceId,
    pub geometry: Geometry,
    pub capacity: usize,
    pub states: Vec<BufferState>,
    pub reserved: Vec<bool>,
    pub handles: Vec<BufferHandle>,
    pub current: Option<usize>,
    pub in_flight: Option<usize>,
    pub generation: u64,
    pub released: bool,
}

impl PoolSnapshot {
    pub fn count(&self, state: BufferState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }
}

pub(crate) struct PoolInner {
    buffers: Vec<Buffer>,
    geometry: Geometry,
    pitch: usize,
    current: Option<usize>,
    in_flight: Option<usize>,
    generation: u64,
    released: bool,
    pub(crate) stats: FrameStats,
}

impl PoolInner {
    pub(crate) fn released(&self) -> bool {
        self.released
    }

    pub(crate) fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    pub(crate) fn buffer(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }

    fn first_free(&self) -> Option<usize> {
        self.buffers.iter().position(Buffer::is_available)
    }

    fn reserve_first_free(&mut self) -> Option<WriteTarget> {
        let index = self.first_free()?;
        let generation = self.generation;
        self.buffers[index].acquire_for_write(generation).ok()
    }

    /// Take a written buffer back and mark it `InFlight`.
    pub(crate) fn begin_flip(&mut self, target: WriteTarget) -> Result<usize, PoolError> {
        if target.generation() != self.generation || self.released {
            return Err(PoolError::StaleReservation);
        }
        // The scheduler waits for Idle before calling this
        if self.in_flight.is_some() {
            self.return_target(target);
            return Err(PoolError::PoolExhausted);
        }
        let index = target.index();
        let buffer = &mut self.buffers[index];
        buffer.restore(target);
        buffer.mark_in_flight();
        self.in_flight = Some(index);
        self.check_invariants();
        Ok(index)
    }

    /// Undo `begin_flip` after the backend refused the buffer.
    pub(crate) fn abort_flip(&mut self, index: usize) {
        debug_assert_eq!(self.in_flight, Some(index));
        self.buffers[index].mark_free();
        self.in_flight = None;
        self.check_invariants();
    }

    fn complete(&mut self, handle: BufferHandle) -> Option<usize> {
        let index = self.in_flight?;
        if self.buffers[index].handle() != handle {
            return None;
        }
        if let Some(previous) = self.current.take() {
            self.buffers[previous].mark_free();
        }
        self.buffers[index].mark_current();
        self.current = Some(index);
        self.in_flight = None;
        self.stats.presented += 1;
        self.check_invariants();
        Some(index)
    }

    fn return_target(&mut self, target: WriteTarget) {
        if target.generation() == self.generation && !self.released {
            let index = target.index();
            self.buffers[index].restore(target);
        }
    }

    fn release_all(&mut self, surface: SurfaceId, backend: &dyn Backend) {
        for buffer in self.buffers.drain(..) {
            backend.release(surface, buffer.handle());
        }
        self.current = None;
        self.in_flight = None;
    }

    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let free = self
                .buffers
                .iter()
                .filter(|b| b.state() == BufferState::Free)
                .count();
            let in_flight: Vec<usize> = self
                .buffers
                .iter()
                .filter(|b| b.state() == BufferState::InFlight)
                .map(Buffer::index)
                .collect();
            let current: Vec<usize> = self
                .buffers
                .iter()
                .filter(|b| b.state() == BufferState::Current)
                .map(Buffer::index)
                .collect();
            debug_assert_eq!(free + in_flight.len() + current.len(), self.buffers.len());
            debug_assert_eq!(in_flight, self.in_flight.into_iter().collect::<Vec<_>>());
            debug_assert_eq!(current, self.current.into_iter().collect::<Vec<_>>());
        }
    }
}

pub struct BufferPool {
    surface: SurfaceId,
    inner: Mutex<PoolInner>,
    changed: Condvar,
    waiter: Waiter,
    options: PoolOptions,
}

impl BufferPool {
    /// Allocate `capacity` buffers. Completions must reach [`BufferPool::complete_flip`]
    /// from another thread.
    pub fn new(
        surface: SurfaceId,
        capacity: usize,
        geometry: Geometry,
        backend: &dyn Backend,
    ) -> Result<Arc<Self>, PoolError> {
        Self::with_options(
            surface,
            capacity,
            geometry,
            backend,
            PoolOptions::default(),
            Waiter::Condvar,
        )
    }

    pub(crate) fn with_options(
        surface: SurfaceId,
        capacity: usize,
        geometry: Geometry,
        backend: &dyn Backend,
        options: PoolOptions,
        waiter: Waiter,
    ) -> Result<Arc<Self>, PoolError> {
        let pitch = geometry.aligned_pitch(options.pitch_alignment);
        let buffers = allocate_buffers(surface, capacity, geometry, pitch, backend)?;
        log(LogCategory::Pool, LogLevel::Info, || {
            format!("{}: {} buffers at {}, pitch {}", surface, capacity, geometry, pitch)
        });

        Ok(Arc::new(Self {
            surface,
            inner: Mutex::new(PoolInner {
                buffers,
                geometry,
                pitch,
                current: None,
                in_flight: None,
                generation: 0,
                released: false,
                stats: FrameStats::default(),
            }),
            changed: Condvar::new(),
            waiter,
            options,
        }))
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn capacity(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn geometry(&self) -> Geometry {
        self.lock().geometry
    }

    pub fn pitch(&self) -> usize {
        self.lock().pitch
    }

    pub fn is_pending(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn stats(&self) -> FrameStats {
        self.lock().stats
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        PoolSnapshot {
            surface: self.surface,
            geometry: inner.geometry,
            capacity: inner.buffers.len(),
            states: inner.buffers.iter().map(Buffer::state).collect(),
            reserved: inner.buffers.iter().map(Buffer::is_reserved).collect(),
            handles: inner.buffers.iter().map(Buffer::handle).collect(),
            current: inner.current,
            in_flight: inner.in_flight,
            generation: inner.generation,
            released: inner.released,
        }
    }

    /// Reserve the lowest-index free buffer without blocking.
    pub fn try_get_free_buffer(&self) -> Result<WriteTarget, PoolError> {
        let mut inner = self.lock();
        if inner.released {
            return Err(PoolError::Released);
        }
        inner.reserve_first_free().ok_or(PoolError::PoolExhausted)
    }

    /// Reserve the lowest-index free buffer, waiting for a flip to complete
    /// if every buffer is in flight, on screen or already reserved.
    ///
    /// Only fails once the pool is torn down.
    pub fn get_free_buffer(&self) -> Result<WriteTarget, PoolError> {
        let started = Instant::now();
        let (mut inner, waited) = self.wait_until(self.lock(), None, "a free buffer", |inner| {
            inner.released || inner.first_free().is_some()
        });
        if inner.released {
            return Err(PoolError::Released);
        }
        if waited {
            inner.stats.record_wait(started.elapsed());
        }
        inner.reserve_first_free().ok_or(PoolError::PoolExhausted)
    }

    /// Give an unsubmitted reservation back. Stale reservations are discarded.
    pub fn return_buffer(&self, target: WriteTarget) {
        self.lock().return_target(target);
        self.changed.notify_all();
    }

    /// Vsync completion for `handle`: the in-flight buffer becomes current and
    /// the previously current one is freed. Returns false for a completion
    /// that does not match the pending flip.
    pub fn complete_flip(&self, handle: BufferHandle) -> bool {
        let mut inner = self.lock();
        match inner.complete(handle) {
            Some(index) => {
                drop(inner);
                self.changed.notify_all();
                log(LogCategory::Flip, LogLevel::Trace, || {
                    format!("{}: buffer {} ({:?}) on screen", self.surface, index, handle)
                });
                true
            }
            None => {
                let pending = inner.in_flight.map(|i| inner.buffers[i].handle());
                drop(inner);
                log(LogCategory::Flip, LogLevel::Warn, || {
                    format!(
                        "{}: unexpected completion for {:?} (pending {:?})",
                        self.surface, handle, pending
                    )
                });
                false
            }
        }
    }

    /// Wait until no flip is pending. `None` waits as long as it takes.
    pub fn drain(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (inner, _) = self.wait_until(self.lock(), deadline, "the pending flip", |inner| {
            inner.in_flight.is_none()
        });
        match (inner.in_flight, timeout) {
            (Some(_), Some(timeout)) => Err(PoolError::TeardownTimeout(timeout)),
            _ => Ok(()),
        }
    }

    /// Replace every buffer with `capacity` fresh ones at `geometry`.
    ///
    /// The caller drains first; a pending flip fails with `ResizeWhileBusy`.
    /// New buffers are allocated before the old ones are released, so a
    /// failed allocation leaves the pool as it was. Outstanding reservations
    /// become stale.
    pub fn resize(
        &self,
        geometry: Geometry,
        capacity: usize,
        backend: &dyn Backend,
    ) -> Result<(), PoolError> {
        self.rebuild(geometry, capacity, backend, false)
    }

    /// Like [`BufferPool::resize`], but a flip the backend never confirmed is
    /// abandoned once the new buffers exist. If allocation fails the pending
    /// flip stays in flight.
    pub(crate) fn resize_abandoning(
        &self,
        geometry: Geometry,
        capacity: usize,
        backend: &dyn Backend,
    ) -> Result<(), PoolError> {
        self.rebuild(geometry, capacity, backend, true)
    }

    fn rebuild(
        &self,
        geometry: Geometry,
        capacity: usize,
        backend: &dyn Backend,
        abandon: bool,
    ) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.released {
            return Err(PoolError::Released);
        }
        if inner.in_flight.is_some() && !abandon {
            return Err(PoolError::ResizeWhileBusy);
        }
        let pitch = geometry.aligned_pitch(self.options.pitch_alignment);
        let buffers = allocate_buffers(self.surface, capacity, geometry, pitch, backend)?;

        let abandoned = inner.in_flight.map(|i| inner.buffers[i].handle());
        inner.release_all(self.surface, backend);
        inner.buffers = buffers;
        inner.geometry = geometry;
        inner.pitch = pitch;
        inner.generation += 1;
        inner.stats.resizes += 1;
        inner.check_invariants();
        drop(inner);
        self.changed.notify_all();

        if let Some(handle) = abandoned {
            log(LogCategory::Flip, LogLevel::Warn, || {
                format!("{}: abandoned unconfirmed flip of {:?}", self.surface, handle)
            });
        }
        log(LogCategory::Pool, LogLevel::Info, || {
            format!("{}: rebuilt {} buffers at {}", self.surface, capacity, geometry)
        });
        Ok(())
    }

    /// Wait up to `timeout` for the pending flip, then release every buffer.
    ///
    /// Buffers are released even when the wait times out; the timeout is
    /// reported afterwards. Writers blocked in `get_free_buffer` wake with
    /// `Released`. Calling this again is a no-op.
    pub fn teardown(&self, backend: &dyn Backend, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let (mut inner, _) = self.wait_until(self.lock(), Some(deadline), "the last flip", |inner| {
            inner.released || inner.in_flight.is_none()
        });
        if inner.released {
            return Ok(());
        }

        let timed_out = inner.in_flight.is_some();
        if timed_out {
            inner.stats.teardown_timeouts += 1;
        }
        let count = inner.buffers.len();
        inner.release_all(self.surface, backend);
        inner.released = true;
        drop(inner);
        self.changed.notify_all();

        if timed_out {
            log(LogCategory::Pool, LogLevel::Warn, || {
                format!(
                    "{}: flip still pending after {:?}, releasing buffers anyway",
                    self.surface, timeout
                )
            });
            return Err(PoolError::TeardownTimeout(timeout));
        }
        log(LogCategory::Pool, LogLevel::Info, || {
            format!("{}: released {} buffers", self.surface, count)
        });
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block until `ready` holds or `deadline` passes. Returns the guard and
    /// whether any waiting happened.
    pub(crate) fn wait_until<'a, F>(
        &'a self,
        mut guard: MutexGuard<'a, PoolInner>,
        deadline: Option<Instant>,
        what: &str,
        ready: F,
    ) -> (MutexGuard<'a, PoolInner>, bool)
    where
        F: Fn(&PoolInner) -> bool,
    {
        let started = Instant::now();
        let stall = self.options.stall_warning.max(Duration::from_millis(1));
        let mut waited = false;
        let mut warned = false;

        while !ready(&guard) {
            let mut slice = stall;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                slice = slice.min(deadline - now);
            }
            if !waited {
                log(LogCategory::Flip, LogLevel::Debug, || {
                    format!("{}: waiting for {}", self.surface, what)
                });
                waited = true;
            }

            guard = match &self.waiter {
                Waiter::Condvar => {
                    self.changed
                        .wait_timeout(guard, slice)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                Waiter::Pump(router) => {
                    drop(guard);
                    router.pump(slice);
                    self.lock()
                }
            };

            if deadline.is_none() && !warned && started.elapsed() >= stall {
                warned = true;
                log(LogCategory::Flip, LogLevel::Warn, || {
                    format!(
                        "{}: still waiting for {} after {:?}",
                        self.surface,
                        what,
                        started.elapsed()
                    )
                });
            }
        }
        (guard, waited)
    }
}

fn allocate_buffers(
    surface: SurfaceId,
    capacity: usize,
    geometry: Geometry,
    pitch: usize,
    backend: &dyn Backend,
) -> Result<Vec<Buffer>, PoolError> {
    if capacity < 2 {
        return Err(PoolError::InvalidCapacity(capacity));
    }
    let mut buffers = Vec::with_capacity(capacity);
    for index in 0..capacity {
        match backend.allocate(surface, &geometry, pitch) {
            Ok(handle) => buffers.push(Buffer::new(index, handle, geometry, pitch)),
            Err(err) => {
                for buffer in &buffers {
                    backend.release(surface, buffer.handle());
                }
                log(LogCategory::Pool, LogLevel::Error, || {
                    format!("{}: allocating buffer {} failed: {}", surface, index, err)
                });
                return Err(err.into());
            }
        }
    }
    Ok(buffers)
}
