//! Software display with a real vsync clock.
//!
//! A `vsync-timer` thread ticks once per refresh interval. Each tick takes
//! the queued flips, records them as the surfaces' scanout and posts their
//! completions, so completions always arrive on a thread other than the
//! render loop's.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{frame_checksum, Backend, HandleAllocator, PresentRequest, DEFAULT_REFRESH_INTERVAL};
use crate::buffer::BufferHandle;
use crate::error::BackendError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::types::{Geometry, SurfaceId};
use crate::vsync::VsyncNotifier;

const HISTORY_LIMIT: usize = 4096;

/// What a surface shows after a vsync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutRecord {
    pub handle: BufferHandle,
    pub checksum: u32,
    /// Vsync tick at which the flip landed
    pub vsync: u64,
}

struct QueuedFlip {
    surface: SurfaceId,
    handle: BufferHandle,
    checksum: u32,
    notifier: VsyncNotifier,
}

#[derive(Default)]
struct DisplayState {
    queued: VecDeque<QueuedFlip>,
    scanout: HashMap<SurfaceId, ScanoutRecord>,
    history: Vec<(SurfaceId, BufferHandle)>,
    visible: HashMap<SurfaceId, bool>,
    live: usize,
    vsync_count: u64,
    present_calls: u64,
    reject_every: u64,
    running: bool,
}

struct DisplayShared {
    state: Mutex<DisplayState>,
    wake: Condvar,
}

impl DisplayShared {
    fn state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct VirtualDisplay {
    shared: Arc<DisplayShared>,
    timer: Mutex<Option<thread::JoinHandle<()>>>,
    interval: Duration,
    handles: HandleAllocator,
}

impl VirtualDisplay {
    pub fn new() -> std::io::Result<Self> {
        Self::with_interval(DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_hz(hz: u32) -> std::io::Result<Self> {
        Self::with_interval(Duration::from_secs_f64(1.0 / f64::from(hz.max(1))))
    }

    pub fn with_interval(interval: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(DisplayShared {
            state: Mutex::new(DisplayState {
                running: true,
                ..Default::default()
            }),
            wake: Condvar::new(),
        });
        let timer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vsync-timer".to_string())
                .spawn(move || run_vsync_timer(shared, interval))?
        };
        Ok(Self {
            shared,
            timer: Mutex::new(Some(timer)),
            interval,
            handles: HandleAllocator::new(),
        })
    }

    /// Reject every `n`th present (0 disables).
    pub fn reject_every(&self, n: u64) {
        self.shared.state().reject_every = n;
    }

    pub fn scanout(&self, surface: SurfaceId) -> Option<ScanoutRecord> {
        self.shared.state().scanout.get(&surface).copied()
    }

    /// Completed flips in completion order (most recent 4096).
    pub fn history(&self) -> Vec<(SurfaceId, BufferHandle)> {
        self.shared.state().history.clone()
    }

    pub fn vsync_count(&self) -> u64 {
        self.shared.state().vsync_count
    }

    pub fn live_buffers(&self) -> usize {
        self.shared.state().live
    }

    pub fn is_visible(&self, surface: SurfaceId) -> bool {
        self.shared
            .state()
            .visible
            .get(&surface)
            .copied()
            .unwrap_or(true)
    }

    /// Stop the vsync clock. Flips still queued never complete.
    pub fn stop(&self) {
        self.shared.state().running = false;
        self.shared.wake.notify_all();
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            let _ = timer.join();
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Backend for VirtualDisplay {
    fn name(&self) -> &str {
        "virtual"
    }

    fn allocate(
        &self,
        surface: SurfaceId,
        geometry: &Geometry,
        pitch: usize,
    ) -> Result<BufferHandle, BackendError> {
        if geometry.is_empty() || pitch < geometry.row_bytes() {
            return Err(BackendError::Allocation(format!(
                "{} with pitch {} on {}",
                geometry, pitch, surface
            )));
        }
        self.shared.state().live += 1;
        Ok(self.handles.next())
    }

    fn release(&self, _surface: SurfaceId, _handle: BufferHandle) {
        let mut state = self.shared.state();
        state.live = state.live.saturating_sub(1);
    }

    fn present(
        &self,
        request: PresentRequest<'_>,
        notifier: &VsyncNotifier,
    ) -> Result<(), BackendError> {
        let mut state = self.shared.state();
        if !state.running {
            return Err(BackendError::Disconnected);
        }
        state.present_calls += 1;
        if state.reject_every > 0 && state.present_calls % state.reject_every == 0 {
            return Err(BackendError::Rejected(format!(
                "present #{} refused",
                state.present_calls
            )));
        }
        state.queued.push_back(QueuedFlip {
            surface: request.surface,
            handle: request.handle,
            checksum: frame_checksum(&request),
            notifier: notifier.clone(),
        });
        Ok(())
    }

    fn set_visible(&self, surface: SurfaceId, visible: bool) {
        self.shared.state().visible.insert(surface, visible);
    }

    fn refresh_interval(&self) -> Duration {
        self.interval
    }
}

fn run_vsync_timer(shared: Arc<DisplayShared>, interval: Duration) {
    let mut next_tick = Instant::now() + interval;
    loop {
        let mut state = shared.state();
        loop {
            if !state.running {
                return;
            }
            let now = Instant::now();
            if now >= next_tick {
                break;
            }
            state = shared
                .wake
                .wait_timeout(state, next_tick - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        next_tick += interval;

        state.vsync_count += 1;
        let vsync = state.vsync_count;
        let flips: Vec<QueuedFlip> = state.queued.drain(..).collect();
        for flip in &flips {
            state.scanout.insert(
                flip.surface,
                ScanoutRecord {
                    handle: flip.handle,
                    checksum: flip.checksum,
                    vsync,
                },
            );
            state.history.push((flip.surface, flip.handle));
        }
        if state.history.len() > HISTORY_LIMIT {
            let excess = state.history.len() - HISTORY_LIMIT;
            state.history.drain(..excess);
        }
        drop(state);

        for flip in flips {
            log(LogCategory::Backend, LogLevel::Trace, || {
                format!("virtual: vsync {} shows {:?} on {}", vsync, flip.handle, flip.surface)
            });
            flip.notifier.notify_complete(flip.handle);
        }
    }
}
