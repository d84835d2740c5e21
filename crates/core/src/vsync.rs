//! Vsync completion channel between display backends and flip pools.
//!
//! Backends never touch pool state. They hold a [`VsyncNotifier`] and post a
//! completion message once a flip is visible. The messages are routed to the
//! owning [`BufferPool`] either by a dedicated `vsync-dispatch` thread
//! ([`VsyncDelivery::Threaded`]) or by the render thread itself whenever it
//! pumps events or blocks on backpressure ([`VsyncDelivery::Polled`]).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferHandle;
use crate::logging::{log, LogCategory, LogLevel};
use crate::pool::BufferPool;
use crate::types::SurfaceId;

/// Where completion notifications are turned into pool transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VsyncDelivery {
    /// A dispatcher thread applies completions as soon as they arrive
    #[default]
    Threaded,
    /// The render thread applies completions from `process_events` and while waiting
    Polled,
}

#[derive(Debug, Clone, Copy)]
struct VsyncEvent {
    surface: SurfaceId,
    handle: BufferHandle,
}

enum VsyncMessage {
    Complete(VsyncEvent),
    Shutdown,
}

/// Completion sender handed to a backend along with each present request.
#[derive(Clone)]
pub struct VsyncNotifier {
    surface: SurfaceId,
    tx: channel::Sender<VsyncMessage>,
}

impl VsyncNotifier {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Report that the flip to `handle` is now being scanned out.
    pub fn notify_complete(&self, handle: BufferHandle) {
        let event = VsyncEvent {
            surface: self.surface,
            handle,
        };
        if self.tx.send(VsyncMessage::Complete(event)).is_err() {
            log(LogCategory::Vsync, LogLevel::Debug, || {
                format!("{}: completion for {:?} after shutdown", self.surface, handle)
            });
        }
    }
}

impl fmt::Debug for VsyncNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsyncNotifier")
            .field("surface", &self.surface)
            .finish_non_exhaustive()
    }
}

/// Receiving end plus the surface routing table.
pub(crate) struct VsyncRouter {
    rx: channel::Receiver<VsyncMessage>,
    routes: RwLock<HashMap<SurfaceId, Weak<BufferPool>>>,
}

impl VsyncRouter {
    fn dispatch(&self, event: VsyncEvent) -> bool {
        let pool = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.surface)
            .and_then(Weak::upgrade);
        match pool {
            Some(pool) => pool.complete_flip(event.handle),
            None => {
                log(LogCategory::Vsync, LogLevel::Warn, || {
                    format!(
                        "{}: completion for {:?} but surface is closed",
                        event.surface, event.handle
                    )
                });
                false
            }
        }
    }

    /// Apply completions that have already arrived.
    pub(crate) fn drain_ready(&self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            if let VsyncMessage::Complete(event) = message {
                self.dispatch(event);
                handled += 1;
            }
        }
        handled
    }

    /// Wait up to `timeout` for a completion, then apply everything pending.
    pub(crate) fn pump(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(VsyncMessage::Complete(event)) => {
                self.dispatch(event);
                1 + self.drain_ready()
            }
            Ok(VsyncMessage::Shutdown) | Err(_) => 0,
        }
    }
}

/// How a pool blocks until a completion changes its state.
#[derive(Clone)]
pub(crate) enum Waiter {
    /// Completions arrive from another thread and signal the pool's condvar.
    Condvar,
    /// The waiting thread delivers completions itself.
    Pump(Arc<VsyncRouter>),
}

/// Owner of the completion channel and, in threaded mode, the dispatcher.
pub struct VsyncSignal {
    tx: channel::Sender<VsyncMessage>,
    router: Arc<VsyncRouter>,
    delivery: VsyncDelivery,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VsyncSignal {
    pub fn new(delivery: VsyncDelivery) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let router = Arc::new(VsyncRouter {
            rx,
            routes: RwLock::new(HashMap::new()),
        });

        let dispatcher = match delivery {
            VsyncDelivery::Threaded => {
                let router = Arc::clone(&router);
                Some(
                    thread::Builder::new()
                        .name("vsync-dispatch".to_string())
                        .spawn(move || run_dispatcher(router))?,
                )
            }
            VsyncDelivery::Polled => None,
        };

        Ok(Self {
            tx,
            router,
            delivery,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    pub fn delivery(&self) -> VsyncDelivery {
        self.delivery
    }

    pub fn notifier(&self, surface: SurfaceId) -> VsyncNotifier {
        VsyncNotifier {
            surface,
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn register(&self, surface: SurfaceId, pool: &Arc<BufferPool>) {
        self.router
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface, Arc::downgrade(pool));
    }

    pub(crate) fn unregister(&self, surface: SurfaceId) {
        self.router
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&surface);
    }

    pub(crate) fn waiter(&self) -> Waiter {
        match self.delivery {
            VsyncDelivery::Threaded => Waiter::Condvar,
            VsyncDelivery::Polled => Waiter::Pump(Arc::clone(&self.router)),
        }
    }

    /// Apply pending completions on the calling thread. No-op in threaded mode.
    pub fn process_events(&self) -> usize {
        match self.delivery {
            VsyncDelivery::Threaded => 0,
            VsyncDelivery::Polled => self.router.drain_ready(),
        }
    }

    /// Stop the dispatcher thread. Idempotent.
    pub fn shutdown(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.tx.send(VsyncMessage::Shutdown);
            if handle.join().is_err() {
                log(LogCategory::Vsync, LogLevel::Error, || {
                    "vsync dispatcher panicked".to_string()
                });
            }
        }
    }
}

impl Drop for VsyncSignal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatcher(router: Arc<VsyncRouter>) {
    while let Ok(message) = router.rx.recv() {
        match message {
            VsyncMessage::Complete(event) => {
                router.dispatch(event);
            }
            VsyncMessage::Shutdown => break,
        }
    }
    log(LogCategory::Vsync, LogLevel::Debug, || {
        "vsync dispatcher stopped".to_string()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManualBackend;
    use crate::buffer::BufferState;
    use crate::scheduler::PresentationScheduler;
    use crate::types::{Geometry, PixelFormat};

    fn setup(delivery: VsyncDelivery) -> (Arc<ManualBackend>, VsyncSignal, PresentationScheduler) {
        let backend = Arc::new(ManualBackend::new());
        let signal = VsyncSignal::new(delivery).unwrap();
        let geometry = Geometry::new(8, 8, PixelFormat::Xrgb8888);
        let pool = BufferPool::new(SurfaceId::Main, 2, geometry, &*backend).unwrap();
        signal.register(SurfaceId::Main, &pool);
        let scheduler = PresentationScheduler::new(
            pool,
            backend.clone(),
            signal.notifier(SurfaceId::Main),
        );
        (backend, signal, scheduler)
    }

    #[test]
    fn polled_events_wait_for_process_events() {
        let (backend, signal, scheduler) = setup(VsyncDelivery::Polled);
        let target = scheduler.pool().get_free_buffer().unwrap();
        scheduler.submit_frame(target).unwrap();

        assert!(backend.complete_next().is_some());
        assert_eq!(scheduler.pool().snapshot().states[0], BufferState::InFlight);

        assert_eq!(signal.process_events(), 1);
        assert_eq!(scheduler.pool().snapshot().states[0], BufferState::Current);
    }

    #[test]
    fn threaded_dispatcher_applies_completions() {
        let (backend, signal, scheduler) = setup(VsyncDelivery::Threaded);
        let target = scheduler.pool().get_free_buffer().unwrap();
        scheduler.submit_frame(target).unwrap();
        backend.complete_next();

        scheduler.drain(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(scheduler.pool().snapshot().current, Some(0));
        assert_eq!(signal.process_events(), 0);
        signal.shutdown();
        signal.shutdown();
    }

    #[test]
    fn completion_for_closed_surface_is_ignored() {
        let signal = VsyncSignal::new(VsyncDelivery::Polled).unwrap();
        signal
            .notifier(SurfaceId::Menu)
            .notify_complete(BufferHandle(42));
        assert_eq!(signal.process_events(), 1);
    }

    #[test]
    fn notify_after_shutdown_is_harmless() {
        let notifier = {
            let signal = VsyncSignal::new(VsyncDelivery::Threaded).unwrap();
            signal.notifier(SurfaceId::Main)
        };
        notifier.notify_complete(BufferHandle(1));
        assert_eq!(notifier.surface(), SurfaceId::Main);
    }
}
