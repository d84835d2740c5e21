//! Composition root: one pool and one scheduler per output surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendContext};
use crate::blit::{Blitter, CopyBlitter};
use crate::config::PresenterConfig;
use crate::error::{PoolError, PresentError, ResizeError};
use crate::logging::{log, LogCategory, LogLevel};
use crate::pool::{BufferPool, PoolSnapshot};
use crate::scheduler::PresentationScheduler;
use crate::stats::FrameStats;
use crate::types::{Geometry, SurfaceId};
use crate::vsync::{VsyncDelivery, VsyncSignal};

struct Surface {
    pool: Arc<BufferPool>,
    scheduler: PresentationScheduler,
    visible: bool,
}

/// Frontend entry point of the presentation pipeline.
///
/// Surfaces open lazily on their first frame. Every method runs on the
/// render thread; completions arrive through the vsync channel, either on
/// the dispatcher thread or from [`Presenter::process_events`].
pub struct Presenter {
    context: BackendContext,
    config: PresenterConfig,
    vsync: VsyncSignal,
    surfaces: BTreeMap<SurfaceId, Surface>,
    blitter: Box<dyn Blitter>,
    shut_down: bool,
}

impl Presenter {
    pub fn new(context: BackendContext, config: PresenterConfig) -> Result<Self, PresentError> {
        config.validate()?;
        let vsync = VsyncSignal::new(config.vsync_delivery)?;
        log(LogCategory::Presenter, LogLevel::Info, || {
            format!(
                "presenter on {} backend, {} buffers, {:?} vsync delivery",
                context.name(),
                config.buffer_count,
                config.vsync_delivery
            )
        });
        Ok(Self {
            context,
            config,
            vsync,
            surfaces: BTreeMap::new(),
            blitter: Box::new(CopyBlitter),
            shut_down: false,
        })
    }

    /// Replace the default row copy with a converting or scaling blitter.
    pub fn with_blitter<B: Blitter + 'static>(mut self, blitter: B) -> Self {
        log(LogCategory::Presenter, LogLevel::Debug, || {
            format!("using {} blitter", blitter.name())
        });
        self.blitter = Box::new(blitter);
        self
    }

    pub fn config(&self) -> &PresenterConfig {
        &self.config
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    pub fn delivery(&self) -> VsyncDelivery {
        self.vsync.delivery()
    }

    fn backend(&self) -> &dyn Backend {
        self.context.backend().as_ref()
    }

    fn teardown_timeout(&self) -> Duration {
        self.config.teardown_timeout(self.context.refresh_interval())
    }

    /// Allocate `surface`'s buffers at `width` x `height`. An open surface is
    /// resized instead.
    pub fn open_surface(
        &mut self,
        surface: SurfaceId,
        width: u32,
        height: u32,
    ) -> Result<(), PresentError> {
        if self.shut_down {
            return Err(PoolError::Released.into());
        }
        if self.surfaces.contains_key(&surface) {
            return Ok(self.resize(surface, width, height)?);
        }
        let geometry = Geometry::new(width, height, self.config.pixel_format);
        if geometry.is_empty() {
            return Err(ResizeError::InvalidGeometry(geometry.to_string()).into());
        }

        let pool = BufferPool::with_options(
            surface,
            self.config.capacity_for(surface),
            geometry,
            self.backend(),
            self.config.pool_options(),
            self.vsync.waiter(),
        )?;
        self.vsync.register(surface, &pool);
        let scheduler = PresentationScheduler::new(
            Arc::clone(&pool),
            Arc::clone(self.context.backend()),
            self.vsync.notifier(surface),
        );
        self.backend().set_visible(surface, true);
        self.surfaces.insert(
            surface,
            Surface {
                pool,
                scheduler,
                visible: true,
            },
        );
        Ok(())
    }

    /// Present one frame on `surface`.
    ///
    /// Opens the surface on first use and rebuilds its buffers when the frame
    /// size changes. Blocks while every buffer is busy. A frame the backend
    /// refuses is dropped and reported as a recoverable error.
    pub fn submit_frame(
        &mut self,
        surface: SurfaceId,
        pixels: &[u8],
        width: u32,
        height: u32,
        pitch: usize,
    ) -> Result<(), PresentError> {
        if self.shut_down {
            return Err(PoolError::Released.into());
        }
        let geometry = Geometry::new(width, height, self.config.pixel_format);
        validate_frame(pixels, &geometry, pitch)?;
        self.process_events();

        match self.surfaces.get(&surface) {
            None => self.open_surface(surface, width, height)?,
            Some(entry) if entry.pool.geometry() != geometry => {
                self.resize(surface, width, height)?
            }
            Some(_) => {}
        }
        let entry = self
            .surfaces
            .get(&surface)
            .ok_or(PresentError::UnknownSurface(surface))?;

        let mut target = entry.pool.get_free_buffer()?;
        self.blitter.blit(&mut target, pixels, width, height, pitch);
        let result = entry.scheduler.submit_frame(target);

        self.process_events();
        result
    }

    /// Rebuild `surface`'s buffers at a new size.
    ///
    /// Waits up to the teardown timeout for the pending flip; a flip the
    /// backend never confirms is abandoned once the new buffers are
    /// allocated. If allocation fails the old buffers, pending flip
    /// included, are left untouched.
    pub fn resize(&mut self, surface: SurfaceId, width: u32, height: u32) -> Result<(), ResizeError> {
        let geometry = Geometry::new(width, height, self.config.pixel_format);
        if geometry.is_empty() {
            return Err(ResizeError::InvalidGeometry(geometry.to_string()));
        }
        let entry = self
            .surfaces
            .get(&surface)
            .ok_or(ResizeError::UnknownSurface(surface))?;
        let capacity = self.config.capacity_for(surface);
        if entry.pool.geometry() == geometry && entry.pool.capacity() == capacity {
            return Ok(());
        }

        let timeout = self.teardown_timeout();
        match entry.scheduler.drain(Some(timeout)) {
            Ok(()) => entry.pool.resize(geometry, capacity, self.backend())?,
            Err(err) => {
                log(LogCategory::Presenter, LogLevel::Warn, || {
                    format!("{}: resize: {}", surface, err)
                });
                entry
                    .pool
                    .resize_abandoning(geometry, capacity, self.backend())?
            }
        }
        log(LogCategory::Presenter, LogLevel::Info, || {
            format!("{}: resized to {}", surface, geometry)
        });
        Ok(())
    }

    /// Close `surface`, releasing its buffers. Closing a closed surface is a
    /// no-op.
    ///
    /// A flip still pending after the teardown timeout is reported as
    /// `TeardownTimeout`; the buffers are released regardless.
    pub fn teardown(&mut self, surface: SurfaceId) -> Result<(), PoolError> {
        let Some(entry) = self.surfaces.remove(&surface) else {
            return Ok(());
        };
        let timeout = self.teardown_timeout();
        let result = entry.pool.teardown(self.backend(), timeout);
        self.vsync.unregister(surface);
        self.backend().set_visible(surface, false);
        if let Err(err) = &result {
            log(LogCategory::Presenter, LogLevel::Warn, || {
                format!("{}: teardown: {}", surface, err)
            });
        }
        result
    }

    /// Show or hide an open surface without releasing its buffers.
    pub fn set_surface_visible(
        &mut self,
        surface: SurfaceId,
        visible: bool,
    ) -> Result<(), PresentError> {
        let entry = self
            .surfaces
            .get_mut(&surface)
            .ok_or(PresentError::UnknownSurface(surface))?;
        if entry.visible != visible {
            entry.visible = visible;
            self.context.backend().set_visible(surface, visible);
        }
        Ok(())
    }

    pub fn is_visible(&self, surface: SurfaceId) -> Option<bool> {
        self.surfaces.get(&surface).map(|entry| entry.visible)
    }

    /// Apply completions that have arrived (polled delivery only). Returns
    /// how many were handled.
    pub fn process_events(&self) -> usize {
        self.vsync.process_events()
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.surfaces.keys().copied().collect()
    }

    pub fn surface_stats(&self, surface: SurfaceId) -> Option<FrameStats> {
        self.surfaces.get(&surface).map(|entry| entry.pool.stats())
    }

    pub fn stats(&self) -> BTreeMap<SurfaceId, FrameStats> {
        self.surfaces
            .iter()
            .map(|(&id, entry)| (id, entry.pool.stats()))
            .collect()
    }

    pub fn snapshot(&self, surface: SurfaceId) -> Option<PoolSnapshot> {
        self.surfaces.get(&surface).map(|entry| entry.pool.snapshot())
    }

    /// Tear down every surface and stop the vsync dispatcher. Returns the
    /// first teardown error; every surface is released either way.
    pub fn shutdown(&mut self) -> Result<(), PoolError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let mut first_error = None;
        for surface in self.surfaces() {
            if let Err(err) = self.teardown(surface) {
                first_error.get_or_insert(err);
            }
        }
        self.vsync.shutdown();
        log(LogCategory::Presenter, LogLevel::Info, || {
            "presenter shut down".to_string()
        });
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn validate_frame(pixels: &[u8], geometry: &Geometry, pitch: usize) -> Result<(), PresentError> {
    if geometry.is_empty() {
        return Err(PresentError::InvalidFrame(format!("zero-sized frame {}", geometry)));
    }
    let row_bytes = geometry.row_bytes();
    if pitch < row_bytes {
        return Err(PresentError::InvalidFrame(format!(
            "pitch {} is shorter than a {} byte row",
            pitch, row_bytes
        )));
    }
    let needed = pitch
        .checked_mul(geometry.height as usize - 1)
        .and_then(|n| n.checked_add(row_bytes))
        .ok_or_else(|| {
            PresentError::InvalidFrame(format!("pitch {} overflows a {} frame", pitch, geometry))
        })?;
    if pixels.len() < needed {
        return Err(PresentError::InvalidFrame(format!(
            "{} needs {} bytes at pitch {}, got {}",
            geometry,
            needed,
            pitch,
            pixels.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManualBackend;
    use crate::buffer::{BufferState, WriteTarget};
    use crate::types::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn presenter(delivery: VsyncDelivery) -> (Arc<ManualBackend>, Presenter) {
        let backend = Arc::new(ManualBackend::synchronous());
        let config = PresenterConfig {
            vsync_delivery: delivery,
            ..Default::default()
        };
        let presenter = Presenter::new(BackendContext::from_arc(backend.clone()), config).unwrap();
        (backend, presenter)
    }

    fn frame(width: u32, height: u32, fill: u8) -> Vec<u8> {
        vec![fill; width as usize * height as usize * 4]
    }

    #[test]
    fn first_frame_opens_surface() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Polled);
        assert!(presenter.surfaces().is_empty());

        presenter
            .submit_frame(SurfaceId::Main, &frame(8, 8, 1), 8, 8, 32)
            .unwrap();
        assert_eq!(presenter.surfaces(), vec![SurfaceId::Main]);
        assert_eq!(presenter.snapshot(SurfaceId::Main).unwrap().capacity, 3);
        assert_eq!(backend.is_visible(SurfaceId::Main), Some(true));

        presenter
            .submit_frame(SurfaceId::Menu, &frame(4, 4, 1), 4, 4, 16)
            .unwrap();
        assert_eq!(presenter.snapshot(SurfaceId::Menu).unwrap().capacity, 2);
    }

    #[test]
    fn polled_completions_are_applied_by_submit() {
        let (_backend, mut presenter) = presenter(VsyncDelivery::Polled);
        let pixels = frame(8, 8, 0);
        for _ in 0..5 {
            presenter
                .submit_frame(SurfaceId::Main, &pixels, 8, 8, 32)
                .unwrap();
        }
        let stats = presenter.surface_stats(SurfaceId::Main).unwrap();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.presented, 5);
        let snap = presenter.snapshot(SurfaceId::Main).unwrap();
        assert_eq!(snap.count(BufferState::Current), 1);
        assert_eq!(snap.in_flight, None);
    }

    #[test]
    fn blitted_pixels_reach_backend() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Threaded);
        let mut pixels = frame(2, 2, 0);
        pixels[0] = 0x11;
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 2, 2, 8)
            .unwrap();
        let first = backend.last_checksum(SurfaceId::Main).unwrap();

        pixels[0] = 0x22;
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 2, 2, 8)
            .unwrap();
        assert_ne!(backend.last_checksum(SurfaceId::Main), Some(first));
    }

    #[test]
    fn invalid_frames_are_rejected_before_reserving() {
        let (_backend, mut presenter) = presenter(VsyncDelivery::Polled);
        let cases = [
            (frame(4, 4, 0), 0, 4, 16),
            (frame(4, 4, 0), 4, 4, 8),
            (vec![0; 20], 4, 4, 16),
        ];
        for (pixels, width, height, pitch) in cases {
            let err = presenter
                .submit_frame(SurfaceId::Main, &pixels, width, height, pitch)
                .unwrap_err();
            assert!(matches!(err, PresentError::InvalidFrame(_)), "{:?}", err);
            assert!(err.is_recoverable());
        }
        assert!(presenter.surfaces().is_empty());
    }

    #[test]
    fn oversized_pitch_is_invalid_not_a_panic() {
        let (_backend, mut presenter) = presenter(VsyncDelivery::Polled);
        let err = presenter
            .submit_frame(SurfaceId::Main, &[0; 64], 4, 3, usize::MAX)
            .unwrap_err();
        assert!(matches!(err, PresentError::InvalidFrame(_)), "{:?}", err);
        assert!(presenter.surfaces().is_empty());

        // A single row never steps by the pitch
        presenter
            .submit_frame(SurfaceId::Main, &[0; 16], 4, 1, usize::MAX)
            .unwrap();
    }

    #[test]
    fn last_row_may_omit_padding() {
        let (_backend, mut presenter) = presenter(VsyncDelivery::Polled);
        // pitch 24, row 16: three rows need 24 * 2 + 16 bytes
        let pixels = vec![0; 64];
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 3, 24)
            .unwrap();
    }

    #[test]
    fn size_change_rebuilds_pool() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Threaded);
        presenter
            .submit_frame(SurfaceId::Main, &frame(4, 4, 0), 4, 4, 16)
            .unwrap();
        presenter
            .submit_frame(SurfaceId::Main, &frame(8, 8, 0), 8, 8, 32)
            .unwrap();

        let snap = presenter.snapshot(SurfaceId::Main).unwrap();
        assert_eq!(snap.geometry, Geometry::new(8, 8, PixelFormat::Xrgb8888));
        assert_eq!(snap.generation, 1);
        assert_eq!(backend.live_buffers(), 3);
        assert_eq!(backend.released().len(), 3);
        assert_eq!(presenter.surface_stats(SurfaceId::Main).unwrap().resizes, 1);
    }

    #[test]
    fn resize_errors() {
        let (_backend, mut presenter) = presenter(VsyncDelivery::Polled);
        assert_eq!(
            presenter.resize(SurfaceId::Menu, 4, 4),
            Err(ResizeError::UnknownSurface(SurfaceId::Menu))
        );
        presenter.open_surface(SurfaceId::Menu, 4, 4).unwrap();
        assert!(matches!(
            presenter.resize(SurfaceId::Menu, 0, 4),
            Err(ResizeError::InvalidGeometry(_))
        ));
        presenter.resize(SurfaceId::Menu, 4, 4).unwrap();
        assert_eq!(presenter.snapshot(SurfaceId::Menu).unwrap().generation, 0);
    }

    #[test]
    fn rejected_frame_is_dropped_and_buffer_reused() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Polled);
        let pixels = frame(4, 4, 0);
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 4, 16)
            .unwrap();

        backend.reject_next(1);
        let err = presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 4, 16)
            .unwrap_err();
        assert!(err.is_recoverable());
        let snap = presenter.snapshot(SurfaceId::Main).unwrap();
        assert_eq!(snap.states[1], BufferState::Free);

        presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 4, 16)
            .unwrap();
        let stats = presenter.surface_stats(SurfaceId::Main).unwrap();
        assert_eq!((stats.submitted, stats.dropped), (2, 1));
        assert_eq!(presenter.snapshot(SurfaceId::Main).unwrap().current, Some(1));
    }

    #[test]
    fn failed_resize_keeps_unconfirmed_flip_in_flight() {
        let backend = Arc::new(ManualBackend::new());
        let config = PresenterConfig {
            buffer_count: 2,
            vsync_delivery: VsyncDelivery::Polled,
            teardown_timeout_ms: 10,
            ..Default::default()
        };
        let mut presenter =
            Presenter::new(BackendContext::from_arc(backend.clone()), config).unwrap();
        let pixels = frame(4, 4, 0);
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 4, 16)
            .unwrap();
        backend.complete_next();
        presenter
            .submit_frame(SurfaceId::Main, &pixels, 4, 4, 16)
            .unwrap();
        assert_eq!(backend.pending_flips(), 1);

        backend.fail_allocations_after(0);
        let err = presenter.resize(SurfaceId::Main, 8, 4).unwrap_err();
        assert!(matches!(err, ResizeError::Pool(PoolError::Allocation(_))));

        let snap = presenter.snapshot(SurfaceId::Main).unwrap();
        assert_eq!(snap.states, vec![BufferState::Current, BufferState::InFlight]);
        assert_eq!(snap.in_flight, Some(1));

        // The late completion still lands on the buffer it was issued for
        assert!(backend.complete_next().is_some());
        presenter.process_events();
        let snap = presenter.snapshot(SurfaceId::Main).unwrap();
        assert_eq!(snap.current, Some(1));
        assert_eq!(snap.states[0], BufferState::Free);
    }

    #[test]
    fn visibility_is_forwarded() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Polled);
        assert!(matches!(
            presenter.set_surface_visible(SurfaceId::Menu, false),
            Err(PresentError::UnknownSurface(SurfaceId::Menu))
        ));
        presenter.open_surface(SurfaceId::Menu, 2, 2).unwrap();
        presenter
            .set_surface_visible(SurfaceId::Menu, false)
            .unwrap();
        assert_eq!(presenter.is_visible(SurfaceId::Menu), Some(false));
        assert_eq!(backend.is_visible(SurfaceId::Menu), Some(false));
    }

    #[test]
    fn teardown_is_idempotent() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Threaded);
        presenter
            .submit_frame(SurfaceId::Main, &frame(4, 4, 0), 4, 4, 16)
            .unwrap();
        presenter.teardown(SurfaceId::Main).unwrap();
        presenter.teardown(SurfaceId::Main).unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert!(presenter.surfaces().is_empty());
    }

    #[test]
    fn teardown_times_out_on_lost_completion() {
        let backend = Arc::new(ManualBackend::new());
        let config = PresenterConfig {
            teardown_timeout_ms: 20,
            ..Default::default()
        };
        let mut presenter =
            Presenter::new(BackendContext::from_arc(backend.clone()), config).unwrap();
        presenter
            .submit_frame(SurfaceId::Main, &frame(4, 4, 0), 4, 4, 16)
            .unwrap();

        assert_eq!(
            presenter.teardown(SurfaceId::Main),
            Err(PoolError::TeardownTimeout(Duration::from_millis(20)))
        );
        assert_eq!(backend.live_buffers(), 0);
        // Completion arrives after the surface is gone
        assert!(backend.complete_next().is_some());
    }

    #[test]
    fn custom_blitter_is_used() {
        let backend = Arc::new(ManualBackend::synchronous());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut presenter = Presenter::new(
            BackendContext::from_arc(backend),
            PresenterConfig::default(),
        )
        .unwrap()
        .with_blitter(
            move |dst: &mut WriteTarget, _: &[u8], _: u32, _: u32, _: usize| {
                dst.pixels_mut().fill(0xFF);
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        presenter
            .submit_frame(SurfaceId::Main, &frame(2, 2, 0), 2, 2, 8)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_releases_everything_once() {
        let (backend, mut presenter) = presenter(VsyncDelivery::Threaded);
        presenter.open_surface(SurfaceId::Main, 4, 4).unwrap();
        presenter.open_surface(SurfaceId::Menu, 4, 4).unwrap();
        assert_eq!(backend.live_buffers(), 5);

        presenter.shutdown().unwrap();
        presenter.shutdown().unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert!(matches!(
            presenter.submit_frame(SurfaceId::Main, &frame(4, 4, 0), 4, 4, 16),
            Err(PresentError::Pool(PoolError::Released))
        ));
    }
}
