//! A single page of a flip pool.

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::types::Geometry;

/// Backend-assigned identity of a display buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

/// Occupancy of a buffer with respect to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Not shown and not queued; may be handed to a writer
    Free,
    /// Submitted for the next vsync, flip not yet confirmed
    InFlight,
    /// Being scanned out
    Current,
}

/// One drawable page. Owned by its pool; pixel storage is lent out while a
/// writer holds the matching [`WriteTarget`].
#[derive(Debug)]
pub struct Buffer {
    index: usize,
    handle: BufferHandle,
    geometry: Geometry,
    pitch: usize,
    state: BufferState,
    pixels: Option<Box<[u8]>>,
}

impl Buffer {
    pub(crate) fn new(index: usize, handle: BufferHandle, geometry: Geometry, pitch: usize) -> Self {
        Self {
            index,
            handle,
            geometry,
            pitch,
            state: BufferState::Free,
            pixels: Some(vec![0; pitch * geometry.height as usize].into_boxed_slice()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// A writer currently holds this buffer's pixels.
    pub fn is_reserved(&self) -> bool {
        self.pixels.is_none()
    }

    pub fn is_available(&self) -> bool {
        self.state == BufferState::Free && !self.is_reserved()
    }

    /// Lend the pixel storage to a writer. The state stays `Free` until the
    /// scheduler submits the buffer.
    pub fn acquire_for_write(&mut self, generation: u64) -> Result<WriteTarget, PoolError> {
        if self.state != BufferState::Free {
            return Err(PoolError::PoolExhausted);
        }
        let pixels = self.pixels.take().ok_or(PoolError::PoolExhausted)?;
        Ok(WriteTarget {
            index: self.index,
            handle: self.handle,
            geometry: self.geometry,
            pitch: self.pitch,
            generation,
            pixels,
        })
    }

    /// Take the pixels back from a writer.
    pub(crate) fn restore(&mut self, target: WriteTarget) {
        debug_assert_eq!(target.index, self.index);
        debug_assert!(self.pixels.is_none());
        self.pixels = Some(target.pixels);
    }

    pub fn mark_free(&mut self) {
        self.state = BufferState::Free;
    }

    pub(crate) fn mark_in_flight(&mut self) {
        debug_assert_eq!(self.state, BufferState::Free);
        self.state = BufferState::InFlight;
    }

    pub(crate) fn mark_current(&mut self) {
        debug_assert_eq!(self.state, BufferState::InFlight);
        self.state = BufferState::Current;
    }

    /// Pixel data as last written, unless currently on loan.
    pub fn pixels(&self) -> Option<&[u8]> {
        self.pixels.as_deref()
    }
}

/// Pixel storage of a reserved buffer, owned by the render path between
/// `get_free_buffer` and `submit_frame`.
#[derive(Debug)]
pub struct WriteTarget {
    index: usize,
    handle: BufferHandle,
    geometry: Geometry,
    pitch: usize,
    generation: u64,
    pixels: Box<[u8]>,
}

impl WriteTarget {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Row `y` including pitch padding.
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.pitch;
        &mut self.pixels[start..start + self.pitch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn buffer() -> Buffer {
        let geometry = Geometry::new(4, 2, PixelFormat::Xrgb8888);
        Buffer::new(0, BufferHandle(7), geometry, 16)
    }

    #[test]
    fn acquire_lends_pixels_once() {
        let mut buf = buffer();
        assert!(buf.is_available());

        let target = buf.acquire_for_write(1).unwrap();
        assert_eq!(target.handle(), BufferHandle(7));
        assert_eq!(target.pixels().len(), 32);
        assert_eq!(buf.state(), BufferState::Free);
        assert!(buf.is_reserved());
        assert!(!buf.is_available());

        assert_eq!(buf.acquire_for_write(1).unwrap_err(), PoolError::PoolExhausted);

        buf.restore(target);
        assert!(buf.is_available());
    }

    #[test]
    fn in_flight_and_current_are_not_writable() {
        let mut buf = buffer();
        buf.mark_in_flight();
        assert_eq!(buf.acquire_for_write(0).unwrap_err(), PoolError::PoolExhausted);

        buf.mark_current();
        assert_eq!(buf.state(), BufferState::Current);
        assert_eq!(buf.acquire_for_write(0).unwrap_err(), PoolError::PoolExhausted);

        buf.mark_free();
        assert!(buf.acquire_for_write(0).is_ok());
    }

    #[test]
    fn row_mut_respects_pitch() {
        let mut buf = buffer();
        let mut target = buf.acquire_for_write(0).unwrap();
        target.row_mut(1)[0] = 0xAB;
        assert_eq!(target.pixels()[16], 0xAB);
        assert_eq!(target.row_mut(0).len(), 16);
    }
}
