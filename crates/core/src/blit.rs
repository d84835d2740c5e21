//! Copy a rendered frame into a reserved display buffer.
//!
//! Format conversion and scaling live outside this crate; a presenter only
//! needs something that fills a [`WriteTarget`] from the caller's pixels.

use crate::buffer::WriteTarget;

pub trait Blitter: Send {
    /// Write `height` rows of `width` pixels from `src` (rows `pitch` bytes
    /// apart) into `dst`. The frame has already been checked against `dst`'s
    /// geometry.
    fn blit(&mut self, dst: &mut WriteTarget, src: &[u8], width: u32, height: u32, pitch: usize);

    fn name(&self) -> &str {
        "custom"
    }
}

/// Row-by-row copy with no conversion. Source and destination share a pixel
/// format; only the strides differ.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyBlitter;

impl Blitter for CopyBlitter {
    fn blit(&mut self, dst: &mut WriteTarget, src: &[u8], width: u32, height: u32, pitch: usize) {
        let row_bytes = width as usize * dst.geometry().format.bytes_per_pixel();
        for y in 0..height as usize {
            let start = y * pitch;
            let Some(row) = src.get(start..start + row_bytes) else {
                break;
            };
            dst.row_mut(y)[..row_bytes].copy_from_slice(row);
        }
    }

    fn name(&self) -> &str {
        "copy"
    }
}

impl<F> Blitter for F
where
    F: FnMut(&mut WriteTarget, &[u8], u32, u32, usize) + Send,
{
    fn blit(&mut self, dst: &mut WriteTarget, src: &[u8], width: u32, height: u32, pitch: usize) {
        self(dst, src, width, height, pitch)
    }
}
