//! Page-flip buffer pool and presentation synchronizer.
//!
//! A [`presenter::Presenter`] owns one [`pool::BufferPool`] and one
//! [`scheduler::PresentationScheduler`] per logical output surface. The render
//! loop hands it finished frames; the display backend reports completed flips
//! through a [`vsync::VsyncNotifier`], which frees the previously scanned-out
//! page.
//!
//! ```text
//! submit_frame -> get_free_buffer -> blit -> present -> (vsync) -> complete_flip
//! ```

pub mod backend;
pub mod blit;
pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod presenter;
pub mod scheduler;
pub mod stats;
pub mod vsync;

pub mod types {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Logical output surface driven by a presenter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum SurfaceId {
        /// Emulated content
        Main,
        /// Menu / OSD overlay composited above the content
        Menu,
    }

    impl fmt::Display for SurfaceId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                SurfaceId::Main => write!(f, "main"),
                SurfaceId::Menu => write!(f, "menu"),
            }
        }
    }

    /// Pixel layout of a display buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum PixelFormat {
        Rgb565,
        #[default]
        Xrgb8888,
        Argb8888,
    }

    impl PixelFormat {
        pub fn bytes_per_pixel(self) -> usize {
            match self {
                PixelFormat::Rgb565 => 2,
                PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => 4,
            }
        }
    }

    /// Dimensions and format shared by every buffer of a pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Geometry {
        pub width: u32,
        pub height: u32,
        pub format: PixelFormat,
    }

    impl Geometry {
        pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
            Self {
                width,
                height,
                format,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.width == 0 || self.height == 0
        }

        /// Bytes of visible pixels in one row.
        pub fn row_bytes(&self) -> usize {
            self.width as usize * self.format.bytes_per_pixel()
        }

        /// Row stride rounded up to `alignment` bytes (0 or 1 means tightly packed).
        pub fn aligned_pitch(&self, alignment: usize) -> usize {
            let row = self.row_bytes();
            if alignment <= 1 {
                row
            } else {
                row.div_ceil(alignment) * alignment
            }
        }
    }

    impl fmt::Display for Geometry {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}x{} {:?}", self.width, self.height, self.format)
        }
    }
}

pub use backend::{Backend, BackendContext};
pub use buffer::{BufferHandle, BufferState, WriteTarget};
pub use config::PresenterConfig;
pub use error::{BackendError, ConfigError, PoolError, PresentError, ResizeError};
pub use pool::BufferPool;
pub use presenter::Presenter;
pub use scheduler::{FlipPhase, PresentationScheduler};
pub use types::{Geometry, PixelFormat, SurfaceId};
pub use vsync::{VsyncDelivery, VsyncNotifier};
