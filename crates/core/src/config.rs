use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::pool::PoolOptions;
use crate::types::{PixelFormat, SurfaceId};
use crate::vsync::VsyncDelivery;

/// Presenter settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterConfig {
    /// Buffers per content surface (at least 2)
    pub buffer_count: usize,
    /// Buffers for the menu overlay
    pub menu_buffer_count: usize,
    pub pixel_format: PixelFormat,
    pub vsync_delivery: VsyncDelivery,
    /// Upper bound on waiting for the last flip at teardown; 0 means two
    /// refresh intervals
    pub teardown_timeout_ms: u64,
    /// Warn when a writer has been blocked this long
    pub stall_warning_ms: u64,
    /// Row stride alignment in bytes
    pub pitch_alignment: usize,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            menu_buffer_count: 2,
            pixel_format: PixelFormat::Xrgb8888,
            vsync_delivery: VsyncDelivery::Threaded,
            teardown_timeout_ms: 0,
            stall_warning_ms: 500,
            pitch_alignment: 64,
        }
    }
}

impl PresenterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.menu_buffer_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "menu_buffer_count must be at least 2, got {}",
                self.menu_buffer_count
            )));
        }
        if self.pitch_alignment > 1 && !self.pitch_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "pitch_alignment must be a power of two, got {}",
                self.pitch_alignment
            )));
        }
        if self.stall_warning_ms == 0 {
            return Err(ConfigError::Invalid("stall_warning_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Read and validate a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Like [`PresenterConfig::load`], but a missing or broken file yields the
    /// defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(err) => {
                log(LogCategory::Presenter, LogLevel::Warn, || {
                    format!(
                        "ignoring {}: {}; using default settings",
                        path.display(),
                        err
                    )
                });
                Self::default()
            }
        }
    }

    pub fn capacity_for(&self, surface: SurfaceId) -> usize {
        match surface {
            SurfaceId::Main => self.buffer_count,
            SurfaceId::Menu => self.menu_buffer_count,
        }
    }

    pub fn teardown_timeout(&self, refresh_interval: Duration) -> Duration {
        if self.teardown_timeout_ms == 0 {
            refresh_interval * 2
        } else {
            Duration::from_millis(self.teardown_timeout_ms)
        }
    }

    pub fn stall_warning(&self) -> Duration {
        Duration::from_millis(self.stall_warning_ms)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            pitch_alignment: self.pitch_alignment,
            stall_warning: self.stall_warning(),
        }
    }
}
