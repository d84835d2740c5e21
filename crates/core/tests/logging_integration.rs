//! Logging configuration and file output while frames are flowing.
//!
//! `LogConfig` is process-global, so everything runs in one test to keep
//! the assertions independent of test ordering.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pageflip_core::backend::ManualBackend;
use pageflip_core::logging::{log, LogCategory, LogConfig, LogLevel};
use pageflip_core::{BackendContext, Presenter, PresenterConfig, SurfaceId, VsyncDelivery};

fn check_configuration(config: &LogConfig) {
    config.reset();
    assert_eq!(config.get_global_level(), LogLevel::Off);
    assert!(!config.should_log(LogCategory::Flip, LogLevel::Error));

    config.set_global_level(LogLevel::Info);
    assert!(config.should_log(LogCategory::Pool, LogLevel::Info));
    assert!(!config.should_log(LogCategory::Pool, LogLevel::Debug));

    // A category override wins over the global level in both directions
    config.set_level(LogCategory::Flip, LogLevel::Trace);
    config.set_level(LogCategory::Vsync, LogLevel::Error);
    assert!(config.should_log(LogCategory::Flip, LogLevel::Trace));
    assert!(!config.should_log(LogCategory::Vsync, LogLevel::Warn));
    assert!(config.should_log(LogCategory::Vsync, LogLevel::Error));

    config.reset();
    for category in LogCategory::ALL {
        assert_eq!(config.get_level(category), LogLevel::Off);
    }
}

fn check_file_output(config: &LogConfig) {
    let path = std::env::temp_dir().join(format!("pageflip-log-{}.txt", std::process::id()));
    let _ = fs::remove_file(&path);

    config.set_log_file(path.clone()).unwrap();
    config.set_level(LogCategory::Pool, LogLevel::Info);
    config.set_level(LogCategory::Presenter, LogLevel::Info);

    let backend = Arc::new(ManualBackend::synchronous());
    let presenter_config = PresenterConfig {
        vsync_delivery: VsyncDelivery::Polled,
        ..Default::default()
    };
    let mut presenter =
        Presenter::new(BackendContext::from_arc(backend), presenter_config).unwrap();
    let pixels = vec![0u8; 8 * 8 * 4];
    presenter
        .submit_frame(SurfaceId::Main, &pixels, 8, 8, 32)
        .unwrap();
    presenter.shutdown().unwrap();
    log(LogCategory::Backend, LogLevel::Info, || "filtered out".to_string());

    // The writer thread appends asynchronously
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut contents = String::new();
    while Instant::now() < deadline {
        contents = fs::read_to_string(&path).unwrap_or_default();
        if contents.contains("presenter shut down") {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    config.clear_log_file();
    config.reset();
    let _ = fs::remove_file(&path);

    assert!(contents.contains("[Pool/Info] main: 3 buffers at 8x8 Xrgb8888"), "{}", contents);
    assert!(contents.contains("[Presenter/Info] presenter shut down"), "{}", contents);
    assert!(!contents.contains("filtered out"));
}

fn check_rate_limit(config: &LogConfig) {
    let previous = config.get_rate_limit();
    config.set_rate_limit(5);
    assert_eq!(config.get_rate_limit(), 5);
    config.set_level(LogCategory::Vsync, LogLevel::Trace);
    for i in 0..50 {
        log(LogCategory::Vsync, LogLevel::Trace, || format!("burst {}", i));
    }
    config.reset();
    config.set_rate_limit(previous);
    assert_eq!(config.get_rate_limit(), 60);
}

#[test]
fn logging_end_to_end() {
    let config = LogConfig::global();
    check_configuration(config);
    check_file_output(config);
    check_rate_limit(config);
}
