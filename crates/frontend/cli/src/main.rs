use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use pageflip_core::backend::VirtualDisplay;
use pageflip_core::logging::{LogConfig, LogLevel};
use pageflip_core::{
    BackendContext, PixelFormat, Presenter, PresenterConfig, SurfaceId, VsyncDelivery,
};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Push synthetic frames through a presenter on the virtual display.
#[derive(Parser)]
struct Args {
    /// Number of frames to submit
    #[arg(long, default_value_t = 120)]
    frames: u32,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Buffers per surface (overrides the config file)
    #[arg(long)]
    buffers: Option<usize>,

    /// Vsync delivery: "threaded" or "polled" (overrides the config file)
    #[arg(long)]
    delivery: Option<String>,

    /// Virtual display refresh rate
    #[arg(long, default_value_t = 60)]
    refresh_hz: u32,

    /// Make the display reject every Nth present
    #[arg(long)]
    reject_every: Option<u64>,

    /// Also drive a menu overlay every 4th frame
    #[arg(long, default_value_t = false)]
    menu: bool,

    /// Switch to double resolution at this frame
    #[arg(long)]
    resize_at: Option<u32>,

    /// Presenter settings (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write statistics as JSON to this file
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Core log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "off")]
    log_level: String,

    /// Send core logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Don't print statistics to stdout
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn parse_delivery(value: &str) -> Result<VsyncDelivery> {
    match value.to_lowercase().as_str() {
        "threaded" => Ok(VsyncDelivery::Threaded),
        "polled" => Ok(VsyncDelivery::Polled),
        other => bail!("Unsupported vsync delivery: {}", other),
    }
}

/// Diagonal gradient that scrolls one pixel per frame.
fn test_pattern(
    width: u32,
    height: u32,
    format: PixelFormat,
    frame: u32,
    tint: u8,
) -> (Vec<u8>, usize) {
    let bpp = format.bytes_per_pixel();
    let pitch = width as usize * bpp;
    let mut pixels = vec![0u8; pitch * height as usize];
    for y in 0..height {
        let row = &mut pixels[y as usize * pitch..(y as usize + 1) * pitch];
        for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
            let v = (x as u32 + y + frame) as u8;
            px.fill(v ^ tint);
        }
    }
    (pixels, pitch)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let log_config = LogConfig::global();
    match LogLevel::from_str(&args.log_level) {
        Some(level) => log_config.set_global_level(level),
        None => bail!("Unsupported log level: {}", args.log_level),
    }
    if let Some(path) = args.log_file.as_ref() {
        log_config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }

    let mut config = match args.config.as_ref() {
        Some(path) => PresenterConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PresenterConfig::default(),
    };
    if let Some(buffers) = args.buffers {
        config.buffer_count = buffers;
    }
    if let Some(delivery) = args.delivery.as_deref() {
        config.vsync_delivery = parse_delivery(delivery)?;
    }
    if args.width == 0 || args.height == 0 {
        bail!("Frame size must be non-zero, got {}x{}", args.width, args.height);
    }

    let display = Arc::new(VirtualDisplay::with_refresh_hz(args.refresh_hz)?);
    if let Some(n) = args.reject_every {
        display.reject_every(n);
    }
    let format = config.pixel_format;
    let mut presenter = Presenter::new(BackendContext::from_arc(display.clone()), config)?;
    info!(
        "presenting {} frames at {}x{} on {} Hz virtual display ({:?} delivery)",
        args.frames,
        args.width,
        args.height,
        args.refresh_hz,
        presenter.delivery()
    );

    let started = Instant::now();
    let (mut width, mut height) = (args.width, args.height);
    let mut rejected = 0u64;
    for frame in 0..args.frames {
        if args.resize_at == Some(frame) {
            width *= 2;
            height *= 2;
            info!("frame {}: switching to {}x{}", frame, width, height);
        }

        let (pixels, pitch) = test_pattern(width, height, format, frame, 0);
        let mut targets = vec![(SurfaceId::Main, pixels, width, height, pitch)];
        if args.menu && frame % 4 == 0 {
            let (mw, mh) = ((width / 2).max(1), (height / 2).max(1));
            let (menu, menu_pitch) = test_pattern(mw, mh, format, frame, 0xFF);
            targets.push((SurfaceId::Menu, menu, mw, mh, menu_pitch));
        }

        for (surface, pixels, w, h, pitch) in targets {
            match presenter.submit_frame(surface, &pixels, w, h, pitch) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    rejected += 1;
                    warn!("frame {} on {} dropped: {}", frame, surface, err);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    let elapsed = started.elapsed();
    let surfaces = presenter.stats();
    let unconfirmed: u64 = surfaces.values().map(|s| s.outstanding()).sum();

    if let Err(err) = presenter.shutdown() {
        warn!("shutdown: {}", err);
    }

    let report = serde_json::json!({
        "backend": presenter.context().name(),
        "delivery": presenter.delivery(),
        "frames": args.frames,
        "dropped_frames": rejected,
        "elapsed_ms": elapsed.as_millis() as u64,
        "vsyncs": display.vsync_count(),
        "unconfirmed_flips": unconfirmed,
        "surfaces": surfaces,
    });
    if let Some(path) = args.stats.as_ref() {
        let mut f = File::create(path)
            .with_context(|| format!("creating stats file {}", path.display()))?;
        write!(f, "{}", serde_json::to_string_pretty(&report)?)?;
    }
    if !args.quiet {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    log_config.clear_log_file();
    Ok(())
}
