//! knitdisk command-line entry point.
//!
//! Wires the library's use cases to four subcommands:
//!
//! ```text
//! knitdisk
//!  ├─ convert <IMAGE> <OUTPUT_DIR> [SCALE [WIDTH]]   image → .pat file
//!  ├─ serve   <DIR> [--device D]                     every .pat in DIR from slot 901
//!  ├─ session <IMAGE> [--output-dir D] [--device D]  convert + arm one device
//!  └─ track   <PATTERN_FILE> <DISK_DIR>              .pat → KH-930 sector files
//! ```
//!
//! Settings come from the TOML config file (see
//! [`knitdisk::infrastructure::storage::config`]); flags given here override it.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use knit_core::domain::track::Track;
use knitdisk::application::convert_image::{convert_image, ConversionSettings};
use knitdisk::application::emulate_disk::DiskEmulator;
use knitdisk::application::orchestrate_session::{DeviceOpener, SessionConfig, SessionOrchestrator};
use knitdisk::infrastructure::serial::TokioSerialOpener;
use knitdisk::infrastructure::storage::config::{load_config, AppConfig};
use knitdisk::infrastructure::storage::pattern_store::{load_pattern_file, PatternStore};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Knitting machine pattern converter and floppy drive emulator.
///
/// The `#[derive(Parser)]` macro from `clap` generates the argument parser
/// from the struct fields and their `#[arg(...)]` attributes.
#[derive(Debug, Parser)]
#[command(
    name = "knitdisk",
    about = "Converts images into knitting patterns and serves them to the machine over serial",
    version
)]
struct Cli {
    /// Path to the TOML config file.  Defaults to the platform config dir.
    #[arg(long, global = true, env = "KNITDISK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert an image into a pattern file.
    Convert {
        /// Image to convert (PNG, JPEG, GIF or BMP).
        image: PathBuf,
        /// Directory that receives `<name>.pat`.
        output_dir: PathBuf,
        /// Vertical stretch factor.  Defaults to the configured value.
        scale: Option<f64>,
        /// Pattern width in stitches.  Defaults to the configured value.
        width: Option<u16>,
    },

    /// Serve every pattern file in a directory, numbered from 901.
    Serve {
        /// Directory holding `.pat` files.
        dir: PathBuf,
        /// Serial device connected to the knitting machine.
        #[arg(long, env = "KNITDISK_DEVICE")]
        device: Option<String>,
        /// Serial baud rate.
        #[arg(long, env = "KNITDISK_BAUD")]
        baud: Option<u32>,
    },

    /// Convert an image and serve it as pattern 901 until the session ends.
    Session {
        /// Image to convert.
        image: PathBuf,
        /// Directory that receives the converted pattern.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Serial device connected to the knitting machine.
        #[arg(long, env = "KNITDISK_DEVICE")]
        device: Option<String>,
    },

    /// Write a pattern file into a KH-930 track as disk sector files.
    Track {
        /// Pattern file to store.
        pattern_file: PathBuf,
        /// Directory that receives the `NN.dat` / `NN.id` sector files.
        disk_dir: PathBuf,
        /// Track number (1-based).
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=80))]
        track_number: u8,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    match cli.command {
        Command::Convert {
            image,
            output_dir,
            scale,
            width,
        } => {
            let defaults = config.converter.settings();
            let settings = ConversionSettings {
                scale: scale.unwrap_or(defaults.scale),
                machine_width: width.unwrap_or(defaults.machine_width),
            };
            run_convert(&image, &output_dir, &settings)
        }
        Command::Serve { dir, device, baud } => {
            let device = device.unwrap_or_else(|| config.serial.device.clone());
            let baud = baud.unwrap_or(config.serial.baud_rate);
            run_serve(&config, &dir, &device, baud).await
        }
        Command::Session {
            image,
            output_dir,
            device,
        } => {
            let device = device.unwrap_or_else(|| config.serial.device.clone());
            let output_dir = output_dir.unwrap_or_else(|| config.converter.output_dir.clone());
            run_session(&config, &image, output_dir, &device).await
        }
        Command::Track {
            pattern_file,
            disk_dir,
            track_number,
        } => run_track(&pattern_file, &disk_dir, track_number),
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn run_convert(image: &Path, output_dir: &Path, settings: &ConversionSettings) -> anyhow::Result<()> {
    let converted = convert_image(image, output_dir, settings)
        .with_context(|| format!("failed to convert {}", image.display()))?;
    println!(
        "{} ({}x{} stitches)",
        converted.path.display(),
        converted.grid.width(),
        converted.grid.height()
    );
    Ok(())
}

async fn run_serve(config: &AppConfig, dir: &Path, device: &str, baud: u32) -> anyhow::Result<()> {
    let store = PatternStore::scan_directory(dir)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if store.is_empty() {
        info!("no pattern files in {}; the machine will see an empty disk", dir.display());
    }
    info!(patterns = store.len(), device, baud, "serving directory");

    let port = TokioSerialOpener
        .open(device, baud)
        .with_context(|| format!("failed to open serial device {device}"))?;
    let mut emulator = DiskEmulator::new(port, store.into_shared(), config.emulator.emulator_config());

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping emulator");
                let _ = stop_tx.send(());
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let outcome = emulator.run(stop_rx).await.context("disk emulator failed")?;
    info!(?outcome, "disk emulator finished");
    Ok(())
}

async fn run_session(
    config: &AppConfig,
    image: &Path,
    output_dir: PathBuf,
    device: &str,
) -> anyhow::Result<()> {
    let orchestrator = SessionOrchestrator::new(
        TokioSerialOpener,
        SessionConfig {
            conversion: config.converter.settings(),
            emulator: config.emulator.emulator_config(),
            output_dir,
            baud_rate: config.serial.baud_rate,
        },
    );

    let armed = orchestrator
        .arm(image, device)
        .await
        .context("failed to arm session")?;
    info!(
        session = %armed.session_id,
        pattern = %armed.pattern_path.display(),
        "session armed"
    );
    println!("{}", armed.instructions);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping session");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    loop {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !running.load(Ordering::Relaxed) {
            let outcome = orchestrator.stop(device).await.context("session failed")?;
            info!(?outcome, "session stopped");
            break;
        }
        if !orchestrator.is_armed(device).await {
            let outcome = orchestrator.wait(device).await.context("session failed")?;
            info!(?outcome, "session ended");
            break;
        }
    }
    Ok(())
}

fn run_track(pattern_file: &Path, disk_dir: &Path, track_number: u8) -> anyhow::Result<()> {
    let file = load_pattern_file(pattern_file)
        .with_context(|| format!("failed to load {}", pattern_file.display()))?;

    let mut track = Track::new();
    let number = track
        .add_pattern(file.payload(), file.height(), u32::from(file.width()))
        .context("pattern does not fit in a track")?;
    track.set_selector(1).context("failed to set selector")?;

    std::fs::create_dir_all(disk_dir)
        .with_context(|| format!("failed to create {}", disk_dir.display()))?;
    for (name, contents) in track.sector_files(track_number) {
        let path = disk_dir.join(&name);
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    info!(
        pattern = number,
        track = track_number,
        free = track.free_memory(),
        "track written"
    );
    println!("stored as pattern {number} in {}", disk_dir.display());
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
