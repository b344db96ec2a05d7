//! polycam: synchronized multi-camera capture

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use polycam::capture::CameraConfig;
use polycam::pipeline::LoggingSink;
use polycam::{supervisor, CameraConfigs, CameraGroupController, Config};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "polycam", version, about = "Synchronized multi-camera capture")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "POLYCAM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture from a camera group
    Run {
        /// Framerate per camera; one camera per value
        #[arg(long, value_delimiter = ',', default_values_t = [30.0, 30.0])]
        fps: Vec<f64>,

        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 480)]
        height: u32,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,

        /// Record into this folder
        #[arg(long)]
        record: Option<PathBuf>,

        /// Attach a logging live relay
        #[arg(long)]
        relay: bool,
    },
    /// List capture devices for the configured backend
    Detect,
    /// Worker host entry point used by the process strategy
    #[command(hide = true)]
    CaptureWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // stdout belongs to the frame channel in worker processes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polycam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CaptureWorker => {
            tokio::task::spawn_blocking(|| {
                supervisor::run_worker_host(std::io::stdin().lock(), std::io::stdout())
            })
            .await??;
        }
        Command::Detect => {
            let config = Config::load(cli.config.as_deref())?;
            let controller = CameraGroupController::new(config);
            for device in controller.detect().await? {
                let fourcc = device
                    .fourcc
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{}\t{}\t{}", device.camera_id, fourcc, device.name);
            }
        }
        Command::Run {
            fps,
            width,
            height,
            seconds,
            record,
            relay,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            let configs: CameraConfigs = fps
                .iter()
                .enumerate()
                .map(|(i, rate)| {
                    let id = i as u32;
                    let camera = CameraConfig::new(id)
                        .with_resolution(width, height)
                        .with_framerate(*rate);
                    (id, camera)
                })
                .collect();
            run(config, configs, seconds.map(Duration::from_secs), record, relay).await?;
        }
    }
    Ok(())
}

async fn run(
    config: Config,
    configs: CameraConfigs,
    duration: Option<Duration>,
    record: Option<PathBuf>,
    relay: bool,
) -> Result<()> {
    info!("polycam launching...");
    let mut controller = CameraGroupController::new(config);
    let cameras = controller.connect(configs).await?;
    info!("Capturing from cameras {cameras:?}");

    let relay = if relay {
        Some(controller.attach_relay()?.pump(LoggingSink::default())?)
    } else {
        None
    };
    if let Some(folder) = &record {
        controller.start_recording(folder)?;
    }

    let deadline = duration.map(|d| Instant::now() + d);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(stats) = controller.stats() {
                    info!(
                        "payload {} at {:.1} fps, {} backfilled, {} relayed, {} recorded",
                        stats.last_sequence,
                        stats.framerate,
                        stats.backfilled_slots,
                        stats.relayed,
                        stats.recorded
                    );
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    if record.is_some() {
        if let Err(e) = controller.stop_recording() {
            warn!("Stopping recording: {e}");
        }
    }
    let stats = controller.stats().unwrap_or_default();
    let report = controller.close().await?;
    if let Some(handle) = relay {
        match handle.join() {
            Ok(sink) => info!("Relay received {} payloads", sink.received),
            Err(_) => warn!("Relay thread panicked"),
        }
    }

    println!("frames received   {}", stats.frames_received);
    println!("payloads emitted  {}", stats.payloads_emitted);
    println!("group framerate   {:.2}", stats.framerate);
    println!("backfilled slots  {}", stats.backfilled_slots);
    println!("missing slots     {}", stats.missing_slots);
    println!("corrupted frames  {}", stats.frames_corrupted);
    println!("recorded          {}", stats.recorded);
    println!("relayed/skipped   {}/{}", stats.relayed, stats.relay_skipped);
    println!("stopped cleanly   {:?}", report.clean);
    if !report.forced.is_empty() {
        println!("force-terminated  {:?}", report.forced);
    }
    Ok(())
}
