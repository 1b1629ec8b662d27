//! Command-line probe for the stdaudio device layer
//!
//! ```text
//! stdaudio-probe [list|tone|watch] [--simulated] [--seconds N] [--config PATH]
//! ```

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stdaudio::audio::{
    platform_backend, AudioBackend, DeviceChangeKind, DeviceMonitor, DeviceNotification,
    DeviceRegistry, DeviceRole, Direction, SimulatedBackend,
};
use stdaudio::config::ConfigManager;
use stdaudio::utils::error::AppError;
use stdaudio::utils::logging::init_logging;
use tracing::{debug, info};

const TONE_HZ: f32 = 440.0;
const TONE_GAIN: f32 = 0.2;

#[derive(Parser, Debug)]
#[command(name = "stdaudio-probe")]
#[command(about = "Inspect audio devices and device-change events", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Use the in-process simulated backend instead of the platform one
    #[arg(long, global = true)]
    simulated: bool,

    /// How long `tone` plays and `watch` listens
    #[arg(short, long, default_value_t = 3, global = true)]
    seconds: u64,

    /// Device settings file (JSON)
    #[arg(short, long, env = "STDAUDIO_CONFIG", global = true)]
    config: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// List input and output devices, marking the defaults
    List,
    /// Play a sine tone on the default output device
    Tone,
    /// Print device-change events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    if !init_logging() {
        debug!("Logging subscriber already installed");
    }

    let cli = Cli::parse();
    let result = run(&cli).await;

    if let Err(err) = &result {
        if let Some(app_err) = err.downcast_ref::<AppError>() {
            let ctx = app_err.context();
            eprintln!("{}", ctx.message);
            if let Some(hint) = ctx.recovery_hint {
                eprintln!("hint: {hint}");
            }
        }
    }
    result
}

async fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigManager::load_or_default(path).map_err(AppError::from)?,
        None => Default::default(),
    };

    let simulated = cli
        .simulated
        .then(|| Arc::new(SimulatedBackend::with_default_endpoints()));
    let backend: Arc<dyn AudioBackend> = match &simulated {
        Some(backend) => Arc::clone(backend) as Arc<dyn AudioBackend>,
        None => platform_backend().map_err(AppError::from)?,
    };

    let command = cli.command.unwrap_or(Commands::List);
    info!(backend = backend.name(), ?command, "stdaudio probe");
    let registry = DeviceRegistry::with_config(backend.clone(), config);
    let seconds = Duration::from_secs(cli.seconds);

    match command {
        Commands::List => list(&registry),
        Commands::Tone => tone(&registry, seconds),
        Commands::Watch => watch(backend, simulated, seconds).await,
    }
}

fn list(registry: &DeviceRegistry) -> Result<()> {
    for direction in [Direction::Input, Direction::Output] {
        let devices = registry.list_devices(direction).map_err(AppError::from)?;
        let default_id = registry
            .default_device(direction)
            .map_err(AppError::from)?
            .map(|device| device.id().to_string());

        println!("{direction} devices ({}):", devices.len());
        for device in &devices {
            let marker = if Some(device.id()) == default_id.as_deref() { "*" } else { " " };
            println!(
                " {marker} {} [{} ch @ {} Hz, {:?}] {}",
                device.name(),
                device.channels(),
                device.sample_rate(),
                device.mix_format().sample_format,
                device.id()
            );
        }
    }
    Ok(())
}

fn tone(registry: &DeviceRegistry, duration: Duration) -> Result<()> {
    let mut device = registry
        .default_output_device()
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::from(stdaudio::AudioError::DeviceNotFound(Direction::Output)))?;

    let mut phase = 0.0f32;
    device
        .connect(move |ctx, buffer| {
            let step = TAU * TONE_HZ / ctx.sample_rate as f32;
            for frame in buffer.frames_mut() {
                let sample = phase.sin() * TONE_GAIN;
                frame.fill(sample);
                phase = (phase + step) % TAU;
            }
        })
        .map_err(AppError::from)?;

    device
        .start_with(
            |ctx| println!("Playing {TONE_HZ} Hz on {} ({} frames/buffer)", ctx.name, ctx.buffer_frames),
            |ctx| println!("Stopped {}", ctx.name),
        )
        .map_err(AppError::from)?;

    std::thread::sleep(duration);
    device.stop();
    Ok(())
}

async fn watch(
    backend: Arc<dyn AudioBackend>,
    simulated: Option<Arc<SimulatedBackend>>,
    duration: Duration,
) -> Result<()> {
    let monitor = DeviceMonitor::new(backend);
    let mut list_rx = monitor
        .event_channel(DeviceChangeKind::ListChanged)
        .map_err(AppError::from)?;
    let mut input_rx = monitor
        .event_channel(DeviceChangeKind::DefaultInputChanged)
        .map_err(AppError::from)?;
    let mut output_rx = monitor
        .event_channel(DeviceChangeKind::DefaultOutputChanged)
        .map_err(AppError::from)?;

    println!("Watching device changes for {}s", duration.as_secs());

    if let Some(simulated) = simulated {
        // Replay a plug-in and a default switch so the watcher has something to show
        tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(200));
            let _ = simulated
                .notify_from_thread(DeviceNotification::DeviceAdded {
                    id: "sim-headset".to_string(),
                })
                .join();
            let _ = simulated
                .notify_from_thread(DeviceNotification::DefaultDeviceChanged {
                    direction: Direction::Output,
                    role: DeviceRole::Console,
                    id: Some("sim-headset".to_string()),
                })
                .join();
        });
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        let kind = tokio::select! {
            Some(kind) = list_rx.recv() => kind,
            Some(kind) = input_rx.recv() => kind,
            Some(kind) = output_rx.recv() => kind,
            _ = &mut deadline => break,
        };
        println!("device change: {kind:?}");
    }

    drop(monitor);
    Ok(())
}
