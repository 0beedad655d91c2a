use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use trivium_lib::frame::{TelemetryDecoder, adjust_intensity};
use trivium_lib::{
    Command, ControllerBuilder, ControllerHandle, DeviceTarget, EngineConfig, Event, EventReceiver, JsonLinesRecorder,
    Patient, SimulatedDevice, SlotId, TcpConnector,
};

/// Drive up to two stimulation devices over serial-over-TCP bridges.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Connect to the devices and run one session on each
    Run(RunArgs),
    /// Print the bytes of a command frame as hex
    Encode {
        #[command(subcommand)]
        frame: EncodeCmd,
    },
    /// Decode telemetry bytes given as hex
    Decode {
        /// Raw bytes received from a device, e.g. "0384 0000"
        hex: String,
    },
    /// Serve a simulated device on a TCP port
    Simulate {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7001")]
        listen: String,
        /// Battery reading reported to the host
        #[arg(long, default_value_t = 900)]
        battery: u16,
    },
}

#[derive(Subcommand, Debug)]
enum EncodeCmd {
    Start {
        #[arg(short, long)]
        intensity: u8,
        #[arg(short, long)]
        duration: u8,
    },
    Stop,
    Battery,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// `host:port` of the bridge for device 1
    #[arg(long)]
    device1: Option<String>,
    /// `host:port` of the bridge for device 2
    #[arg(long)]
    device2: Option<String>,
    /// Device name shown in labels and session records
    #[arg(long, default_value = "TRIVIUM")]
    name: String,
    /// Stimulation intensity
    #[arg(short, long, default_value_t = 5)]
    intensity: u8,
    /// Raise (positive) or lower (negative) the intensity one step at a time, clamped to the device range
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    step: i8,
    /// Session length in minutes
    #[arg(short, long, default_value_t = 20)]
    duration: u8,
    /// Append a JSON record per session to this file
    #[arg(long)]
    record: Option<PathBuf>,
    /// Patient id stored with session records
    #[arg(long, requires = "record")]
    patient_id: Option<i64>,
    /// Patient document stored with session records
    #[arg(long, default_value = "")]
    patient_document: String,
    /// Engine timings as JSON; missing keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the pause after each byte of a start frame
    #[arg(long)]
    byte_delay_ms: Option<u64>,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv; RUST_LOG still wins
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let result = match cli.command {
        Cmd::Run(args) => run_sessions(args).await,
        Cmd::Encode { frame } => encode(frame),
        Cmd::Decode { hex } => decode(&hex),
        Cmd::Simulate { listen, battery } => simulate(&listen, battery).await,
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

fn encode(frame: EncodeCmd) -> Result<()> {
    let command = match frame {
        EncodeCmd::Start { intensity, duration } => Command::Start {
            intensity,
            duration_min: duration,
        },
        EncodeCmd::Stop => Command::Stop,
        EncodeCmd::Battery => Command::BatteryRequest,
    };
    let bytes = command.to_bytes()?;
    println!("{}", hex::encode(&bytes));
    Ok(())
}

fn decode(input: &str) -> Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("Not a hex string: {input}"))?;

    let mut decoder = TelemetryDecoder::new();
    decoder.push(&bytes);
    let mut found = false;
    while let Some(sample) = decoder.next_sample() {
        println!("{}", serde_json::to_string(&sample)?);
        found = true;
    }
    if !found {
        warn!(pending = decoder.pending(), "No complete telemetry frame in input");
    }
    Ok(())
}

async fn simulate(listen: &str, battery: u16) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    let device = SimulatedDevice::new(battery);
    info!(%listen, battery, "Simulated device ready");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "Host connected");
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = device.run(stream).await {
                warn!(%peer, "Connection ended with error: {e}");
            }
        });
    }
}

fn engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(delay) = args.byte_delay_ms {
        config.byte_delay_ms = delay;
    }
    Ok(config)
}

async fn run_sessions(args: RunArgs) -> Result<()> {
    let targets: Vec<(SlotId, DeviceTarget)> = [(SlotId::One, &args.device1), (SlotId::Two, &args.device2)]
        .into_iter()
        .filter_map(|(slot, address)| address.as_ref().map(|a| (slot, DeviceTarget::new(a, &args.name))))
        .collect();
    if targets.is_empty() {
        bail!("Give at least one of --device1 / --device2");
    }

    let intensity = adjust_intensity(args.intensity, args.step);
    let config = engine_config(&args)?;
    info!(?config, intensity, duration = args.duration, "Starting controller");

    let mut builder = ControllerBuilder::new(TcpConnector::default()).config(config);
    if let Some(path) = &args.record {
        let recorder = JsonLinesRecorder::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        info!(path = %recorder.path().display(), "Recording sessions");
        builder = builder.recorder(recorder);
    }
    let (handle, mut events) = builder.spawn();

    for (slot, target) in &targets {
        if let Some(id) = args.patient_id {
            handle
                .assign_patient(
                    *slot,
                    Patient {
                        id,
                        document_id: args.patient_document.clone(),
                        name: String::new(),
                    },
                )
                .await?;
        }
        handle.connect(*slot, target.clone()).await?;
    }

    let slots: Vec<SlotId> = targets.iter().map(|(slot, _)| *slot).collect();
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };
    drive_sessions(&handle, &mut events, &slots, intensity, args.duration, interrupted).await
}

/// Start a session on every slot that connects, print events until all are
/// done or `interrupted` resolves, then stop each slot once and shut down.
async fn drive_sessions(
    handle: &ControllerHandle,
    events: &mut EventReceiver,
    slots: &[SlotId],
    intensity: u8,
    duration: u8,
    interrupted: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(interrupted);
    let mut active = slots.len();
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut interrupted => {
                info!("Interrupted, stopping sessions");
                break;
            }
        };

        println!("{}", serde_json::to_string(&event)?);

        match event {
            Event::DeviceConnected { slot, .. } => {
                if let Err(e) = handle.start(slot, intensity, duration).await {
                    warn!(slot = %slot, "Session not started: {e}");
                    active = active.saturating_sub(1);
                }
            }
            Event::ConnectionFailed { .. } | Event::SessionEnded { .. } | Event::DeviceDisconnected { .. } => {
                active = active.saturating_sub(1);
            }
            _ => {}
        }

        if active == 0 {
            break;
        }
    }

    for slot in slots {
        handle.stop(*slot).await?;
    }
    handle.shutdown().await?;
    Ok(())
}
