use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phonecam::config::{self, AppConfig, ConnectionMode};
use phonecam::control::{CameraSettings, ControlCommand};
use phonecam::error::{AppError, LogReporter};
use phonecam::session::{self, Session};
use phonecam::video::Resolution;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// How to reach the phone
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the phone over the network
    Connect {
        host: IpAddr,
        port: Option<u16>,
    },
    /// Connect through an Android USB debugging forward
    Adb { port: Option<u16> },
    /// Connect to an iOS device through usbmuxd
    Ios { port: Option<u16> },
    /// Wait for the phone to connect to this machine
    Listen { port: Option<u16> },
}

/// phonecam command line arguments
#[derive(Parser, Debug)]
#[command(name = "phonecam")]
#[command(version, about = "Use a phone as webcam and microphone", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Stream audio (with --video: both; alone: audio only)
    #[arg(long)]
    audio: bool,

    /// Stream video
    #[arg(long)]
    video: bool,

    /// Disable keyboard controls
    #[arg(long)]
    no_controls: bool,

    /// Video sink device (default: first v4l2loopback device)
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Sink size for generic v4l2loopback devices
    #[arg(long, value_name = "WxH")]
    size: Option<Resolution>,

    /// Configuration file (also PHONECAM_CONFIG)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const HELP_KEYS: &str = "\
Controls:
  ?      show this help
  + =    zoom in
  -      zoom out
  a      autofocus
  l      toggle LED
  m      mirror horizontally
  v      mirror vertically
  w      next white balance
  e      toggle exposure lock
  b      battery level
  q      quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting phonecam v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match config::config_path(args.config.clone()) {
        Some(path) => config::load(&path)?,
        None => AppConfig::default(),
    };
    apply_args(&mut config, &args);
    config::validate(&config)?;

    let reporter = Arc::new(LogReporter);
    let session = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Session::start(&config, reporter)).await??
    };

    let controls = !args.no_controls && config.video.enabled;
    if controls {
        println!("{}", HELP_KEYS);
    }

    let reason = run_controls(&session, controls).await?;
    tracing::info!("Shutting down ({})", reason);

    tokio::task::spawn_blocking(move || {
        session.stop();
        session.join();
    })
    .await?;

    tracing::info!("phonecam stopped");
    Ok(())
}

/// Command line values override the configuration file
fn apply_args(config: &mut AppConfig, args: &CliArgs) {
    let (mode, port) = match &args.command {
        Command::Connect { host, port } => {
            config.connection.host = *host;
            (ConnectionMode::Wifi, *port)
        }
        Command::Adb { port } => (ConnectionMode::Adb, *port),
        Command::Ios { port } => (ConnectionMode::Ios, *port),
        Command::Listen { port } => (ConnectionMode::Server, *port),
    };
    config.connection.mode = mode;
    if let Some(port) = port {
        config.connection.port = port;
    }

    if args.audio || args.video {
        config.audio.enabled = args.audio;
        config.video.enabled = args.video;
    }
    if let Some(device) = &args.device {
        config.video.device = Some(device.to_string_lossy().to_string());
    }
    if let Some(size) = args.size {
        config.video.width = Some(size.width);
        config.video.height = Some(size.height);
    }
}

/// Serve keyboard controls until quit, a signal, or the session ends
async fn run_controls(session: &Session, controls: bool) -> anyhow::Result<&'static str> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = controls;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    let mut camera = CameraSettings::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok("interrupted"),
            _ = sighup.recv() => return Ok("hangup"),
            _ = ticker.tick() => {
                if session.is_finished() {
                    return Ok("session ended");
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                for key in line.chars() {
                    let cmd = match key {
                        '?' => {
                            println!("{}", HELP_KEYS);
                            None
                        }
                        'q' => return Ok("quit"),
                        '+' | '=' => Some(ControlCommand::ZoomIn),
                        '-' => Some(ControlCommand::ZoomOut),
                        'a' => Some(ControlCommand::AutoFocus),
                        'l' => Some(ControlCommand::ToggleLed),
                        'w' => {
                            match camera.cycle_white_balance(session.handle().control()) {
                                Ok(wb) => println!("White balance: {}", wb),
                                Err(e) => report_control_error(e),
                            }
                            None
                        }
                        'e' => {
                            match camera.toggle_exposure_lock(session.handle().control()) {
                                Ok(locked) => println!("Exposure lock: {}", locked),
                                Err(e) => report_control_error(e),
                            }
                            None
                        }
                        'm' => {
                            let state = session.handle().orientation().toggle_horizontal();
                            println!("Horizontal mirror: {}", state.mirror_horizontal);
                            None
                        }
                        'v' => {
                            let state = session.handle().orientation().toggle_vertical();
                            println!("Vertical mirror: {}", state.mirror_vertical);
                            None
                        }
                        'b' => {
                            show_battery(session.negotiator().clone()).await;
                            None
                        }
                        _ => None,
                    };

                    if let Some(cmd) = cmd {
                        if let Err(e) = session.handle().control().post(cmd) {
                            report_control_error(e);
                        }
                    }
                }
            }
        }
    }
}

fn report_control_error(e: AppError) {
    match e {
        AppError::ControlBusy => println!("Busy, try again"),
        e => tracing::warn!("Control failed: {}", e),
    }
}

async fn show_battery(negotiator: Arc<phonecam::connection::Negotiator>) {
    let result = tokio::task::spawn_blocking(move || session::query_battery(&negotiator)).await;
    match result {
        Ok(Ok(Some(level))) => println!("Battery: {}%", level),
        Ok(Ok(None)) => println!("Battery: -"),
        Ok(Err(e)) => tracing::warn!("Battery query failed: {}", e),
        Err(e) => tracing::warn!("Battery query task failed: {}", e),
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "phonecam=error",
        LogLevel::Warn => "phonecam=warn",
        LogLevel::Info => "phonecam=info",
        LogLevel::Verbose => "phonecam=debug",
        LogLevel::Debug => "phonecam=debug,v4l=debug",
        LogLevel::Trace => "phonecam=trace,v4l=debug",
    };

    // RUST_LOG takes priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
