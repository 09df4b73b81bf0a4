use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use canflash_core::protocol::{frame, parse_hex};
use canflash_core::{
    BootInfo, CanTransport, FirmwareImage, MockTransport, SerialTransport, SessionConfig,
    SimulatedDevice, UpdateSession, describe, describe_status, list_ports, spawn_update,
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod progress;

use progress::ConsoleObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "CAN bootloader firmware update tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Session configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the CAN adapter
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Adapter baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Talk to a simulated bootloader instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash a firmware image into the inactive bank
    Update {
        /// Raw firmware binary
        firmware: PathBuf,

        /// Abort the update if it runs longer than this many seconds
        #[arg(long)]
        max_duration: Option<u64>,

        /// Per-chunk retry bound
        #[arg(long)]
        retries: Option<u8>,
    },
    /// Show bank and bootloader information
    Info,
    /// Read the bootloader status
    Ping,
    /// Reset the device
    Reset,
    /// List serial ports
    Ports,
    /// Decode a raw adapter frame given as hex
    Decode {
        /// Frame bytes, e.g. "AA C2 81 07 01 00 ..."
        hex: Vec<String>,
    },
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a configuration file with default values
    Init {
        #[arg(default_value = "canflash.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match &args.command {
        Command::Ports => return print_ports(),
        Command::Decode { hex } => return decode_frame(&hex.join(" ")),
        Command::Config {
            action: ConfigAction::Init { path, force },
        } => return init_config(path, *force),
        _ => {}
    }

    let mut config = load_config(&args)?;
    if let Command::Update {
        retries: Some(r), ..
    } = &args.command
    {
        config.max_chunk_retries = *r;
    }

    if args.simulate {
        info!("Using simulated bootloader");
        let transport = Arc::new(MockTransport::with_device(SimulatedDevice::new()));
        return dispatch(transport, config, args.command);
    }

    let port = config.port.clone().ok_or_else(|| {
        let known = list_ports().unwrap_or_default();
        anyhow!(
            "No serial port given; use --port or set `port` in the config (available: {})",
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        )
    })?;
    let transport = Arc::new(
        SerialTransport::open(&port, config.baud_rate)
            .with_context(|| format!("Opening CAN adapter on {}", port))?,
    );
    dispatch(transport, config, args.command)
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    Ok(config)
}

fn dispatch<T: CanTransport + 'static>(
    transport: Arc<T>,
    config: SessionConfig,
    command: Command,
) -> Result<()> {
    let max_firmware_size = config.max_firmware_size;
    let mut session = UpdateSession::with_observer(transport, config, Arc::new(ConsoleObserver::new()));

    match command {
        Command::Update {
            firmware,
            max_duration,
            ..
        } => {
            let image = FirmwareImage::load(&firmware, max_firmware_size)
                .with_context(|| format!("Loading firmware {}", firmware.display()))?;
            info!(
                path = %firmware.display(),
                size = image.len(),
                crc = %format!("0x{:08X}", image.crc32()),
                "Firmware loaded"
            );

            let handle = spawn_update(session, image)?;
            if let Some(secs) = max_duration {
                let limit = Duration::from_secs(secs);
                let started = Instant::now();
                while !handle.is_finished() {
                    if started.elapsed() > limit {
                        warn!(seconds = secs, "Maximum duration exceeded, aborting");
                        handle.cancel();
                        break;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
            let report = handle.join()?;
            println!("{}", report);
            print_boot_info(&report.boot_info);
        }
        Command::Info => {
            let info = session.query_info()?;
            print_boot_info(&info);
        }
        Command::Ping => {
            let raw = session.ping()?;
            println!("Bootloader status: {}", describe_status(raw));
        }
        Command::Reset => {
            session.reset_device()?;
            println!("Reset sent");
        }
        Command::Ports | Command::Decode { .. } | Command::Config { .. } => {}
    }
    Ok(())
}

fn print_boot_info(info: &BootInfo) {
    println!(
        "Bootloader v{}  status: {}",
        info.bootloader_version,
        info.status_text()
    );
    for bank in &info.banks {
        let marker = if bank.index == info.active_bank { "*" } else { " " };
        println!("{} {}", marker, bank);
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn decode_frame(text: &str) -> Result<()> {
    let bytes = parse_hex(text)?;
    let msg = frame::decode(&bytes)?;
    println!("ID:      0x{:03X}", msg.id());
    println!(
        "Payload: [{}]",
        msg.payload()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    );
    match msg.kind() {
        Some(kind) => println!("Kind:    {}", kind),
        None => println!("Kind:    unknown"),
    }
    println!("Meaning: {}", describe(msg.id(), msg.payload()));
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SessionConfig::default().save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
