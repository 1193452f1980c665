use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stdfu_core::{DfuSession, FirmwareImage, SessionConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "STM32 USB DFU Tool (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// USB vendor ID (e.g. 0x0483)
    #[arg(long, global = true, value_parser = parse_u16)]
    vid: Option<u16>,

    /// USB product ID (e.g. 0xdf11)
    #[arg(long, global = true, value_parser = parse_u16)]
    pid: Option<u16>,

    /// Flash base address
    #[arg(long, global = true, value_parser = parse_u32)]
    base: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the device status
    Status,
    /// Mass erase the flash
    Erase,
    /// Write and verify an image without erasing
    Write {
        /// Raw binary image
        image: PathBuf,
    },
    /// Mass erase, then write and verify an image
    Flash {
        /// Raw binary image
        image: PathBuf,
    },
    /// Read flash to a file, or dump it as hex
    Read {
        /// Number of bytes to read (defaults to the configured flash size)
        #[arg(long, value_parser = parse_u32)]
        size: Option<u32>,

        /// Output file; hex dump to the log when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Return the device to dfuIDLE
    Abort,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u32(s)?;
    u16::try_from(value).map_err(|_| format!("'{}' does not fit in 16 bits", s))
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }
    if let Some(base) = args.base {
        config.flash_base = base;
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let session = DfuSession::open(config)?;
    let base = session.config().flash_base;

    match args.command {
        Cmd::Status => {
            let status = session.status()?;
            println!("{}", status);
        }
        Cmd::Erase => session.erase()?,
        Cmd::Write { image } => {
            let firmware = FirmwareImage::open(&image)
                .with_context(|| format!("Failed to open {}", image.display()))?;
            let summary = session.write(firmware)?;
            info!(blocks = summary.blocks, bytes = summary.bytes, "Write complete");
        }
        Cmd::Flash { image } => {
            let firmware = FirmwareImage::open(&image)
                .with_context(|| format!("Failed to open {}", image.display()))?;
            session.flash(firmware)?;
        }
        Cmd::Read { size, out } => {
            let size = size.unwrap_or(session.config().flash_size);
            match out {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let n = session.read_to(size, base, &mut BufWriter::new(file))?;
                    info!(bytes = n, path = %path.display(), "Read complete");
                }
                None => {
                    session.dump(size, base)?;
                }
            }
        }
        Cmd::Abort => session.abort()?,
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    info!("Starting STDFU Tool (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
