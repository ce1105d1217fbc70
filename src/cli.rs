//! Command line interface.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use crate::checksum;
use crate::config::Config;
use crate::loader::{ExitReason, Image, Loader, TracingExecutor};
use crate::progress::TransferProgress;
use crate::server::{ReceiveMode, Supervisor};
use crate::storage::DirSource;
use crate::transport::{Endpoint, Link};
use crate::upload::Uploader;

/// Upload overlays to the board and run them
#[derive(Parser, Debug)]
#[command(name = "ovlink", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: <config dir>/ovlink/config.toml)
    #[arg(long, global = true, env = "OVLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload an image to the device
    Send(SendArgs),
    /// Act as the device: receive images on stdin/stdout and run them
    Serve(ServeArgs),
    /// Run an image from an image store on the emulated device
    Run(RunArgs),
    /// Prepend an overlay header to a raw binary
    Pack(PackArgs),
    /// Print the CRC-32 of a file
    Checksum {
        file: PathBuf,
    },
    /// Print the configured memory layout
    Layout {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct SendArgs {
    pub image: PathBuf,

    /// Serial device or tcp://host:port (overrides the config file)
    #[arg(short, long, conflicts_with = "local")]
    pub port: Option<String>,

    /// Spawn the built-in emulator instead of opening a port
    #[arg(long)]
    pub local: bool,

    /// Whole-session retries on recoverable failures
    #[arg(short, long)]
    pub retries: Option<u32>,

    /// Print the transfer report as JSON
    #[arg(long)]
    pub json: bool,

    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Exit after the first session
    #[arg(long)]
    pub once: bool,

    /// Receive into a holding buffer instead of the code window
    #[arg(long)]
    pub staged: bool,

    /// Image store directory
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Run this stored image before serving
    #[arg(long, requires = "store")]
    pub boot: Option<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub name: String,

    #[arg(long)]
    pub store: PathBuf,
}

#[derive(Args, Debug)]
pub struct PackArgs {
    pub raw: PathBuf,
    pub out: PathBuf,

    /// Entry offset into the raw binary
    #[arg(long, default_value_t = 0, value_parser = parse_u32)]
    pub entry: u32,

    #[arg(long, default_value_t = 0, value_parser = parse_u32)]
    pub bss_start: u32,

    #[arg(long, default_value_t = 0, value_parser = parse_u32)]
    pub bss_end: u32,
}

/// Decimal or `0x` hex.
fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

impl Cli {
    /// Whether the command runs the device emulator.
    pub fn is_device(&self) -> bool {
        matches!(self.command, Command::Serve(_) | Command::Run(_))
    }
}

/// Log to stderr; `RUST_LOG` wins over the flags.
pub fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ovlink={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Send(args) => send(&config, cli.config.as_deref(), args).await,
        Command::Serve(args) => serve(&config, args).await,
        Command::Run(args) => run_stored(&config, args).await,
        Command::Pack(args) => pack(args).await,
        Command::Checksum { file } => print_checksum(&file).await,
        Command::Layout { json } => print_layout(&config, json),
    }
}

async fn send(config: &Config, config_path: Option<&Path>, args: SendArgs) -> Result<()> {
    let endpoint = if args.local {
        Endpoint::Local
    } else {
        args.port
            .as_deref()
            .or(config.link.port.as_deref())
            .context("No port given; use --port, --local or set link.port in the config")?
            .parse()?
    };

    let image = Uploader::read_image(&args.image).await?;
    let uploader = Uploader::new(
        config.sender_config(),
        args.retries.unwrap_or(config.link.retries),
    );
    let progress = TransferProgress::new(!args.no_progress && !args.json);
    tracing::debug!(len = image.len(), retries = uploader.retries(), "image loaded");

    if !args.json {
        println!(
            "{} {} ({} bytes) to {}",
            "Sending".bold().cyan(),
            args.image.display(),
            image.len(),
            endpoint
        );
    }

    let mut link = Link::open(&endpoint, config_path).await?;
    let (reader, writer) = link.split();
    let result = uploader.upload(reader, writer, &image, &progress).await;
    link.close().await?;
    let report = result.with_context(|| format!("Upload of {} failed", args.image.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {} bytes in {} block(s), crc {}, {} attempt(s), {:.1} KiB/s",
            "Verified".bold().green(),
            report.bytes,
            report.blocks,
            format!("{:#010x}", report.sent_checksum).yellow(),
            report.attempts,
            report.rate() / 1024.0
        );
    }
    Ok(())
}

fn build_supervisor(config: &Config, mode: ReceiveMode) -> Result<Supervisor<TracingExecutor>> {
    let layout = config.layout.plan().context("Invalid memory layout")?;
    let window = layout.overlay_window()?;
    let loader = Loader::new(TracingExecutor, config.loader_config());
    Ok(Supervisor::new(
        layout,
        config.receiver_config(&window),
        loader,
        mode,
    )?)
}

async fn serve(config: &Config, args: ServeArgs) -> Result<()> {
    let mode = if args.staged || config.device.staged {
        ReceiveMode::Staged
    } else {
        ReceiveMode::Direct
    };
    let mut supervisor = build_supervisor(config, mode)?;
    tracing::info!(
        mode = ?supervisor.mode(),
        code = %format!("{:#010x}", supervisor.window().code.base),
        capacity = supervisor.window().capacity(),
        regions = supervisor.layout().regions().len(),
        "device ready"
    );

    if let Some(store) = &args.store {
        let source = DirSource::new(store);
        let images = source
            .list()
            .await
            .with_context(|| format!("Failed to list image store {}", source.root().display()))?;
        tracing::info!(store = %source.root().display(), ?images, "image store");

        if let Some(name) = &args.boot {
            let exit = supervisor.run_stored(&source, name).await?;
            tracing::info!(name = name.as_str(), "boot image {exit}");
        }
    }

    let stats = supervisor.serve_stdio(args.once).await?;
    tracing::info!(
        sessions = stats.sessions,
        launched = stats.launched,
        failed = stats.failed,
        "serve finished"
    );
    Ok(())
}

async fn run_stored(config: &Config, args: RunArgs) -> Result<()> {
    let mut supervisor = build_supervisor(config, ReceiveMode::Staged)?;
    let exit = supervisor
        .run_stored(&DirSource::new(&args.store), &args.name)
        .await?;
    match exit {
        ExitReason::Returned { .. } => println!("{} {}: {exit}", "Ran".bold().green(), args.name),
        _ => anyhow::bail!("{}: {exit}", args.name),
    }
    Ok(())
}

async fn pack(args: PackArgs) -> Result<()> {
    let raw = tokio::fs::read(&args.raw)
        .await
        .with_context(|| format!("Failed to read {}", args.raw.display()))?;
    let packed = Image::pack(&raw, args.entry, args.bss_start..args.bss_end)?;
    tokio::fs::write(&args.out, &packed)
        .await
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    println!(
        "{} {} ({} bytes, crc {:#010x})",
        "Packed".bold().green(),
        args.out.display(),
        packed.len(),
        checksum::compute(&packed)
    );
    Ok(())
}

async fn print_checksum(file: &Path) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{:#010x}  {}", checksum::compute(&data), file.display());
    Ok(())
}

fn print_layout(config: &Config, json: bool) -> Result<()> {
    let layout = config.layout.plan()?;
    if json {
        println!("{}", serde_json::to_string_pretty(layout.regions())?);
        return Ok(());
    }

    let memory = layout.memory();
    println!(
        "{} {:#010x}..{:#010x}, safety gap {:#x}",
        "Memory".bold(),
        memory.base,
        memory.end(),
        layout.safety_gap()
    );
    for region in layout.regions() {
        println!(
            "  {:<12} {:<9} {:#010x}..{:#010x} {:>8} bytes",
            region.name.cyan(),
            region.kind.to_string().yellow(),
            region.base,
            region.end(),
            region.size
        );
    }
    let window = layout.overlay_window()?;
    println!(
        "{} capacity {} bytes, stack top {:#010x}",
        "Overlay".bold(),
        window.capacity(),
        window.stack_top
    );
    Ok(())
}
