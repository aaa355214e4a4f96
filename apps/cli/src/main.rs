//! Meshlink CLI
//!
//! Operator tooling for a Meshlink node: settings, transport list, frame
//! and route inspection.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;

use meshlink_core::{ProxyFrame, RouteEntry, RouteTable, TransportDescriptor};
use meshlink_settings::{default_settings_path, Settings};

/// Meshlink - peer-to-peer mesh tunnels
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.meshlink/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List configured transports in negotiation order
    Transports,

    /// Inspect proxy frames
    Frame {
        #[command(subcommand)]
        action: FrameAction,
    },

    /// Resolve a destination IP to the peer that owns it
    Route {
        ip: IpAddr,

        /// JSON file holding a list of routes
        #[arg(short, long)]
        routes: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a settings file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective settings
    Show,
    /// Print the settings file location
    Path,
}

#[derive(Subcommand)]
enum FrameAction {
    /// Decode one hex-encoded frame, length prefix included
    Decode { hex: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    meshlink_logging::init_logging(cli.verbose);

    let path = cli.config.clone().unwrap_or_else(default_settings_path);

    match cli.command {
        Commands::Config { action } => run_config(&path, action)?,
        Commands::Transports => list_transports(&path)?,
        Commands::Frame { action } => match action {
            FrameAction::Decode { hex } => decode_frame(&hex)?,
        },
        Commands::Route { ip, routes } => resolve_route(ip, &routes)?,
    }

    Ok(())
}

// ============================================================================
// Settings
// ============================================================================

fn run_config(path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            Settings::default()
                .save_to(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Initialized settings");
            println!("Wrote {}", path.display());
        }
        ConfigAction::Show => {
            let settings = load(path)?;
            let json = serde_json::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{}", json);
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<Settings> {
    Settings::load_or_default(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn list_transports(path: &Path) -> Result<()> {
    let settings = load(path)?;
    let mut transports: Vec<TransportDescriptor> = settings.mesh.tunnel.transports;
    if transports.is_empty() {
        println!("No transports configured");
        return Ok(());
    }
    transports.sort_by_key(|t| t.order);

    println!("{:<16} {:<6} {:<8} {:<8} {:<5} LABEL", "NAME", "ORDER", "ENABLED", "REVERSE", "SSL");
    for t in &transports {
        println!(
            "{:<16} {:<6} {:<8} {:<8} {:<5} {}",
            t.name,
            t.order,
            yes_no(!t.disabled),
            yes_no(t.reverse),
            yes_no(t.ssl),
            t.label
        );
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

// ============================================================================
// Frames and routes
// ============================================================================

fn decode_frame(input: &str) -> Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = hex::decode(&cleaned).context("Frame is not valid hex")?;
    let frame = ProxyFrame::decode(Bytes::from(raw)).context("Failed to decode frame")?;

    println!("Connect id: {}", frame.connect_id);
    println!("Step:       {:?}", frame.step);
    println!("Protocol:   {:?}", frame.protocol);
    println!("Direction:  {:?}", frame.direction);
    println!("Source:     {}", describe(frame.source));
    println!("Target:     {}", describe(frame.target));
    println!("Payload:    {} bytes", frame.data.len());
    if !frame.data.is_empty() {
        println!("            {}", hex::encode(&frame.data[..frame.data.len().min(64)]));
    }
    Ok(())
}

fn describe(addr: Option<std::net::SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

fn resolve_route(ip: IpAddr, routes: &Path) -> Result<()> {
    let content = std::fs::read_to_string(routes).with_context(|| format!("Failed to read {}", routes.display()))?;
    let entries: Vec<RouteEntry> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", routes.display()))?;

    let table = RouteTable::new();
    table.set_routes(entries);
    match table.resolve(ip) {
        Some(peer) => println!("{} -> {}", ip, peer),
        None => println!("{} -> no route", ip),
    }
    Ok(())
}
