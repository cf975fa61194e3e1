//! # kiln-daemon
//!
//! The Kiln mod host daemon.
//!
//! This daemon is responsible for:
//! - Discovering mods and resolving their load order
//! - Validating and compiling mod scripts
//! - Running each mod's lifecycle in the sandbox
//! - Hot-reloading mods whose files change
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       kiln-daemon                            │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Discovery   │  │  Validator   │  │   Compiler   │      │
//! │  │  + Resolver  │  │              │  │  + Artifacts │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │           ModLoader (waves, reload, unload)         │    │
//! │  └────────────────────────────────────────────────────┘    │
//! │                           │                                  │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │      Sandbox (one Lua state per execution)          │    │
//! │  └────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/kiln/config.toml`,
//! creating it with documented defaults on first start.
//!
//! ## Running
//!
//! ```bash
//! # Validate mods without running them
//! cargo run --bin kiln-daemon -- check --mods ./mods --pretty
//!
//! # Load mods and hot-reload on change
//! RUST_LOG=debug cargo run --bin kiln-daemon -- run --mods ./mods
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use kiln_daemon::commands;
use kiln_daemon::config::Config;
use kiln_daemon::logging;

#[derive(Parser, Debug)]
#[command(name = "kiln-daemon", version, about = "Kiln mod host daemon")]
struct Cli {
    /// Configuration file. Defaults to $XDG_CONFIG_HOME/kiln/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover, resolve and validate mods, then print the report as JSON.
    Check {
        /// Mod root, in priority order. Repeatable.
        #[arg(long = "mods", value_name = "DIR")]
        mods: Vec<PathBuf>,
        /// Indent the JSON output.
        #[arg(long)]
        pretty: bool,
    },
    /// Load mods and reload them as they change, until Ctrl+C.
    Run {
        /// Mod root, in priority order. Repeatable.
        #[arg(long = "mods", value_name = "DIR")]
        mods: Vec<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_default().context("Failed to load default configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    logging::init(&config.daemon.log_level)?;

    match cli.command {
        Command::Check { mods, pretty } => {
            let roots = commands::mod_roots(&config, &mods);
            let report = commands::check(&config, &roots)?;
            println!("{}", commands::render_report(&report, pretty)?);

            if report.has_errors() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Run { mods } => {
            info!("Starting kiln-daemon v{}", env!("CARGO_PKG_VERSION"));
            let roots = commands::mod_roots(&config, &mods);

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
            };
            commands::run(&config, &roots, shutdown).await?;
            info!("Daemon stopped");
        }
    }

    Ok(ExitCode::SUCCESS)
}
