#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relaypipe
//!
//! Rendezvous relay and parallel file transfer for peers that cannot reach
//! each other directly.
//!
//! ## Subcommands
//!
//! - `relaypipe relay` — run the relay on `base_port .. base_port + channels`
//! - `relaypipe send --file <path> --code <phrase>` — send one file
//! - `relaypipe receive --code <phrase> [--out <dir>]` — receive one file
//!
//! ## Protocol
//!
//! | Step | Direction        | Bytes                                      |
//! |------|------------------|--------------------------------------------|
//! | 1    | relay → peer     | `who?` (64-byte frame, `:` padded)         |
//! | 2    | peer → relay     | `s.<phrase>` or `r.<phrase>`               |
//! | 3    | relay → sender   | `ok` once paired, `no` or `timeout` if not |
//! | 4    | sender → recv.   | length-prefixed JSON header + raw range    |
//! | 5    | recv. → sender   | `done`                                     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — error enums
//! frame.rs         — fixed-width control frames
//! util.rs          — path and formatting helpers
//! relay/
//!   mod.rs         — channel listeners, expiry sweep
//!   registry.rs    — code-phrase registry
//!   handler.rs     — per-connection handshake
//!   pipe.rs        — full-duplex forwarder
//! transfer/
//!   plan.rs        — byte ranges per channel
//!   types.rs       — channel header
//!   hasher.rs      — streaming SHA-256
//!   disk.rs        — free-space check
//!   client.rs      — parallel send / receive
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use relaypipe::config::Config;
use relaypipe::transfer::{StatvfsProbe, TransferSummary};
use relaypipe::util::{cli_path, format_bytes};
use relaypipe::Relay;

/// Rendezvous relay and parallel file transfer.
#[derive(Parser)]
#[command(name = "relaypipe", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Send a file through the relay.
    Send {
        /// File to send.
        #[arg(long)]
        file: String,
        /// Code phrase shared with the receiver.
        #[arg(long)]
        code: String,
        /// Relay host (overrides config).
        #[arg(long)]
        server: Option<String>,
        /// Parallel channels (overrides config; must match the receiver).
        #[arg(long)]
        workers: Option<u16>,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Receive a file through the relay.
    Receive {
        /// Code phrase shared with the sender.
        #[arg(long)]
        code: String,
        /// Output directory (default: current directory).
        #[arg(long, default_value = ".")]
        out: String,
        /// Relay host (overrides config).
        #[arg(long)]
        server: Option<String>,
        /// Parallel channels (overrides config; must match the sender).
        #[arg(long)]
        workers: Option<u16>,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Relay { config }
        | Commands::Send { config, .. }
        | Commands::Receive { config, .. } => config.clone(),
    };
    let mut config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("relaypipe: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        Commands::Relay { .. } => run_relay(config).await,
        Commands::Send {
            file,
            code,
            server,
            workers,
            ..
        } => {
            apply_client_overrides(&mut config, server, workers);
            let path = cli_path(&file);
            report(relaypipe::send_file(&config.client, &path, &code).await)
        }
        Commands::Receive {
            code,
            out,
            server,
            workers,
            ..
        } => {
            apply_client_overrides(&mut config, server, workers);
            let out_dir = cli_path(&out);
            report(
                relaypipe::receive_file(&config.client, &code, &out_dir, Arc::new(StatvfsProbe))
                    .await,
            )
        }
    }
}

fn apply_client_overrides(config: &mut Config, server: Option<String>, workers: Option<u16>) {
    if let Some(server) = server {
        config.client.server = server;
    }
    if let Some(workers) = workers {
        config.client.workers = workers;
    }
}

fn report(result: Result<TransferSummary, relaypipe::TransferError>) -> ExitCode {
    match result {
        Ok(summary) => {
            info!(
                filename = %summary.filename,
                path = %summary.path.display(),
                size = %format_bytes(summary.file_size),
                sha256 = %summary.file_hash,
                workers = summary.workers,
                elapsed = ?summary.elapsed,
                "Transfer complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Transfer failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_relay(config: Config) -> ExitCode {
    info!("relaypipe v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Relay on {}:{} ({} channels)",
        config.relay.host, config.relay.base_port, config.relay.channels
    );

    let relay = Relay::new(config.relay);
    match relay.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Relay failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
