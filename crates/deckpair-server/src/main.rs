//! deckpair server: entry point.
//!
//! Listens for device peers on a local WebSocket port, pairs them, and
//! relays sealed application messages between them and the host process
//! driving this binary over stdio (see `infrastructure::stdio_relay`).
//!
//! # Usage
//!
//! ```text
//! deckpair-server [OPTIONS]
//!
//! Options:
//!   --bind <IP>                 Listener IP [default: 127.0.0.1]
//!   --port <PORT>               Listener port [default: 9119]
//!   --challenge-timeout <SECS>  Time to answer a challenge [default: 60]
//!   --max-attempts <N>          Failed responses before closing [default: 3]
//!   --queue-capacity <N>        Outbound frames buffered per session [default: 64]
//!   --key-file <PATH>           Paired key store [default: platform config dir]
//!   --ephemeral                 Keep paired keys in memory only
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                      | Default     |
//! |-------------------------------|-------------|
//! | `DECKPAIR_BIND`               | `127.0.0.1` |
//! | `DECKPAIR_PORT`               | `9119`      |
//! | `DECKPAIR_CHALLENGE_TIMEOUT`  | `60`        |
//! | `DECKPAIR_MAX_ATTEMPTS`       | `3`         |
//! | `DECKPAIR_QUEUE_CAPACITY`     | `64`        |
//! | `DECKPAIR_KEY_FILE`           | see above   |
//!
//! Logs go to stderr; `RUST_LOG` controls the level.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deckpair_server::application::ChannelHost;
use deckpair_server::domain::config::{DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_PORT};
use deckpair_server::domain::ServerConfig;
use deckpair_server::infrastructure::{
    default_key_file_path, run_stdio_relay, DeckpairServer, ServerError,
};

/// Exit status when another instance already holds the port.
const EXIT_ALREADY_RUNNING: i32 = 2;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Pairing and encrypted relay server for hardware control surfaces.
#[derive(Debug, Parser)]
#[command(
    name = "deckpair-server",
    about = "Pairs device peers over WebSocket and relays sealed messages",
    version
)]
struct Cli {
    /// IP address to bind the WebSocket listener to.
    #[arg(long, default_value = "127.0.0.1", env = "DECKPAIR_BIND")]
    bind: String,

    /// TCP port for the WebSocket listener.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "DECKPAIR_PORT")]
    port: u16,

    /// Seconds a peer has to answer a pairing challenge.
    #[arg(long, default_value_t = 60, env = "DECKPAIR_CHALLENGE_TIMEOUT")]
    challenge_timeout: u64,

    /// Failed challenge responses tolerated before the connection is closed.
    #[arg(long, default_value_t = 3, env = "DECKPAIR_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Outbound frames buffered per session before broadcasts are skipped.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_QUEUE_CAPACITY, env = "DECKPAIR_QUEUE_CAPACITY")]
    queue_capacity: usize,

    /// Path of the paired key store.
    #[arg(long, env = "DECKPAIR_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Do not read or write a key file.
    #[arg(long, conflicts_with = "key_file")]
    ephemeral: bool,
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not a valid IP address or a limit is
    /// zero.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let bind_addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address: '{}:{}'", self.bind, self.port))?;

        if self.max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        if self.challenge_timeout == 0 {
            bail!("--challenge-timeout must be at least 1 second");
        }

        let key_file = if self.ephemeral {
            None
        } else {
            match self.key_file {
                Some(path) => Some(path),
                None => match default_key_file_path() {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!("{e}; paired keys will not be persisted");
                        None
                    }
                },
            }
        };

        Ok(ServerConfig {
            bind_addr,
            challenge_timeout: Duration::from_secs(self.challenge_timeout),
            max_attempts: self.max_attempts,
            outbound_queue_capacity: self.queue_capacity.max(1),
            key_file,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_server_config()?;
    let bind_addr = config.bind_addr;

    let (host, events) = ChannelHost::new();
    let server = match DeckpairServer::bind(config, Arc::new(host)).await {
        Ok(server) => server,
        Err(ServerError::ListenerConflict { addr }) => {
            error!("another instance is running: {addr} is already in use");
            std::process::exit(EXIT_ALREADY_RUNNING);
        }
        Err(e) => return Err(e).with_context(|| format!("failed to start server on {bind_addr}")),
    };

    info!(
        "deckpair server starting on {}, {} paired peer(s) known",
        server.local_addr(),
        server.key_store().len()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    let relay = tokio::spawn(run_stdio_relay(events, server.broadcaster()));

    server.run(running).await;
    relay.abort();

    info!("deckpair server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
