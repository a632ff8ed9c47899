//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for runtime settings.  The
//! binary builds it from CLI arguments and environment variables; tests build
//! it directly, usually starting from [`ServerConfig::default`].

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use deckpair_core::handshake::{DEFAULT_CHALLENGE_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
use deckpair_core::HandshakePolicy;

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 9119;

/// Default per-session outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// All runtime configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    ///
    /// Loopback by default: the controller runs on the same machine.
    pub bind_addr: SocketAddr,

    /// How long a peer has to answer a challenge.
    pub challenge_timeout: Duration,

    /// Failed responses tolerated per challenge before the connection is closed.
    pub max_attempts: u32,

    /// Frames that may wait in one session's outbound queue.  Broadcasts to a
    /// session whose queue is full are skipped.
    pub outbound_queue_capacity: usize,

    /// Where paired keys are persisted.  `None` keeps keys in memory only.
    pub key_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Handshake limits derived from this configuration.
    pub fn handshake_policy(&self) -> HandshakePolicy {
        HandshakePolicy {
            challenge_timeout: self.challenge_timeout,
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for ServerConfig {
    /// | Field                   | Default           |
    /// |-------------------------|-------------------|
    /// | bind_addr               | `127.0.0.1:9119`  |
    /// | challenge_timeout       | 60 seconds        |
    /// | max_attempts            | 3                 |
    /// | outbound_queue_capacity | 64                |
    /// | key_file                | none (in memory)  |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            key_file: None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
