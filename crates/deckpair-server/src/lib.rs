//! deckpair-server library crate.
//!
//! Accepts WebSocket connections from device peers, pairs each one through
//! the `deckpair-core` handshake, and relays sealed application messages
//! between paired peers and a host application.
//!
//! # Architecture
//!
//! ```text
//! Device peers (sealed JSON frames over WebSocket)
//!         ↕
//! [deckpair-server]
//!   ├── domain/           ServerConfig
//!   ├── application/      ConnectionRegistry, Broadcaster, HostBridge
//!   └── infrastructure/
//!         ├── ws_server/   accept loop + one task per connection
//!         ├── key_file/    TOML persistence of paired keys
//!         └── stdio_relay/ host events out, broadcasts in
//!         ↕
//! Host application (HostBridge callbacks / Broadcaster::broadcast)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `deckpair-core`; it uses tokio
//!   channels but never touches a socket.
//! - `infrastructure` depends on everything else plus `tokio-tungstenite`.

/// Domain layer: configuration.
pub mod domain;

/// Application layer: session registry, broadcast, host seam.
pub mod application;

/// Infrastructure layer: WebSocket server, key file, stdio relay.
pub mod infrastructure;
