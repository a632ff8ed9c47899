//! Domain layer for deckpair-server.
//!
//! Plain types with no I/O.  The pairing protocol itself lives in
//! `deckpair-core`; this layer only holds what is specific to running it as
//! a server.

pub mod config;

pub use config::ServerConfig;
