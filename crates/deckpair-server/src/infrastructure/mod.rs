//! Infrastructure layer for deckpair-server.
//!
//! All I/O lives here: the WebSocket listener and connection tasks, the key
//! file, and the stdio relay the binary uses as its host application.

pub mod key_file;
pub mod stdio_relay;
pub mod ws_server;

pub use key_file::{default_key_file_path, KeyFile, KeyFileError};
pub use stdio_relay::run_stdio_relay;
pub use ws_server::{DeckpairServer, ServerError};
