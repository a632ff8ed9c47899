//! Application layer for deckpair-server.
//!
//! Everything the server does across connections: tracking live sessions,
//! fanning out broadcasts, and handing decrypted traffic to the host.  No
//! sockets here; the infrastructure layer owns those.

pub mod broadcaster;
pub mod host;
pub mod registry;

pub use broadcaster::{BroadcastError, BroadcastReport, Broadcaster};
pub use host::{ChannelHost, HostBridge, HostEvent};
pub use registry::{ConnectionRegistry, SessionHandle};
