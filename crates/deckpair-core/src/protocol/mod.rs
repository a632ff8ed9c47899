//! Wire representation of everything exchanged over a connection.
//!
//! Two layers:
//!
//! - [`WireFrame`] – the outer JSON object on the socket.  Its `kind` field
//!   tells handshake traffic apart from encrypted application traffic
//!   without trying to decrypt anything.
//! - [`Envelope`] – the application message carried (encrypted) inside a
//!   `sealed` frame: `{ "action": ..., ...fields }`.

pub mod envelope;
pub mod frame;

pub use envelope::{open_sealed_frame, seal_envelope, Envelope, EnvelopeError};
pub use frame::{Base64Bytes, FrameError, WireFrame};
