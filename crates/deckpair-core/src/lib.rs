//! # deckpair-core
//!
//! Protocol library shared by the deckpair server and any Rust controller
//! that wants to talk to it.  It pairs a hardware-control surface (the
//! "device") with a companion desktop process (the "controller") and only
//! relays state once both sides hold the same secret key.
//!
//! This crate has no sockets and no async runtime.  Every piece is a plain
//! state machine or pure function, so the whole pairing flow can be driven
//! from a unit test.
//!
//! # Modules
//!
//! - **`keystore`** – `PeerId -> SharedKey` map shared by every connection.
//! - **`cipher`** – XChaCha20-Poly1305 sealing of opaque byte payloads.
//! - **`protocol`** – The wire: tagged JSON [`WireFrame`]s and the
//!   application-level [`Envelope`].
//! - **`handshake`** – Server-side challenge engine and the peer-side
//!   responder that derives the same key.
//! - **`session`** – The per-connection state machine tying it all together.
//!
//! # Flow
//!
//! ```text
//! peer connects with id ──► KeyStore.lookup(id)
//!                             ├─ hit  ──► Paired
//!                             └─ miss ──► Challenged ── challenge frame ──► peer
//!                                              ◄── response frame ──
//!                                         verify + derive key
//!                                         KeyStore.store(id, key) ──► Paired
//! ```

pub mod cipher;
pub mod handshake;
pub mod keystore;
pub mod protocol;
pub mod session;

pub use cipher::{decrypt, encrypt, CipherError};
pub use handshake::{HandshakeEngine, HandshakeError, HandshakePolicy, PeerHandshake};
pub use keystore::{KeyStore, PeerId, SharedKey, SHARED_KEY_LEN};
pub use protocol::{Envelope, FrameError, WireFrame};
pub use session::{
    ConnectOutcome, ConnectionSession, MessageOutcome, RechallengeReason, SessionError, SessionState,
};
