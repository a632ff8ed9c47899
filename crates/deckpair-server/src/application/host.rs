//! The host application seam.
//!
//! The server never interprets application messages.  Decrypted envelopes
//! and connectivity changes are handed to a [`HostBridge`], which belongs to
//! whatever embeds the server (the device plugin, the stdio relay in the
//! binary, or a test double).

use deckpair_core::Envelope;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Callbacks from connection tasks into the host application.
///
/// Implementations are called from many connection tasks at once and must
/// not block.
pub trait HostBridge: Send + Sync {
    /// A connection was accepted (`true`) or closed (`false`).
    fn notify_connectivity(&self, connected: bool);

    /// A paired peer delivered a decrypted envelope.
    ///
    /// Every delivered envelope arrives here.  Actions the host handles
    /// itself rather than applying as settings are filtered out by the
    /// implementation.
    fn apply_incoming_settings(&self, envelope: Envelope);
}

/// A host callback captured as a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent {
    Connectivity { connected: bool },
    Settings { payload: Envelope },
}

/// [`HostBridge`] that forwards every callback into an unbounded channel.
///
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            debug!("host event receiver dropped; event discarded");
        }
    }
}

impl HostBridge for ChannelHost {
    fn notify_connectivity(&self, connected: bool) {
        self.forward(HostEvent::Connectivity { connected });
    }

    fn apply_incoming_settings(&self, envelope: Envelope) {
        self.forward(HostEvent::Settings { payload: envelope });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
