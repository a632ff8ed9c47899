//! Outbound fan-out to every paired session.

use std::sync::Arc;

use deckpair_core::protocol::seal_envelope;
use deckpair_core::{Envelope, KeyStore};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::application::registry::ConnectionRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("broadcast action must not be empty")]
    EmptyAction,
}

/// Per-recipient outcome counts of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames queued for sending.
    pub delivered: usize,
    /// Sessions still waiting for a handshake.
    pub unpaired: usize,
    /// Sessions whose key was replaced by a newer pairing.
    pub stale_key: usize,
    /// Sessions that closed before the frame could be queued.
    pub closed: usize,
    /// Sessions whose outbound queue was full.
    pub full: usize,
    /// Sessions for which sealing failed.
    pub seal_failed: usize,
}

impl BroadcastReport {
    pub fn skipped(&self) -> usize {
        self.unpaired + self.stale_key + self.closed + self.full + self.seal_failed
    }
}

/// Seals one envelope per paired session and queues it.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<KeyStore>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<KeyStore>) -> Self {
        Self { registry, store }
    }

    /// Sends `{"action": action, ...fields}` to every paired session.
    ///
    /// An `action` key inside `fields` is ignored.  Each recipient gets its
    /// own ciphertext under its own key.  A recipient that cannot take the
    /// frame is skipped and counted; it never affects the others.
    ///
    /// # Errors
    ///
    /// [`BroadcastError::EmptyAction`] if `action` is empty.  Nothing is sent.
    pub fn broadcast(
        &self,
        action: &str,
        fields: Map<String, Value>,
    ) -> Result<BroadcastReport, BroadcastError> {
        if action.is_empty() {
            return Err(BroadcastError::EmptyAction);
        }

        let envelope = Envelope::new(action, fields);
        let mut report = BroadcastReport::default();

        for handle in self.registry.snapshot() {
            let peer = handle.peer_id();

            let Some(key) = handle.current_key() else {
                report.unpaired += 1;
                continue;
            };
            if !self.store.is_current(peer.as_str(), &key) {
                debug!(%peer, session = %handle.session_id(), "skipping session with replaced key");
                report.stale_key += 1;
                continue;
            }
            if handle.is_closed() {
                report.closed += 1;
                continue;
            }

            let frame = match seal_envelope(&envelope, &key) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%peer, "could not seal broadcast: {e}");
                    report.seal_failed += 1;
                    continue;
                }
            };

            match handle.try_enqueue(frame) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(%peer, session = %handle.session_id(), "outbound queue full, broadcast skipped");
                    report.full += 1;
                }
                Err(TrySendError::Closed(_)) => report.closed += 1,
            }
        }

        debug!(
            action,
            delivered = report.delivered,
            skipped = report.skipped(),
            "broadcast"
        );
        Ok(report)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
