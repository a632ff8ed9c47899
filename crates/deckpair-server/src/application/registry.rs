//! Registry of live connections.
//!
//! Each connection task registers a [`SessionHandle`] once its peer has been
//! identified and deregisters it when the connection ends.  The
//! [`Broadcaster`](super::Broadcaster) only ever works on a
//! [`snapshot`](ConnectionRegistry::snapshot), so a connection closing in the
//! middle of a broadcast cannot invalidate the iteration.

use std::collections::HashMap;
use std::sync::Arc;

use deckpair_core::{PeerId, SharedKey};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Outside view of one connection: where to queue frames for it and which
/// key it is currently paired with.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    peer_id: PeerId,
    outbound: mpsc::Sender<String>,
    key: watch::Receiver<Option<Arc<SharedKey>>>,
}

impl SessionHandle {
    pub fn new(
        session_id: Uuid,
        peer_id: PeerId,
        outbound: mpsc::Sender<String>,
        key: watch::Receiver<Option<Arc<SharedKey>>>,
    ) -> Self {
        Self {
            session_id,
            peer_id,
            outbound,
            key,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Key the session is paired with right now, `None` while unpaired.
    pub fn current_key(&self) -> Option<Arc<SharedKey>> {
        self.key.borrow().clone()
    }

    /// Whether the connection task has stopped reading its queue.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queues an encoded frame without waiting.
    pub fn try_enqueue(&self, frame: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.outbound.try_send(frame)
    }
}

/// All registered sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.write().insert(handle.session_id, handle);
    }

    pub fn deregister(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions.write().remove(&session_id)
    }

    /// Clones the current handles; the lock is released before returning.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
