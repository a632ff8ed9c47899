//! Process-wide store of shared secrets, indexed by peer identifier.
//!
//! A [`KeyStore`] is created once at startup (empty, or pre-filled from the
//! key file) and shared by every connection behind an `Arc`.  It is only
//! ever written when a handshake completes; there is no expiry and no
//! delete.  Absence of an entry is the only "unpaired" signal.
//!
//! # Concurrency
//!
//! The map lives behind a `parking_lot::RwLock`.  Keys are stored as
//! `Arc<SharedKey>`, so `lookup` hands out a cheap clone and a concurrent
//! `store` swaps the whole `Arc` in one step: a reader sees either the old
//! key or the new one, never a mix of both.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a [`SharedKey`] in bytes.
pub const SHARED_KEY_LEN: usize = 32;

// ── PeerId ────────────────────────────────────────────────────────────────────

/// Opaque identifier a peer declares when it connects.
///
/// On the WebSocket transport this is the `Sec-WebSocket-Protocol` value.
/// It is only a lookup key: holding an identifier proves nothing until the
/// peer also proves it holds the matching key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps `id`, returning `None` for an empty or all-whitespace string.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── SharedKey ─────────────────────────────────────────────────────────────────

/// A 32-byte symmetric secret bound to one [`PeerId`].
///
/// The `Debug` impl prints a short fingerprint instead of the key bytes so a
/// stray `{:?}` in a log line cannot leak the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; SHARED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, returning `None` unless it is exactly
    /// [`SHARED_KEY_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SHARED_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.0
    }

    /// First 8 bytes of SHA-256(key), hex encoded.  Safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

// ── KeyStore ──────────────────────────────────────────────────────────────────

/// Thread-safe `PeerId -> SharedKey` map.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<PeerId, Arc<SharedKey>>>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore").field("peers", &self.len()).finish()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-filled with `entries`.  Later duplicates win.
    pub fn from_entries(entries: impl IntoIterator<Item = (PeerId, SharedKey)>) -> Self {
        let keys = entries
            .into_iter()
            .map(|(id, key)| (id, Arc::new(key)))
            .collect();
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Returns the key currently stored for `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<Arc<SharedKey>> {
        self.keys.read().get(id).cloned()
    }

    /// Stores `key` for `id`, replacing (and returning) any previous key.
    ///
    /// Sessions still holding the replaced key notice on their next message
    /// via [`KeyStore::is_current`].
    pub fn store(&self, id: PeerId, key: Arc<SharedKey>) -> Option<Arc<SharedKey>> {
        self.keys.write().insert(id, key)
    }

    /// Returns `true` if `key` is still the stored key for `id`.
    pub fn is_current(&self, id: &str, key: &SharedKey) -> bool {
        self.keys
            .read()
            .get(id)
            .is_some_and(|stored| stored.as_ref() == key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Copies every entry out of the store, sorted by identifier.
    pub fn snapshot(&self) -> Vec<(PeerId, Arc<SharedKey>)> {
        let mut entries: Vec<_> = self
            .keys
            .read()
            .iter()
            .map(|(id, key)| (id.clone(), Arc::clone(key)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
