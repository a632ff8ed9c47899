//! Pairing handshake: trust-on-first-use key agreement.
//!
//! # Exchange
//!
//! ```text
//! Server (HandshakeEngine)                     Peer (PeerHandshake)
//! ────────────────────────                     ────────────────────
//! challenge c ← random(32)
//! (s, S) ← X25519 keypair
//!                ── challenge { c, S } ──►
//!                                              (p, P) ← X25519 keypair
//!                                              K ← HKDF(c, X25519(p, S), id)
//!                ◄── response { c, P, seal_K(c) } ──
//! K ← HKDF(c, X25519(s, P), id)
//! open_K(proof) == c  ?  Paired(K)
//! ```
//!
//! The first frame travels in clear, so this does not defend against an
//! active attacker present during the very first pairing.  It does
//! guarantee that only a party that took part in the exchange can read or
//! produce traffic afterwards, and that the key is bound to the identifier
//! and to this specific challenge.

pub mod engine;
pub mod peer;

use std::time::Duration;

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::cipher::CipherError;
use crate::keystore::{PeerId, SharedKey, SHARED_KEY_LEN};

pub use engine::HandshakeEngine;
pub use peer::PeerHandshake;

/// Length of the random challenge.
pub const CHALLENGE_LEN: usize = 32;

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// HKDF `info` prefix.  The peer identifier is appended after a NUL byte.
const KEY_INFO: &[u8] = b"deckpair/shared-key/v1";

/// Default time a peer has to answer a challenge.
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of failed responses tolerated per challenge.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Limits applied to every outstanding challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// How long a challenge stays answerable.
    pub challenge_timeout: Duration,
    /// Failed responses allowed before the connection is rejected.
    pub max_attempts: u32,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Errors raised while issuing, answering, or verifying a challenge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no challenge is outstanding")]
    NoPendingChallenge,

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("response echoes a different challenge")]
    ChallengeMismatch,

    #[error("challenge has invalid length {len}")]
    InvalidChallenge { len: usize },

    #[error("public key has invalid length {len}")]
    InvalidPublicKey { len: usize },

    /// The peer sent a low-order point, which would make the shared secret
    /// predictable.
    #[error("key exchange was not contributory")]
    NonContributory,

    #[error("proof does not verify under the derived key")]
    InvalidProof,

    #[error("too many failed responses ({attempts})")]
    TooManyAttempts { attempts: u32 },

    #[error("expected a challenge frame, got `{0}`")]
    UnexpectedFrame(&'static str),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("could not seal proof: {0}")]
    Cipher(#[from] CipherError),
}

impl HandshakeError {
    /// Whether this error ends the pairing attempt for the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakeError::ChallengeExpired | HandshakeError::TooManyAttempts { .. }
        )
    }
}

/// Derives the shared key both sides compute from the X25519 output.
///
/// `HKDF-SHA256(salt = challenge, ikm = dh, info = KEY_INFO ‖ 0x00 ‖ id)`
pub(crate) fn derive_shared_key(
    dh: &[u8; 32],
    challenge: &[u8],
    peer_id: &PeerId,
) -> Result<SharedKey, HandshakeError> {
    let hk = Hkdf::<Sha256>::new(Some(challenge), dh);

    let mut info = Vec::with_capacity(KEY_INFO.len() + 1 + peer_id.as_str().len());
    info.extend_from_slice(KEY_INFO);
    info.push(0);
    info.extend_from_slice(peer_id.as_str().as_bytes());

    let mut okm = [0u8; SHARED_KEY_LEN];
    hk.expand(&info, &mut okm)
        .map_err(|_| HandshakeError::KeyDerivation)?;
    Ok(SharedKey::from_bytes(okm))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_shared_key(&[1; 32], &[2; 32], &peer("dev")).unwrap();
        let b = derive_shared_key(&[1; 32], &[2; 32], &peer("dev")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derivation_binds_peer_id() {
        let a = derive_shared_key(&[1; 32], &[2; 32], &peer("dev-a")).unwrap();
        let b = derive_shared_key(&[1; 32], &[2; 32], &peer("dev-b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derivation_binds_challenge() {
        let a = derive_shared_key(&[1; 32], &[2; 32], &peer("dev")).unwrap();
        let b = derive_shared_key(&[1; 32], &[3; 32], &peer("dev")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_only_expiry_and_attempt_limit_are_terminal() {
        assert!(HandshakeError::ChallengeExpired.is_terminal());
        assert!(HandshakeError::TooManyAttempts { attempts: 3 }.is_terminal());
        assert!(!HandshakeError::InvalidProof.is_terminal());
        assert!(!HandshakeError::ChallengeMismatch.is_terminal());
    }

    #[test]
    fn test_default_policy() {
        let policy = HandshakePolicy::default();
        assert_eq!(policy.challenge_timeout, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 3);
    }
}
