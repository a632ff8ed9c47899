//! Server side of the pairing handshake.
//!
//! A [`HandshakeEngine`] belongs to exactly one connection.  It holds at most
//! one outstanding challenge; issuing a new one discards the previous, so a
//! response is only ever checked against the challenge sent immediately
//! before it.

use std::time::Instant;

use rand::{rngs::OsRng, RngCore};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cipher;
use crate::handshake::{
    derive_shared_key, HandshakeError, HandshakePolicy, CHALLENGE_LEN, PUBLIC_KEY_LEN,
};
use crate::keystore::{PeerId, SharedKey};
use crate::protocol::WireFrame;

/// A challenge waiting for its response.
struct PendingChallenge {
    challenge: [u8; CHALLENGE_LEN],
    // StaticSecret rather than EphemeralSecret: a failed response must not
    // consume the secret, the peer may try again.
    secret: StaticSecret,
    deadline: Instant,
    failed_attempts: u32,
}

/// Per-connection challenge issuer and response verifier.
pub struct HandshakeEngine {
    peer_id: PeerId,
    policy: HandshakePolicy,
    pending: Option<PendingChallenge>,
}

impl HandshakeEngine {
    pub fn new(peer_id: PeerId, policy: HandshakePolicy) -> Self {
        Self {
            peer_id,
            policy,
            pending: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Generates a fresh challenge and ephemeral key pair, replacing any
    /// outstanding challenge, and returns the frame to send in clear.
    pub fn issue_challenge(&mut self, now: Instant) -> WireFrame {
        let mut challenge = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);

        self.pending = Some(PendingChallenge {
            challenge,
            secret,
            deadline: now + self.policy.challenge_timeout,
            failed_attempts: 0,
        });

        debug!(peer = %self.peer_id, "challenge issued");

        WireFrame::Challenge {
            challenge: challenge.to_vec().into(),
            public_key: public_key.as_bytes().to_vec().into(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Deadline of the outstanding challenge, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.pending.as_ref().is_some_and(|p| now >= p.deadline)
    }

    /// Checks a response against the outstanding challenge.
    ///
    /// On success the challenge is consumed and the derived key returned.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::NoPendingChallenge`] if nothing is outstanding.
    /// - [`HandshakeError::ChallengeExpired`] once the deadline has passed
    ///   (the challenge is discarded).
    /// - A verification error (`ChallengeMismatch`, `InvalidPublicKey`,
    ///   `NonContributory`, `InvalidProof`) counts as a failed attempt.  When
    ///   the policy's limit is reached [`HandshakeError::TooManyAttempts`] is
    ///   returned instead and the challenge is discarded.
    pub fn verify_response(
        &mut self,
        challenge: &[u8],
        public_key: &[u8],
        proof: &[u8],
        now: Instant,
    ) -> Result<SharedKey, HandshakeError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(HandshakeError::NoPendingChallenge)?;

        if now >= pending.deadline {
            self.pending = None;
            return Err(HandshakeError::ChallengeExpired);
        }

        match check_response(pending, &self.peer_id, challenge, public_key, proof) {
            Ok(key) => {
                self.pending = None;
                Ok(key)
            }
            Err(e) => {
                pending.failed_attempts += 1;
                let attempts = pending.failed_attempts;
                debug!(peer = %self.peer_id, attempts, "handshake response rejected: {e}");
                if attempts >= self.policy.max_attempts {
                    self.pending = None;
                    Err(HandshakeError::TooManyAttempts { attempts })
                } else {
                    Err(e)
                }
            }
        }
    }
}

fn check_response(
    pending: &PendingChallenge,
    peer_id: &PeerId,
    challenge: &[u8],
    public_key: &[u8],
    proof: &[u8],
) -> Result<SharedKey, HandshakeError> {
    if challenge != pending.challenge.as_slice() {
        return Err(HandshakeError::ChallengeMismatch);
    }

    let peer_public: [u8; PUBLIC_KEY_LEN] =
        public_key
            .try_into()
            .map_err(|_| HandshakeError::InvalidPublicKey {
                len: public_key.len(),
            })?;

    let dh = pending.secret.diffie_hellman(&PublicKey::from(peer_public));
    if !dh.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let key = derive_shared_key(dh.as_bytes(), &pending.challenge, peer_id)?;

    let opened = cipher::decrypt(proof, &key).map_err(|_| HandshakeError::InvalidProof)?;
    if opened != pending.challenge {
        return Err(HandshakeError::InvalidProof);
    }

    Ok(key)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
