//! Peer (controller) side of the pairing handshake.
//!
//! Answers a server challenge and derives the same [`SharedKey`] the server
//! will derive.  The caller keeps the key and uses it for every sealed frame
//! afterwards.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::cipher;
use crate::handshake::{derive_shared_key, HandshakeError, CHALLENGE_LEN, PUBLIC_KEY_LEN};
use crate::keystore::{PeerId, SharedKey};
use crate::protocol::WireFrame;

/// Stateless responder for server challenges.
pub struct PeerHandshake;

impl PeerHandshake {
    /// Builds the response to `challenge_frame` and returns it together with
    /// the derived key.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::UnexpectedFrame`] if the frame is not a challenge.
    /// - [`HandshakeError::InvalidChallenge`] / [`HandshakeError::InvalidPublicKey`]
    ///   for wrongly sized fields.
    /// - [`HandshakeError::NonContributory`] if the server key is a
    ///   low-order point.
    pub fn respond(
        peer_id: &PeerId,
        challenge_frame: &WireFrame,
    ) -> Result<(WireFrame, SharedKey), HandshakeError> {
        let (challenge, server_public) = match challenge_frame {
            WireFrame::Challenge {
                challenge,
                public_key,
            } => (challenge.as_slice(), public_key.as_slice()),
            other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
        };

        if challenge.len() != CHALLENGE_LEN {
            return Err(HandshakeError::InvalidChallenge {
                len: challenge.len(),
            });
        }
        let server_public: [u8; PUBLIC_KEY_LEN] =
            server_public
                .try_into()
                .map_err(|_| HandshakeError::InvalidPublicKey {
                    len: server_public.len(),
                })?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        let dh = secret.diffie_hellman(&PublicKey::from(server_public));
        if !dh.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }

        let key = derive_shared_key(dh.as_bytes(), challenge, peer_id)?;
        let proof = cipher::encrypt(challenge, &key)?;

        let response = WireFrame::Response {
            challenge: challenge.into(),
            public_key: public_key.as_bytes().to_vec().into(),
            proof: proof.into(),
        };
        Ok((response, key))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
