//! Per-connection session state machine.
//!
//! A [`ConnectionSession`] binds one transport connection to a peer
//! identifier, a handshake, and (once paired) a shared key.  It is driven
//! exclusively by the connection's own events, in arrival order:
//!
//! ```text
//!                 on_connect(None) ─────────────────────────┐
//!                                                           ▼
//! Unidentified ── on_connect(id, key known) ──► Paired    Rejected
//!      │                                        ▲  │        ▲
//!      └── on_connect(id, no key) ──► Challenged ─┘  │        │
//!                                       │  ▲         │        │
//!                                       │  └─────────┘        │
//!                                       │  pairRequest /      │
//!                                       │  key rotated        │
//!                                       └── expired / too many attempts
//! ```
//!
//! Every call returns a `Result`.  `Err` means the inbound message was
//! dropped; the transport logs it and never reports it to the peer.  Only
//! errors for which [`SessionError::is_terminal`] holds close the
//! connection.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::cipher::{self, CipherError};
use crate::handshake::{HandshakeEngine, HandshakeError, HandshakePolicy};
use crate::keystore::{KeyStore, PeerId, SharedKey};
use crate::protocol::{Envelope, EnvelopeError, FrameError, WireFrame};

/// Action of the key-confirmation envelope sent after a successful pairing.
pub const PAIRED_ACTION: &str = "paired";

/// Handshake state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, identifier not evaluated yet.
    Unidentified,
    /// A challenge is outstanding.
    Challenged,
    /// A verified key is bound to the session.
    Paired,
    /// Terminal failure; the transport must close the connection.
    Rejected,
}

/// Why a message was dropped or a connection rejected.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection did not declare a peer identifier")]
    IdentifierMissing,

    /// A response frame failed verification.  The challenge stays open.
    #[error("handshake response rejected: {0}")]
    HandshakeMismatch(HandshakeError),

    #[error("challenge expired before a valid response arrived")]
    ChallengeExpired,

    #[error("too many failed handshake responses ({attempts})")]
    TooManyAttempts { attempts: u32 },

    /// Non-handshake traffic while a challenge is outstanding.
    #[error("`{kind}` frame received before pairing completed")]
    NotPaired { kind: &'static str },

    /// A handshake frame that makes no sense in the paired state.
    #[error("unexpected `{kind}` frame on a paired session")]
    UnexpectedFrame { kind: &'static str },

    #[error("sealed frame did not decrypt: {0}")]
    DecryptFailure(CipherError),

    #[error("malformed frame: {0}")]
    MalformedFrame(FrameError),

    /// Decrypted fine, but the plaintext is not a JSON object.
    #[error("malformed payload: {0}")]
    MalformedPayload(serde_json::Error),

    #[error("could not seal the pairing confirmation: {0}")]
    SealFailure(EnvelopeError),

    /// `pairRequest` on a session that has not yet shown it holds the
    /// stored key (no verified response, no frame that decrypted).
    #[error("pair request ignored: session has not proven its key")]
    PairRequestUnproven,

    /// The stored key was replaced while this session was still unproven.
    #[error("stored key was replaced before the session proved it")]
    KeyReplacedUnproven,

    #[error("session was rejected")]
    Rejected,
}

impl SessionError {
    /// Whether the transport must close the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::IdentifierMissing
                | SessionError::ChallengeExpired
                | SessionError::TooManyAttempts { .. }
                | SessionError::KeyReplacedUnproven
                | SessionError::Rejected
        )
    }
}

/// Result of a successful [`ConnectionSession::on_connect`].
#[derive(Debug)]
pub enum ConnectOutcome {
    /// The identifier already had a key; no challenge needed.
    Paired,
    /// The frame must be sent to the peer in clear.
    Challenged(WireFrame),
}

/// Why a paired session went back to the challenged state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RechallengeReason {
    /// The peer sent `pairRequest`.
    PairRequested,
    /// Another connection re-paired the identifier; this session's key is
    /// no longer the stored one.
    KeyRevoked,
}

/// Result of a successful [`ConnectionSession::on_message`].
#[derive(Debug)]
pub enum MessageOutcome {
    /// Decrypted application message for the host.
    Delivered(Envelope),
    /// Pairing completed; `ack` is a sealed `{"action":"paired"}` for the peer.
    Paired { ack: WireFrame },
    /// The inbound message was dropped and a new challenge must be sent.
    Rechallenged {
        challenge: WireFrame,
        reason: RechallengeReason,
    },
}

/// State for one live connection.
pub struct ConnectionSession {
    policy: HandshakePolicy,
    state: SessionState,
    peer_id: Option<PeerId>,
    key: Option<Arc<SharedKey>>,
    // Set once the peer has demonstrated possession of `key`.
    proven: bool,
    handshake: Option<HandshakeEngine>,
}

impl ConnectionSession {
    pub fn new(policy: HandshakePolicy) -> Self {
        Self {
            policy,
            state: SessionState::Unidentified,
            peer_id: None,
            key: None,
            proven: false,
            handshake: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Key bound to the session while it is paired.
    pub fn paired_key(&self) -> Option<Arc<SharedKey>> {
        match self.state {
            SessionState::Paired => self.key.clone(),
            _ => None,
        }
    }

    /// Whether the peer has shown it holds the session key, either by
    /// completing a handshake on this connection or by sending a sealed
    /// frame that decrypted.  A session paired by identifier lookup alone
    /// starts unproven.
    pub fn is_proven(&self) -> bool {
        self.proven
    }

    /// Deadline of the outstanding challenge while challenged.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::Challenged => self.handshake.as_ref().and_then(|h| h.deadline()),
            _ => None,
        }
    }

    /// Evaluates the identifier the peer declared at connect time.
    ///
    /// # Errors
    ///
    /// [`SessionError::IdentifierMissing`] for an absent or blank identifier.
    /// The session is then `Rejected` and the connection must be closed
    /// before any message is read.
    pub fn on_connect(
        &mut self,
        peer_id: Option<&str>,
        store: &KeyStore,
        now: Instant,
    ) -> Result<ConnectOutcome, SessionError> {
        let Some(peer_id) = peer_id.and_then(PeerId::new) else {
            self.state = SessionState::Rejected;
            return Err(SessionError::IdentifierMissing);
        };

        let mut engine = HandshakeEngine::new(peer_id.clone(), self.policy);

        let outcome = match store.lookup(peer_id.as_str()) {
            Some(key) => {
                debug!(peer = %peer_id, key = %key.fingerprint(), "known peer, session paired");
                self.key = Some(key);
                self.proven = false;
                self.state = SessionState::Paired;
                ConnectOutcome::Paired
            }
            None => {
                let challenge = engine.issue_challenge(now);
                self.key = None;
                self.state = SessionState::Challenged;
                ConnectOutcome::Challenged(challenge)
            }
        };

        self.peer_id = Some(peer_id);
        self.handshake = Some(engine);
        Ok(outcome)
    }

    /// Routes one inbound text frame through the current state.
    pub fn on_message(
        &mut self,
        raw: &str,
        store: &KeyStore,
        now: Instant,
    ) -> Result<MessageOutcome, SessionError> {
        match self.state {
            SessionState::Unidentified => Err(SessionError::IdentifierMissing),
            SessionState::Rejected => Err(SessionError::Rejected),
            SessionState::Challenged => self.on_challenged_message(raw, store, now),
            SessionState::Paired => self.on_paired_message(raw, store, now),
        }
    }

    /// Same as [`on_message`](Self::on_message) for a binary transport frame.
    pub fn on_binary_message(
        &mut self,
        raw: &[u8],
        store: &KeyStore,
        now: Instant,
    ) -> Result<MessageOutcome, SessionError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| SessionError::MalformedFrame(FrameError::NotUtf8))?;
        self.on_message(text, store, now)
    }

    /// Rejects the session if its challenge deadline has passed.
    pub fn poll_deadline(&mut self, now: Instant) -> Result<(), SessionError> {
        let expired = self.state == SessionState::Challenged
            && self.handshake.as_ref().is_some_and(|h| h.is_expired(now));
        if expired {
            self.reject();
            return Err(SessionError::ChallengeExpired);
        }
        Ok(())
    }

    /// Ends the session.  The key, if any, stays in the [`KeyStore`].
    pub fn on_close(self) -> Option<PeerId> {
        self.peer_id
    }

    fn on_challenged_message(
        &mut self,
        raw: &str,
        store: &KeyStore,
        now: Instant,
    ) -> Result<MessageOutcome, SessionError> {
        self.poll_deadline(now)?;

        let frame = WireFrame::decode(raw).map_err(SessionError::MalformedFrame)?;
        let kind = frame.kind();
        let WireFrame::Response {
            challenge,
            public_key,
            proof,
        } = frame
        else {
            return Err(SessionError::NotPaired { kind });
        };

        let (Some(engine), Some(peer_id)) = (self.handshake.as_mut(), self.peer_id.as_ref())
        else {
            self.reject();
            return Err(SessionError::Rejected);
        };

        match engine.verify_response(challenge.as_slice(), public_key.as_slice(), proof.as_slice(), now) {
            Ok(key) => {
                let key = Arc::new(key);
                if store.store(peer_id.clone(), Arc::clone(&key)).is_some() {
                    info!(peer = %peer_id, key = %key.fingerprint(), "peer re-paired, previous key replaced");
                } else {
                    info!(peer = %peer_id, key = %key.fingerprint(), "peer paired");
                }
                self.key = Some(Arc::clone(&key));
                self.proven = true;
                self.state = SessionState::Paired;

                let ack = Envelope::action_only(PAIRED_ACTION)
                    .seal(&key)
                    .map_err(SessionError::SealFailure)?;
                Ok(MessageOutcome::Paired { ack })
            }
            Err(HandshakeError::ChallengeExpired) => {
                self.reject();
                Err(SessionError::ChallengeExpired)
            }
            Err(HandshakeError::TooManyAttempts { attempts }) => {
                self.reject();
                Err(SessionError::TooManyAttempts { attempts })
            }
            Err(e) => Err(SessionError::HandshakeMismatch(e)),
        }
    }

    fn on_paired_message(
        &mut self,
        raw: &str,
        store: &KeyStore,
        now: Instant,
    ) -> Result<MessageOutcome, SessionError> {
        let frame = WireFrame::decode(raw).map_err(SessionError::MalformedFrame)?;

        let (Some(key), Some(peer_id)) = (self.key.clone(), self.peer_id.as_ref()) else {
            self.reject();
            return Err(SessionError::Rejected);
        };

        if !store.is_current(peer_id.as_str(), &key) {
            if !self.proven {
                debug!(peer = %peer_id, "key replaced before session proved it, closing");
                self.reject();
                return Err(SessionError::KeyReplacedUnproven);
            }
            debug!(peer = %peer_id, "session key was replaced elsewhere, re-challenging");
            return self.rechallenge(now, RechallengeReason::KeyRevoked);
        }

        match frame {
            WireFrame::Sealed { data } => {
                let plaintext =
                    cipher::decrypt(data.as_slice(), &key).map_err(SessionError::DecryptFailure)?;
                self.proven = true;
                let envelope =
                    Envelope::from_json_bytes(&plaintext).map_err(SessionError::MalformedPayload)?;
                Ok(MessageOutcome::Delivered(envelope))
            }
            WireFrame::PairRequest if !self.proven => Err(SessionError::PairRequestUnproven),
            WireFrame::PairRequest => self.rechallenge(now, RechallengeReason::PairRequested),
            other => Err(SessionError::UnexpectedFrame { kind: other.kind() }),
        }
    }

    fn rechallenge(
        &mut self,
        now: Instant,
        reason: RechallengeReason,
    ) -> Result<MessageOutcome, SessionError> {
        let Some(engine) = self.handshake.as_mut() else {
            self.reject();
            return Err(SessionError::Rejected);
        };
        let challenge = engine.issue_challenge(now);
        self.key = None;
        self.state = SessionState::Challenged;
        Ok(MessageOutcome::Rechallenged { challenge, reason })
    }

    fn reject(&mut self) {
        self.state = SessionState::Rejected;
        self.key = None;
        self.proven = false;
        self.handshake = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::PeerHandshake;
    use crate::keystore::SHARED_KEY_LEN;
    use crate::protocol::{open_sealed_frame, seal_envelope};
    use std::time::Duration;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn session() -> ConnectionSession {
        ConnectionSession::new(HandshakePolicy::default())
    }

    /// Connects `id` to a fresh session and completes the handshake.
    fn paired_session(id: &str, store: &KeyStore, now: Instant) -> (ConnectionSession, SharedKey) {
        let mut s = session();
        let challenge = match s.on_connect(Some(id), store, now).unwrap() {
            ConnectOutcome::Challenged(frame) => frame,
            ConnectOutcome::Paired => panic!("expected a challenge"),
        };
        let (response, key) = PeerHandshake::respond(&peer(id), &challenge).unwrap();
        let outcome = s
            .on_message(&response.encode().unwrap(), store, now)
            .unwrap();
        assert!(matches!(outcome, MessageOutcome::Paired { .. }));
        (s, key)
    }

    #[test]
    fn test_connect_without_identifier_is_rejected() {
        let store = KeyStore::new();
        let mut s = session();

        let result = s.on_connect(None, &store, Instant::now());

        assert!(matches!(result, Err(SessionError::IdentifierMissing)));
        assert_eq!(s.state(), SessionState::Rejected);
        assert!(store.is_empty());
    }

    #[test]
    fn test_connect_with_blank_identifier_is_rejected() {
        let store = KeyStore::new();
        let mut s = session();
        let result = s.on_connect(Some(""), &store, Instant::now());
        assert!(matches!(result, Err(SessionError::IdentifierMissing)));
    }

    #[test]
    fn test_rejected_session_drops_every_message() {
        let store = KeyStore::new();
        let mut s = session();
        let _ = s.on_connect(None, &store, Instant::now());

        let result = s.on_message(r#"{"kind":"pairRequest"}"#, &store, Instant::now());

        assert!(matches!(result, Err(SessionError::Rejected)));
    }

    #[test]
    fn test_known_peer_is_paired_without_challenge() {
        let store = KeyStore::new();
        let key = Arc::new(SharedKey::from_bytes([4; SHARED_KEY_LEN]));
        store.store(peer("dev-1"), Arc::clone(&key));
        let mut s = session();

        let outcome = s.on_connect(Some("dev-1"), &store, Instant::now()).unwrap();

        assert!(matches!(outcome, ConnectOutcome::Paired));
        assert_eq!(s.state(), SessionState::Paired);
        assert_eq!(s.paired_key().as_deref(), Some(&*key));
    }

    #[test]
    fn test_unknown_peer_is_challenged() {
        let store = KeyStore::new();
        let mut s = session();
        let now = Instant::now();

        let outcome = s.on_connect(Some("dev-1"), &store, now).unwrap();

        assert!(matches!(outcome, ConnectOutcome::Challenged(WireFrame::Challenge { .. })));
        assert_eq!(s.state(), SessionState::Challenged);
        assert!(s.paired_key().is_none());
        assert_eq!(s.deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_valid_response_pairs_and_stores_key() {
        // Arrange
        let store = KeyStore::new();
        let now = Instant::now();

        // Act
        let (s, peer_key) = paired_session("dev-42", &store, now);

        // Assert
        assert_eq!(s.state(), SessionState::Paired);
        assert_eq!(store.lookup("dev-42").as_deref(), Some(&peer_key));
    }

    #[test]
    fn test_pairing_ack_opens_under_peer_key() {
        let store = KeyStore::new();
        let now = Instant::now();
        let mut s = session();
        let challenge = match s.on_connect(Some("dev"), &store, now).unwrap() {
            ConnectOutcome::Challenged(frame) => frame,
            ConnectOutcome::Paired => panic!("expected a challenge"),
        };
        let (response, key) = PeerHandshake::respond(&peer("dev"), &challenge).unwrap();

        let ack = match s.on_message(&response.encode().unwrap(), &store, now).unwrap() {
            MessageOutcome::Paired { ack } => ack,
            other => panic!("expected Paired, got {other:?}"),
        };

        let env = open_sealed_frame(&ack.encode().unwrap(), &key).unwrap();
        assert_eq!(env.action(), Some(PAIRED_ACTION));
    }

    #[test]
    fn test_non_response_while_challenged_is_dropped() {
        let store = KeyStore::new();
        let mut s = session();
        let now = Instant::now();
        s.on_connect(Some("dev"), &store, now).unwrap();
        let stray = seal_envelope(
            &Envelope::action_only("ping"),
            &SharedKey::from_bytes([1; SHARED_KEY_LEN]),
        )
        .unwrap();

        let result = s.on_message(&stray, &store, now);

        assert!(matches!(result, Err(SessionError::NotPaired { kind: "sealed" })));
        assert_eq!(s.state(), SessionState::Challenged);
    }

    #[test]
    fn test_garbage_while_challenged_is_malformed_and_not_terminal() {
        let store = KeyStore::new();
        let mut s = session();
        let now = Instant::now();
        s.on_connect(Some("dev"), &store, now).unwrap();

        let err = s.on_message("garbage", &store, now).unwrap_err();

        assert!(matches!(err, SessionError::MalformedFrame(_)));
        assert!(!err.is_terminal());
        assert_eq!(s.state(), SessionState::Challenged);
    }

    #[test]
    fn test_bad_responses_reject_after_limit() {
        let store = KeyStore::new();
        let mut s = session();
        let now = Instant::now();
        s.on_connect(Some("dev"), &store, now).unwrap();
        let bogus = WireFrame::Response {
            challenge: vec![0; 32].into(),
            public_key: vec![9; 32].into(),
            proof: vec![0; 48].into(),
        }
        .encode()
        .unwrap();

        let first = s.on_message(&bogus, &store, now).unwrap_err();
        let second = s.on_message(&bogus, &store, now).unwrap_err();
        let third = s.on_message(&bogus, &store, now).unwrap_err();

        assert!(matches!(first, SessionError::HandshakeMismatch(_)));
        assert!(matches!(second, SessionError::HandshakeMismatch(_)));
        assert!(matches!(third, SessionError::TooManyAttempts { attempts: 3 }));
        assert!(third.is_terminal());
        assert_eq!(s.state(), SessionState::Rejected);
        assert!(store.is_empty());
    }

    #[test]
    fn test_poll_deadline_rejects_expired_challenge() {
        let store = KeyStore::new();
        let mut s = ConnectionSession::new(HandshakePolicy {
            challenge_timeout: Duration::from_secs(10),
            max_attempts: 3,
        });
        let now = Instant::now();
        s.on_connect(Some("dev"), &store, now).unwrap();

        assert!(s.poll_deadline(now + Duration::from_secs(9)).is_ok());
        let err = s.poll_deadline(now + Duration::from_secs(10)).unwrap_err();

        assert!(matches!(err, SessionError::ChallengeExpired));
        assert_eq!(s.state(), SessionState::Rejected);
    }

    #[test]
    fn test_response_after_deadline_is_rejected() {
        let store = KeyStore::new();
        let mut s = ConnectionSession::new(HandshakePolicy {
            challenge_timeout: Duration::from_secs(10),
            max_attempts: 3,
        });
        let now = Instant::now();
        let challenge = match s.on_connect(Some("dev"), &store, now).unwrap() {
            ConnectOutcome::Challenged(frame) => frame,
            ConnectOutcome::Paired => panic!("expected a challenge"),
        };
        let (response, _) = PeerHandshake::respond(&peer("dev"), &challenge).unwrap();

        let err = s
            .on_message(&response.encode().unwrap(), &store, now + Duration::from_secs(11))
            .unwrap_err();

        assert!(matches!(err, SessionError::ChallengeExpired));
        assert!(store.is_empty());
    }

    #[test]
    fn test_paired_session_delivers_decrypted_envelope() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, key) = paired_session("dev", &store, now);
        let frame = seal_envelope(&Envelope::action_only("ping"), &key).unwrap();

        let outcome = s.on_message(&frame, &store, now).unwrap();

        match outcome {
            MessageOutcome::Delivered(env) => assert_eq!(env.action(), Some("ping")),
            other => panic!("expected Delivered, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_frame_is_treated_as_text() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, key) = paired_session("dev", &store, now);
        let frame = seal_envelope(&Envelope::action_only("ping"), &key).unwrap();

        let outcome = s.on_binary_message(frame.as_bytes(), &store, now).unwrap();

        assert!(matches!(outcome, MessageOutcome::Delivered(_)));
    }

    #[test]
    fn test_wrong_key_frame_is_dropped_but_session_stays_paired() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, _) = paired_session("dev", &store, now);
        let frame = seal_envelope(
            &Envelope::action_only("ping"),
            &SharedKey::from_bytes([0xEE; SHARED_KEY_LEN]),
        )
        .unwrap();

        let err = s.on_message(&frame, &store, now).unwrap_err();

        assert!(matches!(err, SessionError::DecryptFailure(CipherError::Authentication)));
        assert!(!err.is_terminal());
        assert_eq!(s.state(), SessionState::Paired);
    }

    #[test]
    fn test_non_object_plaintext_is_malformed_payload() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, key) = paired_session("dev", &store, now);
        let data = cipher::encrypt(b"[1,2]", &key).unwrap();
        let frame = WireFrame::Sealed { data: data.into() }.encode().unwrap();

        let err = s.on_message(&frame, &store, now).unwrap_err();

        assert!(matches!(err, SessionError::MalformedPayload(_)));
        assert_eq!(s.state(), SessionState::Paired);
    }

    #[test]
    fn test_plain_json_is_never_treated_as_handshake_or_delivered() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, _) = paired_session("dev", &store, now);

        let err = s.on_message(r#"{"action":"ping"}"#, &store, now).unwrap_err();

        assert!(matches!(err, SessionError::MalformedFrame(_)));
    }

    #[test]
    fn test_response_frame_on_paired_session_is_unexpected() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, _) = paired_session("dev", &store, now);
        let frame = WireFrame::Response {
            challenge: vec![0; 32].into(),
            public_key: vec![0; 32].into(),
            proof: vec![0; 40].into(),
        };

        let err = s.on_message(&frame.encode().unwrap(), &store, now).unwrap_err();

        assert!(matches!(err, SessionError::UnexpectedFrame { kind: "response" }));
    }

    #[test]
    fn test_pair_request_rechallenges_and_keeps_old_key_until_done() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut s, old_key) = paired_session("dev", &store, now);

        let outcome = s
            .on_message(&WireFrame::PairRequest.encode().unwrap(), &store, now)
            .unwrap();

        let challenge = match outcome {
            MessageOutcome::Rechallenged { challenge, reason } => {
                assert_eq!(reason, RechallengeReason::PairRequested);
                challenge
            }
            other => panic!("expected Rechallenged, got {other:?}"),
        };
        assert_eq!(s.state(), SessionState::Challenged);
        assert!(s.paired_key().is_none());
        assert!(store.is_current("dev", &old_key));

        let (response, new_key) = PeerHandshake::respond(&peer("dev"), &challenge).unwrap();
        s.on_message(&response.encode().unwrap(), &store, now).unwrap();

        assert!(store.is_current("dev", &new_key));
        assert!(!store.is_current("dev", &old_key));
    }

    #[test]
    fn test_pair_request_on_lookup_paired_session_is_ignored() {
        // Arrange: "dev-42" already has a key; a new connection claims the id
        // but has never used that key.
        let store = KeyStore::new();
        let legit = Arc::new(SharedKey::from_bytes([7; SHARED_KEY_LEN]));
        store.store(peer("dev-42"), Arc::clone(&legit));
        let now = Instant::now();
        let mut s = session();
        s.on_connect(Some("dev-42"), &store, now).unwrap();
        assert!(!s.is_proven());

        // Act
        let err = s
            .on_message(&WireFrame::PairRequest.encode().unwrap(), &store, now)
            .unwrap_err();

        // Assert: no challenge is issued and the stored key is untouched.
        assert!(matches!(err, SessionError::PairRequestUnproven));
        assert!(!err.is_terminal());
        assert_eq!(s.state(), SessionState::Paired);
        assert!(s.deadline().is_none());
        assert!(store.is_current("dev-42", &legit));
    }

    #[test]
    fn test_pair_request_honoured_after_sealed_frame_proves_key() {
        let store = KeyStore::new();
        let key = Arc::new(SharedKey::from_bytes([7; SHARED_KEY_LEN]));
        store.store(peer("dev-42"), Arc::clone(&key));
        let now = Instant::now();
        let mut s = session();
        s.on_connect(Some("dev-42"), &store, now).unwrap();

        let ping = seal_envelope(&Envelope::action_only("ping"), &key).unwrap();
        assert!(matches!(
            s.on_message(&ping, &store, now).unwrap(),
            MessageOutcome::Delivered(_)
        ));
        assert!(s.is_proven());

        let outcome = s
            .on_message(&WireFrame::PairRequest.encode().unwrap(), &store, now)
            .unwrap();

        assert!(matches!(
            outcome,
            MessageOutcome::Rechallenged {
                reason: RechallengeReason::PairRequested,
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_key_frame_does_not_prove_session() {
        let store = KeyStore::new();
        store.store(peer("dev"), Arc::new(SharedKey::from_bytes([7; SHARED_KEY_LEN])));
        let now = Instant::now();
        let mut s = session();
        s.on_connect(Some("dev"), &store, now).unwrap();
        let forged = seal_envelope(
            &Envelope::action_only("ping"),
            &SharedKey::from_bytes([8; SHARED_KEY_LEN]),
        )
        .unwrap();

        let _ = s.on_message(&forged, &store, now);

        assert!(!s.is_proven());
    }

    #[test]
    fn test_unproven_session_closes_when_key_is_replaced() {
        let store = KeyStore::new();
        let old = Arc::new(SharedKey::from_bytes([1; SHARED_KEY_LEN]));
        store.store(peer("dev"), old);
        let now = Instant::now();
        let mut s = session();
        s.on_connect(Some("dev"), &store, now).unwrap();
        store.store(peer("dev"), Arc::new(SharedKey::from_bytes([2; SHARED_KEY_LEN])));

        let err = s
            .on_message(&WireFrame::PairRequest.encode().unwrap(), &store, now)
            .unwrap_err();

        assert!(matches!(err, SessionError::KeyReplacedUnproven));
        assert!(err.is_terminal());
        assert_eq!(s.state(), SessionState::Rejected);
    }

    #[test]
    fn test_repairing_elsewhere_invalidates_old_session() {
        // Arrange: session A paired with K1; session B for the same id
        // proves K1, asks to re-pair, and stores K2.
        let store = KeyStore::new();
        let now = Instant::now();
        let (mut a, k1) = paired_session("dev", &store, now);

        let mut b = session();
        b.on_connect(Some("dev"), &store, now).unwrap();
        let ping = seal_envelope(&Envelope::action_only("ping"), &k1).unwrap();
        b.on_message(&ping, &store, now).unwrap();
        let challenge = match b
            .on_message(&WireFrame::PairRequest.encode().unwrap(), &store, now)
            .unwrap()
        {
            MessageOutcome::Rechallenged { challenge, .. } => challenge,
            other => panic!("expected Rechallenged, got {other:?}"),
        };
        let (response, k2) = PeerHandshake::respond(&peer("dev"), &challenge).unwrap();
        b.on_message(&response.encode().unwrap(), &store, now).unwrap();
        assert_ne!(k1, k2);
        assert!(store.is_current("dev", &k2));

        // Act: A receives a frame sealed with its (old) key.
        let frame = seal_envelope(&Envelope::action_only("ping"), &k1).unwrap();
        let outcome = a.on_message(&frame, &store, now).unwrap();

        // Assert: the message is not delivered; A must pair again.
        assert!(matches!(
            outcome,
            MessageOutcome::Rechallenged {
                reason: RechallengeReason::KeyRevoked,
                ..
            }
        ));
        assert_eq!(a.state(), SessionState::Challenged);
    }

    #[test]
    fn test_on_close_keeps_key_in_store() {
        let store = KeyStore::new();
        let now = Instant::now();
        let (s, key) = paired_session("dev", &store, now);

        let closed_peer = s.on_close();

        assert_eq!(closed_peer, Some(peer("dev")));
        assert_eq!(store.lookup("dev").as_deref(), Some(&key));
    }
}
