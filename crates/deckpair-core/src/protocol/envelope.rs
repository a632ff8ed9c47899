//! Application messages and their sealed form.
//!
//! An [`Envelope`] is a JSON object with an optional `action` and any number
//! of extra fields, flattened into the same object:
//!
//! ```json
//! {"action":"settings","connected":true,"profile":"default"}
//! ```
//!
//! On the wire an envelope only ever appears encrypted, inside a
//! `{"kind":"sealed"}` frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cipher::{self, CipherError};
use crate::keystore::SharedKey;
use crate::protocol::frame::{FrameError, WireFrame};

/// Errors from sealing or opening an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// The plaintext decrypted fine but is not a JSON object.
    #[error("payload is not a JSON object: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The frame decoded, but it is a handshake frame, not a sealed one.
    #[error("expected a sealed frame, got `{0}`")]
    NotSealed(&'static str),
}

/// The logical message unit exchanged after pairing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Builds an envelope for `action`.  An `action` key inside `fields` is
    /// discarded so the explicit argument always wins.
    pub fn new(action: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        fields.remove("action");
        Self {
            action: Some(action.into()),
            fields,
        }
    }

    /// Envelope with only an `action`.
    pub fn action_only(action: impl Into<String>) -> Self {
        Self::new(action, Map::new())
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serializes and encrypts the envelope into a `sealed` frame.
    pub fn seal(&self, key: &SharedKey) -> Result<WireFrame, EnvelopeError> {
        let plaintext = self.to_json_bytes()?;
        let data = cipher::encrypt(&plaintext, key)?;
        Ok(WireFrame::Sealed { data: data.into() })
    }
}

/// [`Envelope::seal`] followed by frame encoding, ready for the socket.
pub fn seal_envelope(envelope: &Envelope, key: &SharedKey) -> Result<String, EnvelopeError> {
    Ok(envelope.seal(key)?.encode()?)
}

/// Inverse of [`seal_envelope`]: decodes the frame, decrypts, and parses.
pub fn open_sealed_frame(text: &str, key: &SharedKey) -> Result<Envelope, EnvelopeError> {
    match WireFrame::decode(text)? {
        WireFrame::Sealed { data } => {
            let plaintext = cipher::decrypt(data.as_slice(), key)?;
            Ok(Envelope::from_json_bytes(&plaintext)?)
        }
        other => Err(EnvelopeError::NotSealed(other.kind())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
