//! Tagged JSON frames.
//!
//! Every frame is a JSON object whose `kind` field selects the variant:
//!
//! ```json
//! {"kind":"challenge","challenge":"<b64>","publicKey":"<b64>"}
//! {"kind":"response","challenge":"<b64>","publicKey":"<b64>","proof":"<b64>"}
//! {"kind":"pairRequest"}
//! {"kind":"sealed","data":"<b64 nonce|ciphertext|tag>"}
//! ```
//!
//! Byte fields travel as standard (padded) base64.  A frame with an unknown
//! `kind`, a missing field, or a field that is not valid base64 fails to
//! decode as a whole.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while decoding or encoding a [`WireFrame`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text is not a JSON object matching any known frame kind.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary transport frame did not contain UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

/// Raw bytes that serialize as a base64 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Base64Bytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireFrame {
    /// Server → peer, in clear: the outstanding challenge and the server's
    /// ephemeral X25519 public key.
    Challenge {
        challenge: Base64Bytes,
        #[serde(rename = "publicKey")]
        public_key: Base64Bytes,
    },

    /// Peer → server: echo of the challenge, the peer's X25519 public key,
    /// and the challenge sealed under the derived key.
    Response {
        challenge: Base64Bytes,
        #[serde(rename = "publicKey")]
        public_key: Base64Bytes,
        proof: Base64Bytes,
    },

    /// Peer → server: re-run pairing on an already paired connection.
    PairRequest,

    /// Either direction: an [`Envelope`](super::Envelope) encrypted with the
    /// session's shared key.
    Sealed { data: Base64Bytes },
}

impl WireFrame {
    /// Parses a text frame.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a binary frame by treating its payload as UTF-8 text.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name of the variant for log lines.  Never includes field data.
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Challenge { .. } => "challenge",
            WireFrame::Response { .. } => "response",
            WireFrame::PairRequest => "pairRequest",
            WireFrame::Sealed { .. } => "sealed",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_serializes_with_kind_discriminant() {
        let frame = WireFrame::Challenge {
            challenge: vec![1, 2, 3].into(),
            public_key: vec![4, 5, 6].into(),
        };

        let json = frame.encode().unwrap();

        assert!(json.contains(r#""kind":"challenge""#));
        assert!(json.contains(r#""publicKey":"BAUG""#));
        assert!(json.contains(r#""challenge":"AQID""#));
    }

    #[test]
    fn test_pair_request_decodes_from_bare_kind() {
        let frame = WireFrame::decode(r#"{"kind":"pairRequest"}"#).unwrap();
        assert_eq!(frame, WireFrame::PairRequest);
    }

    #[test]
    fn test_sealed_decodes_base64_payload() {
        let frame = WireFrame::decode(r#"{"kind":"sealed","data":"AAEC"}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Sealed {
                data: vec![0, 1, 2].into()
            }
        );
    }

    #[test]
    fn test_response_requires_all_fields() {
        let result = WireFrame::decode(r#"{"kind":"response","challenge":"AA==","publicKey":"AA=="}"#);
        assert!(result.is_err(), "response without proof must not decode");
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = WireFrame::decode(r#"{"kind":"sealed","data":"not base64!"}"#);
        assert!(matches!(result, Err(FrameError::Json(_))));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(WireFrame::decode(r#"{"kind":"hello"}"#).is_err());
    }

    #[test]
    fn test_missing_kind_is_rejected() {
        // A plain application envelope sent in clear has no `kind` and must
        // never be mistaken for a handshake frame.
        assert!(WireFrame::decode(r#"{"action":"ping"}"#).is_err());
    }

    #[test]
    fn test_non_json_text_is_rejected() {
        assert!(WireFrame::decode("definitely not json").is_err());
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        let result = WireFrame::decode_bytes(&[0xff, 0xfe, 0xfd]);
        assert!(matches!(result, Err(FrameError::NotUtf8)));
    }

    #[test]
    fn test_decode_bytes_accepts_utf8_json() {
        let frame = WireFrame::decode_bytes(br#"{"kind":"pairRequest"}"#).unwrap();
        assert_eq!(frame.kind(), "pairRequest");
    }
}
