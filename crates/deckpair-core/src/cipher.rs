//! Authenticated symmetric encryption of opaque payloads.
//!
//! # Frame layout
//!
//! ```text
//! [nonce (24)] [ciphertext (n)] [poly1305 tag (16)]
//! ```
//!
//! XChaCha20-Poly1305 is used because its 192-bit nonce can be drawn at
//! random for every call with no realistic chance of reuse, so the cipher
//! needs no per-key counter and every call is independent of the last.
//!
//! Any modification of the frame, including the nonce, and any attempt to
//! open it with a different key fails with [`CipherError::Authentication`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::keystore::SharedKey;

/// Nonce length prepended to every frame.
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length appended by the AEAD.
pub const TAG_LEN: usize = 16;

/// Smallest possible frame: an empty plaintext still carries nonce and tag.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

/// Errors returned by [`encrypt`] and [`decrypt`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The frame is shorter than nonce + tag and cannot be a valid frame.
    #[error("frame too short: {len} bytes (minimum {MIN_FRAME_LEN})")]
    FrameTooShort { len: usize },

    /// The tag did not verify: wrong key, or the frame was modified.
    #[error("frame failed authentication")]
    Authentication,

    /// The AEAD refused to encrypt (plaintext exceeds the cipher's limit).
    #[error("encryption failed")]
    Encryption,
}

/// Encrypts `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CipherError::Encryption`] only if the underlying AEAD rejects
/// the input, which for XChaCha20-Poly1305 means a plaintext of ~256 GiB.
pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<Vec<u8>, CipherError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encryption)?;

    let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Decrypts a frame produced by [`encrypt`].
///
/// # Errors
///
/// - [`CipherError::FrameTooShort`] if `frame` cannot hold nonce and tag.
/// - [`CipherError::Authentication`] for a wrong key or any tampering.
pub fn decrypt(frame: &[u8], key: &SharedKey) -> Result<Vec<u8>, CipherError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CipherError::FrameTooShort { len: frame.len() });
    }

    let (nonce, sealed) = frame.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CipherError::Authentication)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
