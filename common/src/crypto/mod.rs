// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crypto helpers consumed by the delivery core: the sealed sender envelope
//! and detached signature verification. Primitives come from the RustCrypto
//! and dalek crates; nothing here implements its own cryptography.

pub mod sender_envelope;
pub mod signature;

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// Errors from the helpers in this module.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("cipher failure")]
    Cipher,
}

/// Decode a base64 curve25519 public key, accepting the 33-byte form with a
/// type prefix byte as well as the raw 32-byte form.
pub(crate) fn decode_curve25519_key(b64: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = STANDARD.decode(b64)?;
    let raw: &[u8] = match bytes.len() {
        32 => &bytes,
        33 => &bytes[1..],
        _ => return Err(CryptoError::InvalidKey),
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(raw);
    Ok(key)
}
