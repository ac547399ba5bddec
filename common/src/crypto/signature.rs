// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Detached signature verification against account public keys.

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::{CryptoError, decode_curve25519_key};

/// Verify a detached signature.
///
/// `public_key` and `signature` are base64; the key may carry a leading type
/// prefix byte. Returns `false` on any malformed input.
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = decode_curve25519_key(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Variant of [`verify_signature`] that propagates decode failures, for
/// callers that distinguish bad input from a bad signature.
pub fn checked_verify(
    public_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<bool, CryptoError> {
    let key_bytes = decode_curve25519_key(public_key)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let sig_bytes = STANDARD.decode(signature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| CryptoError::InvalidKey)?;
    Ok(key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use rand::RngCore;

    use super::*;

    fn keypair() -> (SigningKey, String) {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let public = STANDARD.encode(signing.verifying_key().as_bytes());
        (signing, public)
    }

    #[test]
    fn valid_signature_verifies() {
        let (signing, public) = keypair();
        let sig = STANDARD.encode(signing.sign(b"message").to_bytes());
        assert!(verify_signature(&public, b"message", &sig));
    }

    #[test]
    fn tampered_message_rejected() {
        let (signing, public) = keypair();
        let sig = STANDARD.encode(signing.sign(b"message").to_bytes());
        assert!(!verify_signature(&public, b"other message", &sig));
    }

    #[test]
    fn malformed_inputs_fail_closed() {
        let (signing, public) = keypair();
        let sig = STANDARD.encode(signing.sign(b"message").to_bytes());
        assert!(!verify_signature("@@not base64@@", b"message", &sig));
        assert!(!verify_signature(&public, b"message", "@@not base64@@"));
    }
}
