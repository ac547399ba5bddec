// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-device authentication credentials.
//!
//! A device stores a random salt and the HMAC-SHA256 of the client-supplied
//! token under that salt. Verification rehashes and compares in constant
//! time (the comparison is done by the MAC itself).

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;

/// Stored form of a device token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    /// Hex-encoded random salt, used as the MAC key.
    pub salt: String,
    /// Hex-encoded HMAC-SHA256 of the token.
    pub token_hash: String,
}

impl AuthCredential {
    /// Derive a credential for a fresh token with a random salt.
    pub fn derive(token: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive_with_salt(token, &salt)
    }

    fn derive_with_salt(token: &str, salt: &[u8]) -> Self {
        let mut mac =
            HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
        mac.update(token.as_bytes());
        let token_hash = hex::encode(mac.finalize().into_bytes());
        Self {
            salt: hex::encode(salt),
            token_hash,
        }
    }

    /// Verify a client-supplied token against the stored credential.
    pub fn verify(&self, token: &str) -> bool {
        let Ok(salt) = hex::decode(&self.salt) else {
            return false;
        };
        let Ok(expected) = hex::decode(&self.token_hash) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&salt).expect("hmac accepts any key length");
        mac.update(token.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Generate a fresh random client token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_credential_verifies() {
        let cred = AuthCredential::derive("secret-token");
        assert!(cred.verify("secret-token"));
        assert!(!cred.verify("wrong-token"));
    }

    #[test]
    fn different_salts_produce_different_hashes() {
        let a = AuthCredential::derive("token");
        let b = AuthCredential::derive("token");
        assert_ne!(a.token_hash, b.token_hash);
        assert!(a.verify("token"));
        assert!(b.verify("token"));
    }

    #[test]
    fn corrupted_credential_fails_closed() {
        let mut cred = AuthCredential::derive("token");
        cred.salt = "not hex".into();
        assert!(!cred.verify("token"));
    }
}
