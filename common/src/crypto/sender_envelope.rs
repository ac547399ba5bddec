// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sealed sender envelope.
//!
//! When the cluster runs with `plain_uid_support` off, the stored `from_uid`
//! of a group message is blank and the sender identity travels in this
//! envelope instead: an ephemeral x25519 ECDH against the group's message
//! public key, SHA-256 of the shared secret as AES-256 key, AES-256-CBC over
//! the sender uid.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::{CryptoError, decode_curve25519_key};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const ENVELOPE_VERSION: u32 = 1;

/// The sealed sender identity carried in a group message's `source_extra`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderEnvelope {
    pub version: u32,
    /// The group message public key the envelope was sealed against.
    pub group_msg_pubkey: String,
    /// Base64 ephemeral x25519 public key.
    pub ephemeral_pubkey: String,
    /// Base64 CBC initialization vector.
    pub iv: String,
    /// Base64 ciphertext of the sender uid.
    pub source: String,
}

impl SenderEnvelope {
    /// Seal `sender_uid` against the group's base64 message public key.
    pub fn seal(sender_uid: &str, group_msg_pubkey: &str) -> Result<Self, CryptoError> {
        let group_key = PublicKey::from(decode_curve25519_key(group_msg_pubkey)?);

        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&group_key);
        let key = Sha256::digest(shared.as_bytes());

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(key.as_slice(), &iv)
            .map_err(|_| CryptoError::Cipher)?
            .encrypt_padded_vec_mut::<Pkcs7>(sender_uid.as_bytes());

        Ok(Self {
            version: ENVELOPE_VERSION,
            group_msg_pubkey: group_msg_pubkey.to_owned(),
            ephemeral_pubkey: STANDARD.encode(ephemeral_pub.as_bytes()),
            iv: STANDARD.encode(iv),
            source: STANDARD.encode(ciphertext),
        })
    }

    /// Open the envelope with the group's x25519 private key.
    pub fn open(&self, group_msg_privkey: &[u8; 32]) -> Result<String, CryptoError> {
        let secret = StaticSecret::from(*group_msg_privkey);
        let ephemeral = PublicKey::from(decode_curve25519_key(&self.ephemeral_pubkey)?);
        let shared = secret.diffie_hellman(&ephemeral);
        let key = Sha256::digest(shared.as_bytes());

        let iv = STANDARD.decode(&self.iv)?;
        let ciphertext = STANDARD.decode(&self.source)?;

        let plaintext = Aes256CbcDec::new_from_slices(key.as_slice(), &iv)
            .map_err(|_| CryptoError::Cipher)?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::Cipher)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_recovers_sender() {
        let group_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let group_public = PublicKey::from(&group_secret);
        let pubkey_b64 = STANDARD.encode(group_public.as_bytes());

        let envelope = SenderEnvelope::seal("alice-uid", &pubkey_b64).unwrap();
        assert_eq!(envelope.version, ENVELOPE_VERSION);

        let opened = envelope.open(group_secret.as_bytes()).unwrap();
        assert_eq!(opened, "alice-uid");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let group_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let group_public = PublicKey::from(&group_secret);
        let pubkey_b64 = STANDARD.encode(group_public.as_bytes());

        let envelope = SenderEnvelope::seal("alice-uid", &pubkey_b64).unwrap();

        let other_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let result = envelope.open(other_secret.as_bytes());
        match result {
            // Padding check almost always fails with a wrong key.
            Err(_) => {}
            // On the off chance the padding is valid, the uid must not match.
            Ok(uid) => assert_ne!(uid, "alice-uid"),
        }
    }

    #[test]
    fn accepts_prefixed_public_key() {
        let group_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let group_public = PublicKey::from(&group_secret);
        let mut prefixed = vec![0x05];
        prefixed.extend_from_slice(group_public.as_bytes());
        let pubkey_b64 = STANDARD.encode(prefixed);

        let envelope = SenderEnvelope::seal("bob-uid", &pubkey_b64).unwrap();
        assert_eq!(envelope.open(group_secret.as_bytes()).unwrap(), "bob-uid");
    }
}
