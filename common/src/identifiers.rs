// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed identifiers for accounts, devices and dispatch endpoints.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::MASTER_DEVICE_ID;

/// A user id.
///
/// Uids are not free-form: a uid is the url-safe base64 encoding of the
/// SHA-256 of the account public key, so the public key uniquely derives it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Derive the uid from an account public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(URL_SAFE_NO_PAD.encode(digest))
    }

    /// Check that a claimed uid matches the given public key.
    pub fn matches_public_key(&self, public_key: &[u8]) -> bool {
        Self::from_public_key(public_key) == *self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A message endpoint: one device of one account.
///
/// The string form `<uid>:<device_id>` doubles as the name of the cross-node
/// pub/sub channel for the endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchAddress {
    pub uid: Uid,
    pub device_id: u32,
}

impl DispatchAddress {
    pub fn new(uid: Uid, device_id: u32) -> Self {
        Self { uid, device_id }
    }

    /// Address of the account's primary device.
    pub fn master(uid: Uid) -> Self {
        Self::new(uid, MASTER_DEVICE_ID)
    }

    pub fn is_master(&self) -> bool {
        self.device_id == MASTER_DEVICE_ID
    }
}

impl fmt::Display for DispatchAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.device_id)
    }
}

/// Error parsing a [`DispatchAddress`] from its string form.
#[derive(Debug, Error)]
#[error("invalid dispatch address: {0}")]
pub struct InvalidDispatchAddress(String);

impl FromStr for DispatchAddress {
    type Err = InvalidDispatchAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uid, device_id) = s
            .rsplit_once(':')
            .ok_or_else(|| InvalidDispatchAddress(s.to_owned()))?;
        if uid.is_empty() {
            return Err(InvalidDispatchAddress(s.to_owned()));
        }
        let device_id = device_id
            .parse()
            .map_err(|_| InvalidDispatchAddress(s.to_owned()))?;
        Ok(Self {
            uid: Uid::new(uid),
            device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_derivation_is_stable() {
        let key = b"test public key material";
        let uid = Uid::from_public_key(key);
        assert_eq!(uid, Uid::from_public_key(key));
        assert!(uid.matches_public_key(key));
        assert!(!uid.matches_public_key(b"other key"));
    }

    #[test]
    fn address_roundtrip() {
        let addr = DispatchAddress::new(Uid::new("alice"), 3);
        let parsed: DispatchAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("no-device-id".parse::<DispatchAddress>().is_err());
        assert!(":1".parse::<DispatchAddress>().is_err());
        assert!("alice:notanumber".parse::<DispatchAddress>().is_err());
    }
}
