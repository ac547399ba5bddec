// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Binary codec for websocket frames and cross-node pub/sub payloads.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error while encoding or decoding a wire value.
#[derive(Debug, Error)]
pub enum Error {
    #[error("ciborium encode error: {0}")]
    Encode(String),
    #[error("ciborium decode error: {0}")]
    Decode(String),
}

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    ciborium::de::from_reader(bytes).map_err(|e| Error::Decode(e.to_string()))
}
