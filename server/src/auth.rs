// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request authentication.
//!
//! Clients authenticate with Basic authorization `uid[.deviceId]:token`
//! (base64). The token is checked against the device's stored HMAC
//! credential; a missing device id means the master device.

use std::{future::Future, pin::Pin};

use actix_web::{FromRequest, HttpRequest, dev::Payload, http::header, web::Data};
use base64::{Engine, engine::general_purpose::STANDARD};
use emberbackend::account::{Account, AccountState, Device, DeviceState};
use embercommon::{MASTER_DEVICE_ID, identifiers::DispatchAddress, identifiers::Uid};
use thiserror::Error;

use crate::services::AppServices;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    MalformedHeader,
    #[error("unknown account or device")]
    Unknown,
    #[error("bad credentials")]
    BadCredentials,
    #[error("account or device not in a usable state")]
    BadState,
    #[error("store error")]
    Store,
}

impl actix_web::ResponseError for AuthError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AuthError::MalformedHeader => actix_web::http::StatusCode::BAD_REQUEST,
            AuthError::Store => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            _ => actix_web::http::StatusCode::UNAUTHORIZED,
        }
    }
}

/// The authenticated caller: account plus the concrete device.
#[derive(Clone, Debug)]
pub struct AuthenticatedDevice {
    pub account: Account,
    pub device: Device,
}

impl AuthenticatedDevice {
    pub fn address(&self) -> DispatchAddress {
        DispatchAddress::new(self.account.uid.clone(), self.device.id)
    }

    pub fn is_master(&self) -> bool {
        self.device.id == MASTER_DEVICE_ID
    }
}

/// Parse `uid[.deviceId]:token` out of a Basic authorization header value.
pub fn parse_basic_credentials(header_value: &str) -> Result<(Uid, u32, String), AuthError> {
    let encoded = header_value
        .strip_prefix("Basic ")
        .ok_or(AuthError::MalformedHeader)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::MalformedHeader)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedHeader)?;
    let (user_part, token) = decoded
        .split_once(':')
        .ok_or(AuthError::MalformedHeader)?;
    if user_part.is_empty() || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    let (uid, device_id) = match user_part.rsplit_once('.') {
        Some((uid, device)) if !uid.is_empty() => {
            let device_id = device.parse().map_err(|_| AuthError::MalformedHeader)?;
            (uid, device_id)
        }
        _ => (user_part, MASTER_DEVICE_ID),
    };
    Ok((Uid::new(uid), device_id, token.to_owned()))
}

/// Authenticate a request's authorization header against the account store.
pub async fn authenticate(
    services: &AppServices,
    header_value: &str,
) -> Result<AuthenticatedDevice, AuthError> {
    let (uid, device_id, token) = parse_basic_credentials(header_value)?;
    let account = services
        .accounts
        .get_account(&uid)
        .await
        .map_err(|_| AuthError::Store)?
        .ok_or(AuthError::Unknown)?;
    if account.state != AccountState::Normal {
        return Err(AuthError::BadState);
    }
    let device = account
        .device(device_id)
        .cloned()
        .ok_or(AuthError::Unknown)?;
    if device.state == DeviceState::Logout {
        return Err(AuthError::BadState);
    }
    if !device.auth.verify(&token) {
        return Err(AuthError::BadCredentials);
    }
    Ok(AuthenticatedDevice { account, device })
}

impl FromRequest for AuthenticatedDevice {
    type Error = AuthError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let header_value = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let services = req.app_data::<Data<AppServices>>().cloned();
        Box::pin(async move {
            let services = services.ok_or(AuthError::Store)?;
            let header_value = header_value.ok_or(AuthError::MalformedHeader)?;
            authenticate(&services, &header_value).await
        })
    }
}

/// Extractor that additionally requires the master device.
#[derive(Clone, Debug)]
pub struct MasterDevice(pub AuthenticatedDevice);

impl FromRequest for MasterDevice {
    type Error = AuthError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let inner = AuthenticatedDevice::from_request(req, payload);
        Box::pin(async move {
            let auth = inner.await?;
            if !auth.is_master() {
                return Err(AuthError::BadState);
            }
            Ok(MasterDevice(auth))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(plain: &str) -> String {
        format!("Basic {}", STANDARD.encode(plain))
    }

    #[test]
    fn parses_uid_with_device_id() {
        let (uid, device_id, token) =
            parse_basic_credentials(&encode("alice.3:tok-123")).unwrap();
        assert_eq!(uid.as_str(), "alice");
        assert_eq!(device_id, 3);
        assert_eq!(token, "tok-123");
    }

    #[test]
    fn missing_device_id_means_master() {
        let (uid, device_id, _) = parse_basic_credentials(&encode("alice:tok")).unwrap();
        assert_eq!(uid.as_str(), "alice");
        assert_eq!(device_id, MASTER_DEVICE_ID);
    }

    #[test]
    fn uid_containing_dots_still_parses() {
        // only the last dot separates the device id
        let (uid, device_id, _) = parse_basic_credentials(&encode("a.b.2:t")).unwrap();
        assert_eq!(uid.as_str(), "a.b");
        assert_eq!(device_id, 2);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_basic_credentials("Bearer zzz").is_err());
        assert!(parse_basic_credentials(&encode("no-colon")).is_err());
        assert!(parse_basic_credentials(&encode(":token")).is_err());
        assert!(parse_basic_credentials(&encode("uid:")).is_err());
    }
}
