// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! APNs client: one long-lived HTTP/2 connection per (bundle id,
//! environment), ES256 provider JWTs cached and reissued after 40 minutes.

use std::{collections::HashMap, fs, time::Duration};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::settings::ApnsSettings;

use super::{Notification, ProviderError};

const APNS_PRODUCTION: &str = "https://api.push.apple.com";
const APNS_SANDBOX: &str = "https://api.sandbox.push.apple.com";
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// JWTs must be between 20 and 60 minutes old; reissue after 40.
const JWT_MAX_AGE_SECS: u64 = 40 * 60;
const NOTIFICATION_TTL_SECS: u64 = 86_400;
const CALLING_TTL_SECS: u64 = 15;

#[derive(Debug, Serialize)]
struct ApnsClaims {
    iss: String,
    iat: usize,
}

#[derive(Clone)]
struct ApnsJwt {
    token: String,
    issued_at: u64,
}

struct ApnsEndpoint {
    bundle_id: String,
    base_url: &'static str,
}

/// Result of one APNs submission.
#[derive(Clone, Debug)]
pub struct ApnsSendResult {
    pub status: u16,
    pub apns_id: String,
}

pub struct ApnsClient {
    http: reqwest::Client,
    endpoints: HashMap<String, ApnsEndpoint>,
    key_id: String,
    team_id: String,
    encoding_key: EncodingKey,
    jwt: Mutex<Option<ApnsJwt>>,
}

impl ApnsClient {
    pub fn new(settings: &ApnsSettings) -> anyhow::Result<Self> {
        let private_key = fs::read(&settings.privatekeypath)?;
        let encoding_key = EncodingKey::from_ec_pem(&private_key)?;

        let mut endpoints = HashMap::new();
        for topic in &settings.topics {
            endpoints.insert(
                topic.apn_type.clone(),
                ApnsEndpoint {
                    bundle_id: topic.bundle_id.clone(),
                    base_url: if topic.sandbox {
                        APNS_SANDBOX
                    } else {
                        APNS_PRODUCTION
                    },
                },
            );
        }

        let http = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(READ_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            endpoints,
            key_id: settings.keyid.clone(),
            team_id: settings.teamid.clone(),
            encoding_key,
            jwt: Mutex::new(None),
        })
    }

    /// Return a provider JWT, reissuing it when the cached one is too old.
    async fn issue_jwt(&self) -> Result<String, ProviderError> {
        let mut cached = self.jwt.lock().await;
        let now = embercommon::time::now_secs();
        if let Some(jwt) = cached.as_ref() {
            if now < jwt.issued_at + JWT_MAX_AGE_SECS {
                return Ok(jwt.token.clone());
            }
        }

        let claims = ApnsClaims {
            iss: self.team_id.clone(),
            iat: now as usize,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| ProviderError::Terminal(format!("jwt creation failed: {e}")))?;

        *cached = Some(ApnsJwt {
            token: token.clone(),
            issued_at: now,
        });
        Ok(token)
    }

    /// Submit one notification. `voip` selects the VoIP token and topic.
    pub async fn send(
        &self,
        notification: &Notification,
        badge: Option<u64>,
        voip: bool,
    ) -> Result<ApnsSendResult, ProviderError> {
        let endpoint = self
            .endpoints
            .get(&notification.targets.apn_type)
            .or_else(|| self.endpoints.values().next())
            .ok_or(ProviderError::Unsupported)?;

        let device_token = if voip {
            &notification.targets.voip_apn_id
        } else {
            &notification.targets.apn_id
        };
        if device_token.is_empty() {
            return Err(ProviderError::Unsupported);
        }

        let topic = if voip {
            format!("{}.voip", endpoint.bundle_id)
        } else {
            endpoint.bundle_id.clone()
        };
        let ttl = if voip { CALLING_TTL_SECS } else { NOTIFICATION_TTL_SECS };
        let jwt = self.issue_jwt().await?;

        let body = serde_json::json!({
            "aps": {
                "alert": { "loc-key": "incoming_message" },
                "badge": badge,
                "sound": "default",
                "mutable-content": 1,
            },
            "data": notification.data_payload(),
        });

        let url = format!("{}/3/device/{}", endpoint.base_url, device_token);
        let response = self
            .http
            .post(&url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", topic)
            .header("apns-push-type", if voip { "voip" } else { "alert" })
            .header("apns-priority", "10")
            .header(
                "apns-expiration",
                (embercommon::time::now_secs() + ttl).to_string(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("network error: {e}")))?;

        let status = response.status();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        match status {
            StatusCode::OK => {
                debug!(uid = %notification.uid, %apns_id, "apns accepted");
                Ok(ApnsSendResult {
                    status: status.as_u16(),
                    apns_id,
                })
            }
            // the device token is gone for good
            StatusCode::GONE => {
                let body = response.text().await.unwrap_or_default();
                warn!(uid = %notification.uid, body, "apns token unregistered");
                Err(ProviderError::Terminal(format!("unregistered: {body}")))
            }
            s if s.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Terminal(format!("apns {s}: {body}")))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!("apns {s}: {body}")))
            }
        }
    }
}
