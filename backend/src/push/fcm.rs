// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! FCM client: OAuth2 service-account flow with a cached bearer token, one
//! stateless HTTPS POST per notification.

use std::{
    fs,
    time::{SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::settings::FcmSettings;

use super::{Notification, ProviderError};

#[derive(Debug, Serialize)]
struct FcmClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: usize,
    exp: usize,
}

#[derive(Debug, Deserialize)]
struct OauthSuccessResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OauthErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Clone, Zeroize)]
struct FcmToken {
    token: String,
    expires_at: u64, // Seconds since UNIX_EPOCH
}

impl FcmToken {
    fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Zeroize)]
pub struct ServiceAccount {
    pub project_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    pub token_uri: String,
}

/// Parsed provider reply.
#[derive(Clone, Debug, Default)]
pub struct FcmSendResult {
    pub message_id: Option<String>,
    pub error: Option<String>,
    /// Canonical registration id, if the provider reports one. Logged but
    /// never applied automatically.
    pub canonical_registration_id: Option<String>,
}

pub struct FcmClient {
    http: Client,
    service_account: ServiceAccount,
    token: Mutex<Option<FcmToken>>,
}

impl FcmClient {
    pub fn new(settings: &FcmSettings) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(&settings.path)?;
        let service_account: ServiceAccount = serde_json::from_str(&raw)?;
        Ok(Self {
            http: Client::new(),
            service_account,
            token: Mutex::new(None),
        })
    }

    /// Exchange a service-account JWT for a bearer token, caching it until
    /// expiry.
    async fn issue_token(&self) -> Result<FcmToken, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        let iat = embercommon::time::now_secs() as usize;
        let claims = FcmClaims {
            iss: self.service_account.client_email.clone(),
            scope: "https://www.googleapis.com/auth/firebase.messaging".to_string(),
            aud: self.service_account.token_uri.clone(),
            iat,
            exp: iat + 3600,
        };
        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.service_account.private_key.as_bytes())
            .map_err(|e| ProviderError::Terminal(format!("bad service account key: {e}")))?;
        let jwt = encode(&header, &claims, &encoding_key)
            .map_err(|e| ProviderError::Terminal(format!("jwt creation failed: {e}")))?;

        let response = self
            .http
            .post(&self.service_account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("oauth network error: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        if !status.is_success() {
            let detail = serde_json::from_str::<OauthErrorResponse>(&body)
                .map(|e| format!("{} {}", e.error, e.error_description.unwrap_or_default()))
                .unwrap_or(body);
            return Err(ProviderError::Transient(format!("oauth error: {detail}")));
        }
        let parsed: OauthSuccessResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Transient(format!("oauth parse error: {e}")))?;

        let token = FcmToken {
            token: parsed.access_token,
            expires_at: embercommon::time::now_secs() + parsed.expires_in,
        };
        *cached = Some(token.clone());
        Ok(token)
    }

    pub async fn send(&self, notification: &Notification) -> Result<FcmSendResult, ProviderError> {
        if notification.targets.gcm_id.is_empty() {
            return Err(ProviderError::Unsupported);
        }
        let bearer = self.issue_token().await?;
        let project_id = self
            .service_account
            .project_id
            .as_deref()
            .ok_or_else(|| ProviderError::Terminal("missing project id".into()))?;

        let url = format!("https://fcm.googleapis.com/v1/projects/{project_id}/messages:send");
        let message = serde_json::json!({
            "message": {
                "token": notification.targets.gcm_id,
                "data": {
                    "payload": notification.data_payload().to_string(),
                }
            }
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&bearer.token)
            .json(&message)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("network error: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::OK => {
                let result = parse_send_reply(&body);
                if let Some(canonical) = &result.canonical_registration_id {
                    info!(uid = %notification.uid, canonical, "fcm reported canonical id");
                }
                debug!(uid = %notification.uid, message_id = ?result.message_id, "fcm accepted");
                Ok(result)
            }
            // invalid or unregistered token
            StatusCode::NOT_FOUND => {
                warn!(uid = %notification.uid, body, "fcm token invalid");
                Err(ProviderError::Terminal(format!("invalid token: {body}")))
            }
            s if s.is_client_error() => Err(ProviderError::Terminal(format!("fcm {s}: {body}"))),
            s => Err(ProviderError::Transient(format!("fcm {s}: {body}"))),
        }
    }
}

/// Pull `message_id`/`name`, `error` and `registration_id` out of the
/// provider reply, wherever the API version put them.
fn parse_send_reply(body: &str) -> FcmSendResult {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return FcmSendResult::default();
    };
    let first_result = value
        .get("results")
        .and_then(|r| r.get(0))
        .cloned()
        .unwrap_or(value.clone());
    FcmSendResult {
        message_id: first_result
            .get("message_id")
            .or_else(|| value.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        error: first_result
            .get("error")
            .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string())),
        canonical_registration_id: first_result
            .get("registration_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_reply() {
        let result = parse_send_reply(r#"{"name": "projects/p/messages/123"}"#);
        assert_eq!(result.message_id.as_deref(), Some("projects/p/messages/123"));
        assert!(result.error.is_none());
    }

    #[test]
    fn parses_legacy_reply_with_canonical_id() {
        let result = parse_send_reply(
            r#"{"results": [{"message_id": "m1", "registration_id": "new-token"}]}"#,
        );
        assert_eq!(result.message_id.as_deref(), Some("m1"));
        assert_eq!(result.canonical_registration_id.as_deref(), Some("new-token"));
    }

    #[test]
    fn parses_error_reply() {
        let result = parse_send_reply(r#"{"results": [{"error": "NotRegistered"}]}"#);
        assert_eq!(result.error.as_deref(), Some("NotRegistered"));
    }

    #[test]
    fn garbage_reply_yields_empty_result() {
        let result = parse_send_reply("not json");
        assert!(result.message_id.is_none());
        assert!(result.error.is_none());
    }
}
