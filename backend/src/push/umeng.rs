// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Third-party Android push client (umeng-style): MD5-signed JSON POST,
//! supporting unicast, listcast and groupcast.

use md5::{Digest, Md5};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::settings::UmengSettings;

use super::{Notification, ProviderError};

const SEND_URL: &str = "http://msg.umeng.com/api/send";

/// Upper bound the provider enforces on one listcast.
pub const MAX_LISTCAST_TOKENS: usize = 500;

/// How one submission addresses devices.
#[derive(Clone, Debug)]
pub enum UmengTarget {
    /// One device token.
    Unicast(String),
    /// Up to [`MAX_LISTCAST_TOKENS`] device tokens.
    Listcast(Vec<String>),
    /// Everyone subscribed to a topic tag.
    Groupcast(String),
}

#[derive(Clone, Debug, Default)]
pub struct UmengSendResult {
    pub msg_id: String,
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
struct SendReply {
    ret: String,
    #[serde(default)]
    data: SendReplyData,
}

#[derive(Debug, Default, Deserialize)]
struct SendReplyData {
    #[serde(default)]
    msg_id: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_msg: String,
}

pub struct UmengClient {
    http: Client,
    app_key: String,
    app_master_secret: String,
}

impl UmengClient {
    pub fn new(settings: &UmengSettings) -> Self {
        Self {
            http: Client::new(),
            app_key: settings.app_key.clone(),
            app_master_secret: settings.app_master_secret.clone(),
        }
    }

    /// MD5 of `POST<url><body><app_master_secret>`, lowercase hex.
    fn sign(&self, body: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update("POST");
        hasher.update(SEND_URL);
        hasher.update(body);
        hasher.update(&self.app_master_secret);
        hex::encode(hasher.finalize())
    }

    pub async fn send(
        &self,
        notification: &Notification,
        target: UmengTarget,
    ) -> Result<UmengSendResult, ProviderError> {
        let (cast_type, target_field, target_value) = match &target {
            UmengTarget::Unicast(token) => {
                ("unicast", "device_tokens", serde_json::json!(token))
            }
            UmengTarget::Listcast(tokens) => {
                if tokens.len() > MAX_LISTCAST_TOKENS {
                    return Err(ProviderError::Terminal(format!(
                        "listcast of {} tokens exceeds the limit",
                        tokens.len()
                    )));
                }
                ("listcast", "device_tokens", serde_json::json!(tokens.join(",")))
            }
            UmengTarget::Groupcast(topic) => (
                "groupcast",
                "filter",
                serde_json::json!({
                    "where": { "and": [ { "tag": topic } ] }
                }),
            ),
        };

        let mut body = serde_json::json!({
            "appkey": self.app_key,
            "timestamp": embercommon::time::now_millis().to_string(),
            "type": cast_type,
            "payload": {
                "display_type": "message",
                "body": {
                    "custom": notification.data_payload(),
                }
            },
            "production_mode": "true",
        });
        body[target_field] = target_value;
        let body = body.to_string();

        let url = format!("{}?sign={}", SEND_URL, self.sign(&body));
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("network error: {e}")))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("umeng {status}: {text}")));
        }

        let reply: SendReply = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("unparseable reply: {e}")))?;
        if reply.ret == "SUCCESS" {
            debug!(uid = %notification.uid, msg_id = %reply.data.msg_id, "umeng accepted");
            Ok(UmengSendResult {
                msg_id: reply.data.msg_id,
                task_id: reply.data.task_id,
            })
        } else {
            warn!(
                uid = %notification.uid,
                error_code = %reply.data.error_code,
                error_msg = %reply.data.error_msg,
                "umeng rejected"
            );
            Err(ProviderError::Terminal(format!(
                "umeng error {}: {}",
                reply.data.error_code, reply.data.error_msg
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use embercommon::identifiers::Uid;

    use crate::push::PushTargets;

    use super::*;

    fn client() -> UmengClient {
        UmengClient::new(&UmengSettings {
            app_key: "key".into(),
            app_master_secret: "secret".into(),
        })
    }

    #[test]
    fn signature_is_md5_of_method_url_body_secret() {
        let client = client();
        let body = r#"{"appkey":"key"}"#;
        let expected = {
            let mut hasher = Md5::new();
            hasher.update(format!("POST{SEND_URL}{body}secret"));
            hex::encode(hasher.finalize())
        };
        assert_eq!(client.sign(body), expected);
    }

    #[tokio::test]
    async fn oversized_listcast_is_rejected_before_any_io() {
        let client = client();
        let notification = Notification::new(Uid::new("u1"), 1, 2, PushTargets::default());
        let tokens = vec!["t".to_string(); MAX_LISTCAST_TOKENS + 1];
        let result = client.send(&notification, UmengTarget::Listcast(tokens)).await;
        assert!(matches!(result, Err(ProviderError::Terminal(_))));
    }
}
