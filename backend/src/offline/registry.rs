// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline-server registry and cross-node notification dispatch.
//!
//! Every offline node announces itself by keeping a pub/sub channel named
//! `offlinesvr_<host:port>_<pushTypes>` alive with periodic keepalive
//! publishes; peers discover each other with `PUBSUB CHANNELS offlinesvr_*`.
//! The dispatcher round-robins notification batches to a discovered server
//! over the internal HTTP surface, falling back to the local push service.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{push::Notification, push::PushService, redis::pubsub::Publisher};

const CHANNEL_PREFIX: &str = "offlinesvr_";
const KEEPALIVE_MESSAGE: &[u8] = b"keep alive";
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of `POST /v1/offline/notifications`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub notifications: Vec<Notification>,
    /// Notification ids whose VoIP resend should be aborted, e.g. after a
    /// call ack.
    #[serde(default)]
    pub cancel_ids: Vec<String>,
}

/// Parse one discovered channel name into `(host:port, push types)`.
fn parse_channel(channel: &str) -> Option<(String, Vec<String>)> {
    let rest = channel.strip_prefix(CHANNEL_PREFIX)?;
    let (addr, types) = rest.split_once('_')?;
    if addr.is_empty() || types.is_empty() {
        return None;
    }
    Some((
        addr.to_owned(),
        types.split(',').map(str::to_owned).collect(),
    ))
}

pub struct OfflineServerRegistry {
    publisher: Arc<Publisher>,
    /// Channel this node announces itself on; `None` for discovery-only
    /// consumers.
    register_channel: Option<String>,
    local_addr: String,
    servers: RwLock<HashMap<String, Vec<String>>>,
    round_robin: AtomicUsize,
}

impl OfflineServerRegistry {
    pub fn new(
        publisher: Arc<Publisher>,
        local_addr: String,
        push_types: &[String],
    ) -> Arc<Self> {
        let register_channel = if push_types.is_empty() {
            None
        } else {
            Some(format!(
                "{CHANNEL_PREFIX}{local_addr}_{}",
                push_types.join(",")
            ))
        };
        Arc::new(Self {
            publisher,
            register_channel,
            local_addr,
            servers: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Spawn the keepalive/refresh loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                registry.publish_keepalive().await;
                registry.refresh_server_list().await;
            }
        });
    }

    async fn publish_keepalive(&self) {
        let Some(channel) = &self.register_channel else {
            return;
        };
        if let Err(e) = self.publisher.publish(channel, KEEPALIVE_MESSAGE).await {
            warn!(channel, error = %e, "offline keepalive publish failed");
        }
    }

    async fn refresh_server_list(&self) {
        let channels = match self
            .publisher
            .channels(&format!("{CHANNEL_PREFIX}*"))
            .await
        {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "offline server discovery failed");
                return;
            }
        };

        let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
        let mut seen = Vec::new();
        for channel in &channels {
            let Some((addr, types)) = parse_channel(channel) else {
                warn!(channel, "invalid offline server descriptor");
                continue;
            };
            if seen.contains(&addr) {
                continue;
            }
            seen.push(addr.clone());
            for push_type in types {
                by_type.entry(push_type).or_default().push(addr.clone());
            }
        }

        let mut servers = self.servers.write().expect("server table lock poisoned");
        if servers.len() != by_type.len() {
            info!(servers = seen.len(), "offline server list changed");
        }
        *servers = by_type;
    }

    /// Round-robin pick among the servers handling a push type.
    pub fn pick_server(&self, push_type: &str) -> Option<String> {
        let servers = self.servers.read().expect("server table lock poisoned");
        let list = servers.get(push_type)?;
        if list.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % list.len();
        Some(list[index].clone())
    }

    #[cfg(test)]
    fn set_servers(&self, table: HashMap<String, Vec<String>>) {
        *self.servers.write().unwrap() = table;
    }
}

/// Push type string a notification is dispatched under.
pub fn notification_push_type(notification: &Notification) -> &'static str {
    let targets = &notification.targets;
    if !targets.apn_id.is_empty() || !targets.voip_apn_id.is_empty() {
        "apns"
    } else if !targets.umeng_id.is_empty() {
        "umeng"
    } else if !targets.gcm_id.is_empty() {
        "fcm"
    } else {
        "none"
    }
}

/// Hands notification batches to the node responsible for their push type.
pub struct OfflineDispatcher {
    registry: Arc<OfflineServerRegistry>,
    push: Arc<PushService>,
    http: reqwest::Client,
}

impl OfflineDispatcher {
    pub fn new(registry: Arc<OfflineServerRegistry>, push: Arc<PushService>) -> Self {
        Self {
            registry,
            push,
            http: reqwest::Client::builder()
                .timeout(DISPATCH_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// Submit a batch: locally when this node serves the push type,
    /// otherwise to a peer over the internal endpoint. Peer failure falls
    /// back to local submission rather than dropping the batch.
    pub async fn dispatch(&self, notifications: Vec<Notification>) {
        let mut by_server: HashMap<Option<String>, Vec<Notification>> = HashMap::new();
        for notification in notifications {
            let push_type = notification_push_type(&notification);
            if push_type == "none" {
                debug!(uid = %notification.uid, "not push capable, dropping");
                continue;
            }
            let server = self
                .registry
                .pick_server(push_type)
                .filter(|addr| addr != self.registry.local_addr());
            by_server.entry(server).or_default().push(notification);
        }

        for (server, batch) in by_server {
            match server {
                None => self.submit_locally(batch).await,
                Some(addr) => {
                    if let Err(e) = self.post_batch(&addr, &batch).await {
                        warn!(server = %addr, error = %e, "peer dispatch failed, submitting locally");
                        self.submit_locally(batch).await;
                    }
                }
            }
        }
    }

    async fn submit_locally(&self, batch: Vec<Notification>) {
        for notification in batch {
            self.push.send_notification(notification).await;
        }
    }

    async fn post_batch(
        &self,
        server: &str,
        batch: &[Notification],
    ) -> Result<(), reqwest::Error> {
        let url = format!("http://{server}/v1/offline/notifications");
        self.http
            .post(&url)
            .json(&NotificationBatch {
                notifications: batch.to_vec(),
                cancel_ids: Vec::new(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_channel() {
        let (addr, types) = parse_channel("offlinesvr_10.0.0.5:8080_apns,fcm").unwrap();
        assert_eq!(addr, "10.0.0.5:8080");
        assert_eq!(types, vec!["apns", "fcm"]);
    }

    #[test]
    fn rejects_malformed_channels() {
        assert!(parse_channel("other_10.0.0.5:8080_apns").is_none());
        assert!(parse_channel("offlinesvr_").is_none());
        assert!(parse_channel("offlinesvr_addr-without-types").is_none());
    }

    #[tokio::test]
    async fn round_robin_cycles_over_servers() {
        let publisher = Arc::new(Publisher::new(
            redis::Client::open("redis://127.0.0.1:1/").unwrap(),
        ));
        let registry = OfflineServerRegistry::new(publisher, "me:1".into(), &["apns".into()]);
        registry.set_servers(HashMap::from([(
            "apns".to_string(),
            vec!["a:1".to_string(), "b:1".to_string()],
        )]));

        let picks: Vec<String> = (0..4)
            .map(|_| registry.pick_server("apns").unwrap())
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "a:1", "b:1"]);
        assert!(registry.pick_server("fcm").is_none());
    }
}
