// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Long-lived Redis pub/sub subscriber loop with automatic reconnect.
//!
//! Commands (subscribe/unsubscribe) arrive over a channel, incoming messages
//! leave over another. On connection loss the loop backs off, reconnects and
//! re-subscribes everything the owner still cares about.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Publishing half of the pub/sub Redis: a lazily created connection shared
/// by everything that publishes on this instance.
pub struct Publisher {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<redis::aio::ConnectionManager>>,
}

impl Publisher {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn manager(&self) -> Result<redis::aio::ConnectionManager, redis::RedisError> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = redis::aio::ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// `PUBLISH channel payload`; returns the receiver count.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, redis::RedisError> {
        let mut conn = self.manager().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
    }

    /// `PUBSUB CHANNELS pattern`; used for peer discovery.
    pub async fn channels(&self, pattern: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.manager().await?;
        redis::cmd("PUBSUB")
            .arg("CHANNELS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
    }
}

/// A message received on a subscribed channel.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

/// Handle to a running subscriber loop. Dropping every handle stops the
/// loop.
#[derive(Clone, Debug)]
pub struct PubSubHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl PubSubHandle {
    pub fn subscribe(&self, channel: impl Into<String>) {
        if self.command_tx.send(Command::Subscribe(channel.into())).is_err() {
            error!("pubsub listener task is gone");
        }
    }

    pub fn unsubscribe(&self, channel: impl Into<String>) {
        if self
            .command_tx
            .send(Command::Unsubscribe(channel.into()))
            .is_err()
        {
            error!("pubsub listener task is gone");
        }
    }
}

/// Spawn the subscriber loop.
///
/// `current_channels` is consulted after every reconnect to restore the
/// subscription set.
pub fn spawn_subscriber<F>(
    client: redis::Client,
    out_tx: mpsc::UnboundedSender<IncomingMessage>,
    current_channels: F,
    cancel: CancellationToken,
) -> PubSubHandle
where
    F: Fn() -> Vec<String> + Send + 'static,
{
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        'reconnect: loop {
            if cancel.is_cancelled() {
                return;
            }

            let pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(error = %e, "pubsub connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue 'reconnect,
                    }
                }
            };
            let (mut sink, mut stream) = pubsub.split();

            for channel in current_channels() {
                if let Err(e) = sink.subscribe(&channel).await {
                    warn!(channel, error = %e, "re-subscribe failed, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue 'reconnect;
                }
            }
            info!("pubsub subscriber connected");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            return; // all handles dropped
                        };
                        let result = match &command {
                            Command::Subscribe(ch) => sink.subscribe(ch).await,
                            Command::Unsubscribe(ch) => sink.unsubscribe(ch).await,
                        };
                        if let Err(e) = result {
                            warn!(?command, error = %e, "pubsub command failed, reconnecting");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue 'reconnect;
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let incoming = IncomingMessage {
                                    channel: msg.get_channel_name().to_owned(),
                                    payload: msg.get_payload_bytes().to_vec(),
                                };
                                if out_tx.send(incoming).is_err() {
                                    return; // receiver gone
                                }
                            }
                            None => {
                                warn!("pubsub connection lost, reconnecting");
                                tokio::time::sleep(RECONNECT_DELAY).await;
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    });

    PubSubHandle { command_tx }
}
