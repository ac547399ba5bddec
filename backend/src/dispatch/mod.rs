// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The dispatch fabric.
//!
//! A process-local registry multiplexes real-time messages onto the
//! websocket sessions of this node, keyed by [`DispatchAddress`]. When no
//! local session exists for an address, the message is published on a Redis
//! channel named after the address so a peer node can deliver it; the first
//! local subscriber for an address subscribes that channel, the last one
//! unsubscribes it.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use embercommon::{
    codec,
    identifiers::{DispatchAddress, Uid},
    messages::PubSubMessage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::redis::pubsub::{self, Publisher, PubSubHandle};

/// Revocation handle returned by [`DispatchManager::subscribe`].
pub type ChannelId = u64;

/// What a session can receive from the dispatch fabric.
#[derive(Clone, Debug)]
pub enum SessionMessage {
    Deliver(PubSubMessage),
    /// Force-disconnect the session.
    Kick,
}

struct Subscription {
    channel_id: ChannelId,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<DispatchAddress, Vec<Subscription>>,
}

impl Registry {
    /// Send to every subscription of the address, dropping dead channels.
    fn deliver(&mut self, address: &DispatchAddress, message: &SessionMessage) -> bool {
        let Some(subscriptions) = self.sessions.get_mut(address) else {
            return false;
        };
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.tx.send(message.clone()).is_ok());
        if subscriptions.len() < before {
            debug!(%address, dropped = before - subscriptions.len(), "pruned dead session channels");
        }
        let delivered = !subscriptions.is_empty();
        if subscriptions.is_empty() {
            self.sessions.remove(address);
        }
        delivered
    }
}

/// The process-local pub/sub hub.
pub struct DispatchManager {
    registry: Arc<Mutex<Registry>>,
    next_channel_id: AtomicU64,
    subscriber: PubSubHandle,
    publisher: Publisher,
}

impl DispatchManager {
    /// Build the manager and spawn its cross-node loops on the pub/sub
    /// Redis instance.
    pub fn new(pubsub_client: redis::Client, cancel: CancellationToken) -> Arc<Self> {
        let registry: Arc<Mutex<Registry>> = Arc::default();

        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
        let channels_registry = registry.clone();
        let subscriber = pubsub::spawn_subscriber(
            pubsub_client.clone(),
            incoming_tx,
            move || {
                let registry = channels_registry.lock().expect("registry lock poisoned");
                registry.sessions.keys().map(ToString::to_string).collect()
            },
            cancel.clone(),
        );

        let manager = Arc::new(Self {
            registry,
            next_channel_id: AtomicU64::new(1),
            subscriber,
            publisher: Publisher::new(pubsub_client),
        });

        // Deliver cross-node messages to local sessions only; never
        // re-publish, that would loop.
        let delivery = manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    incoming = incoming_rx.recv() => {
                        let Some(incoming) = incoming else { return };
                        match codec::from_slice::<PubSubMessage>(&incoming.payload) {
                            Ok(message) => {
                                delivery.deliver_local(&message);
                            }
                            Err(e) => {
                                warn!(channel = %incoming.channel, error = %e,
                                    "undecodable cross-node message");
                            }
                        }
                    }
                }
            }
        });

        manager
    }

    /// Register a session channel under an address. Never fails; the same
    /// session may subscribe repeatedly and gets distinct channel ids.
    pub fn subscribe(
        &self,
        address: DispatchAddress,
        tx: mpsc::UnboundedSender<SessionMessage>,
    ) -> ChannelId {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let subscriptions = registry.sessions.entry(address.clone()).or_default();
        let first_for_address = subscriptions.is_empty();
        subscriptions.push(Subscription { channel_id, tx });
        drop(registry);

        if first_for_address {
            self.subscriber.subscribe(address.to_string());
        }
        info!(%address, channel_id, "session subscribed");
        channel_id
    }

    /// Remove one subscription; the last one for an address cancels the
    /// cross-node subscription.
    pub fn unsubscribe(&self, address: &DispatchAddress, channel_id: ChannelId) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let Some(subscriptions) = registry.sessions.get_mut(address) else {
            return;
        };
        subscriptions.retain(|sub| sub.channel_id != channel_id);
        let last_gone = subscriptions.is_empty();
        if last_gone {
            registry.sessions.remove(address);
        }
        drop(registry);

        if last_gone {
            self.subscriber.unsubscribe(address.to_string());
        }
        info!(%address, channel_id, "session unsubscribed");
    }

    fn deliver_local(&self, message: &PubSubMessage) -> bool {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.deliver(&message.address, &SessionMessage::Deliver(message.clone()))
    }

    /// Deliver to local sessions; if none accepted it, publish on the
    /// address channel for a peer node. Returns whether a local session
    /// accepted the message.
    pub async fn publish(&self, message: PubSubMessage) -> bool {
        if self.deliver_local(&message) {
            return true;
        }
        let channel = message.address.to_string();
        match codec::to_vec(&message) {
            Ok(payload) => {
                if let Err(e) = self.publisher.publish(&channel, &payload).await {
                    warn!(%channel, error = %e, "cross-node publish failed");
                }
            }
            Err(e) => warn!(%channel, error = %e, "could not encode message"),
        }
        false
    }

    /// Force-disconnect every session of an address.
    pub fn kick(&self, address: &DispatchAddress) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.deliver(address, &SessionMessage::Kick);
    }

    /// Addresses of this uid with a live local session.
    pub fn local_addresses_for(&self, uid: &Uid) -> Vec<DispatchAddress> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry
            .sessions
            .keys()
            .filter(|address| &address.uid == uid)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use embercommon::messages::PubSubKind;

    use super::*;

    fn test_manager() -> Arc<DispatchManager> {
        // Nothing in these tests reaches Redis; the lazy connections stay
        // unconnected.
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        DispatchManager::new(client, CancellationToken::new())
    }

    fn message(address: &DispatchAddress, content: &[u8]) -> PubSubMessage {
        PubSubMessage {
            address: address.clone(),
            kind: PubSubKind::GroupMessage,
            content: content.to_vec(),
        }
    }

    #[tokio::test]
    async fn local_publish_delivers_in_order() {
        let manager = test_manager();
        let address = DispatchAddress::new(Uid::new("u1"), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(address.clone(), tx);

        for i in 0..5u8 {
            assert!(manager.publish(message(&address, &[i])).await);
        }
        for i in 0..5u8 {
            match rx.recv().await.unwrap() {
                SessionMessage::Deliver(msg) => assert_eq!(msg.content, vec![i]),
                SessionMessage::Kick => panic!("unexpected kick"),
            }
        }
    }

    #[tokio::test]
    async fn every_subscriber_of_the_address_receives() {
        let manager = test_manager();
        let address = DispatchAddress::new(Uid::new("u1"), 1);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.subscribe(address.clone(), tx1);
        manager.subscribe(address.clone(), tx2);

        assert!(manager.publish(message(&address, b"hello")).await);
        assert!(matches!(rx1.recv().await, Some(SessionMessage::Deliver(_))));
        assert!(matches!(rx2.recv().await, Some(SessionMessage::Deliver(_))));
    }

    #[tokio::test]
    async fn unsubscribed_channel_no_longer_receives() {
        let manager = test_manager();
        let address = DispatchAddress::new(Uid::new("u1"), 1);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id1 = manager.subscribe(address.clone(), tx1);
        manager.subscribe(address.clone(), tx2);

        manager.unsubscribe(&address, id1);
        assert!(manager.publish(message(&address, b"x")).await);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn kick_reaches_all_sessions() {
        let manager = test_manager();
        let address = DispatchAddress::new(Uid::new("u1"), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(address.clone(), tx);

        manager.kick(&address);
        assert!(matches!(rx.recv().await, Some(SessionMessage::Kick)));
    }

    #[tokio::test]
    async fn local_addresses_filter_by_uid() {
        let manager = test_manager();
        let a1 = DispatchAddress::new(Uid::new("u1"), 1);
        let a2 = DispatchAddress::new(Uid::new("u1"), 2);
        let b1 = DispatchAddress::new(Uid::new("u2"), 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.subscribe(a1.clone(), tx.clone());
        manager.subscribe(a2.clone(), tx.clone());
        manager.subscribe(b1, tx);

        let mut addresses = manager.local_addresses_for(&Uid::new("u1"));
        addresses.sort_by_key(|a| a.device_id);
        assert_eq!(addresses, vec![a1, a2]);
    }
}
