// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Leader lease for the offline scan.
//!
//! At most one node in the deployment runs the scan. Acquisition is an
//! atomic `SET NX EX`; renewal re-checks the stored holder and pushes the
//! expiry out. The TTL must stay well under the tolerated offline-delivery
//! delay so a crashed leader is replaced quickly.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    redis::{PartitionKey, RedisRouter, keys::OFFLINE_LEASE},
    settings::OfflineSettings,
};

/// Shared view of the lease state.
#[derive(Clone, Debug, Default)]
pub struct LeaseHandle {
    is_master: Arc<AtomicBool>,
}

impl LeaseHandle {
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Relaxed)
    }
}

pub struct MasterLeaseAgent {
    router: Arc<RedisRouter>,
    node_id: String,
    ttl_secs: u64,
    renew_interval: Duration,
    handle: LeaseHandle,
}

impl MasterLeaseAgent {
    pub fn new(router: Arc<RedisRouter>, node_id: String, settings: &OfflineSettings) -> Self {
        Self {
            router,
            node_id,
            ttl_secs: settings.lease_ttl_secs,
            renew_interval: Duration::from_secs(settings.lease_renew_secs),
            handle: LeaseHandle::default(),
        }
    }

    pub fn handle(&self) -> LeaseHandle {
        self.handle.clone()
    }

    /// Spawn the acquire/renew loop. `on_lost` fires when a held lease is
    /// observed under another holder.
    pub fn spawn<F>(self, cancel: CancellationToken, on_lost: F)
    where
        F: Fn() + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.release().await;
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if self.handle.is_master() {
                    if !self.renew().await {
                        self.handle.is_master.store(false, Ordering::Relaxed);
                        warn!(node = %self.node_id, "offline lease lost");
                        on_lost();
                    }
                } else if self.try_acquire().await {
                    self.handle.is_master.store(true, Ordering::Relaxed);
                    info!(node = %self.node_id, "offline lease acquired");
                }
            }
        });
    }

    async fn try_acquire(&self) -> bool {
        match self
            .router
            .set_nx_ex(
                PartitionKey::Key(OFFLINE_LEASE),
                OFFLINE_LEASE,
                &self.node_id,
                self.ttl_secs,
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "lease acquire failed");
                false
            }
        }
    }

    /// Keep the lease only while we are still the stored holder.
    async fn renew(&self) -> bool {
        let holder = match self
            .router
            .get(PartitionKey::Key(OFFLINE_LEASE), OFFLINE_LEASE)
            .await
        {
            Ok(holder) => holder,
            Err(e) => {
                warn!(error = %e, "lease read failed");
                return false;
            }
        };
        if holder.as_deref() != Some(self.node_id.as_str()) {
            return false;
        }
        match self
            .router
            .expire(PartitionKey::Key(OFFLINE_LEASE), OFFLINE_LEASE, self.ttl_secs)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, "lease refresh failed");
                false
            }
        }
    }

    /// Drop the lease on clean shutdown so a peer can take over without
    /// waiting out the TTL.
    async fn release(&self) {
        if !self.handle.is_master() {
            return;
        }
        let holder = self
            .router
            .get(PartitionKey::Key(OFFLINE_LEASE), OFFLINE_LEASE)
            .await;
        if let Ok(Some(holder)) = holder {
            if holder == self.node_id {
                let _ = self
                    .router
                    .del(PartitionKey::Key(OFFLINE_LEASE), OFFLINE_LEASE)
                    .await;
            }
        }
        self.handle.is_master.store(false, Ordering::Relaxed);
    }
}
