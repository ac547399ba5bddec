// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Provider-pluggable push fan-out.
//!
//! Submissions go onto a work queue served by a small worker pool; each
//! worker selects a provider by device capability and sends with retries.
//! Provider failures are recovered here and never surfaced to the caller.

pub mod apns;
pub mod fcm;
pub mod notification;
pub mod qos;
pub mod retry;
pub mod umeng;

pub use notification::{Notification, NotificationClass, PushTargets};

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    redis::{PartitionKey, RedisRouter, keys},
    settings::Settings,
};

use self::{
    apns::ApnsClient,
    fcm::FcmClient,
    qos::QosManager,
    retry::{RetryPolicy, run_with_retry},
    umeng::{UmengClient, UmengTarget},
};

/// Classified provider failure; the class decides retry behavior.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Worth retrying: network trouble, provider 5xx.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Retrying cannot help: provider 4xx, invalid token.
    #[error("terminal provider error: {0}")]
    Terminal(String),
    /// The operation is not supported for this device.
    #[error("operation not supported")]
    Unsupported,
}

/// Which provider a notification is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    ApnsVoip,
    Apns,
    Umeng,
    Fcm,
}

/// Provider selection by device capability. Calling-class pushes prefer the
/// VoIP channel; with no usable registration at all the notification is
/// dropped.
pub fn select_provider(
    targets: &PushTargets,
    class: NotificationClass,
    apns_enabled: bool,
    umeng_enabled: bool,
    fcm_enabled: bool,
) -> Option<ProviderKind> {
    if apns_enabled && class == NotificationClass::Calling && !targets.voip_apn_id.is_empty() {
        return Some(ProviderKind::ApnsVoip);
    }
    if apns_enabled && !targets.apn_id.is_empty() {
        return Some(ProviderKind::Apns);
    }
    if umeng_enabled && !targets.umeng_id.is_empty() {
        return Some(ProviderKind::Umeng);
    }
    if fcm_enabled && !targets.gcm_id.is_empty() {
        return Some(ProviderKind::Fcm);
    }
    None
}

struct Providers {
    apns: Option<ApnsClient>,
    fcm: Option<FcmClient>,
    umeng: Option<UmengClient>,
}

enum Job {
    Initial(Notification),
    Resend(Notification),
    /// Topic broadcast over the third-party provider.
    Broadcast { topic: String, notification: Notification },
}

/// The push service handle; submission never blocks on provider I/O.
pub struct PushService {
    work_tx: mpsc::Sender<Job>,
    qos: Arc<QosManager>,
}

impl PushService {
    pub fn new(
        settings: &Settings,
        router: Arc<RedisRouter>,
        stop: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let providers = Arc::new(Providers {
            apns: settings
                .apns
                .as_ref()
                .map(ApnsClient::new)
                .transpose()?,
            fcm: settings.fcm.as_ref().map(FcmClient::new).transpose()?,
            umeng: settings.umeng.as_ref().map(UmengClient::new),
        });

        let (resend_tx, mut resend_rx) = mpsc::unbounded_channel();
        let (max_resend, resend_delay) = settings
            .apns
            .as_ref()
            .map(|a| (a.max_resend_count, Duration::from_millis(a.resend_delay_ms)))
            .unwrap_or((0, Duration::from_secs(5)));
        let qos = Arc::new(QosManager::new(max_resend, resend_delay, resend_tx));

        let (work_tx, work_rx) = mpsc::channel::<Job>(1024);
        let shared_rx = Arc::new(Mutex::new(work_rx));

        // resends re-enter the provider path without re-arming the QoS
        let resend_work_tx = work_tx.clone();
        let resend_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = resend_stop.cancelled() => return,
                    notification = resend_rx.recv() => {
                        let Some(notification) = notification else { return };
                        if resend_work_tx.send(Job::Resend(notification)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let service = Arc::new(Self {
            work_tx,
            qos: qos.clone(),
        });

        for worker in 0..settings.push.concurrency.max(1) {
            let providers = providers.clone();
            let router = router.clone();
            let qos = qos.clone();
            let stop = stop.clone();
            let shared_rx = shared_rx.clone();
            tokio::spawn(async move {
                debug!(worker, "push worker started");
                loop {
                    let job = tokio::select! {
                        _ = stop.cancelled() => return,
                        job = async { shared_rx.lock().await.recv().await } => {
                            match job {
                                Some(job) => job,
                                None => return,
                            }
                        }
                    };
                    handle_job(&providers, &router, &qos, &stop, job).await;
                }
            });
        }

        info!(concurrency = settings.push.concurrency, "push service started");
        Ok(service)
    }

    /// Queue a notification for delivery. Returns once it is accepted by
    /// the work queue, not once it is delivered.
    pub async fn send_notification(&self, notification: Notification) {
        if self.work_tx.send(Job::Initial(notification)).await.is_err() {
            warn!("push worker pool is gone, dropping notification");
        }
    }

    /// Broadcast to everyone subscribed to a topic (third-party provider
    /// groupcast).
    pub async fn broadcast_notification(&self, topic: String, notification: Notification) {
        if self
            .work_tx
            .send(Job::Broadcast {
                topic,
                notification,
            })
            .await
            .is_err()
        {
            warn!("push worker pool is gone, dropping broadcast");
        }
    }

    /// Cancel the VoIP QoS resend of a notification, e.g. on call ack.
    pub fn cancel_voip_resend(&self, notification_id: &str) {
        self.qos.cancel(notification_id);
    }
}

async fn handle_job(
    providers: &Providers,
    router: &RedisRouter,
    qos: &QosManager,
    stop: &CancellationToken,
    job: Job,
) {
    let (notification, is_resend) = match job {
        Job::Initial(n) => (n, false),
        Job::Resend(n) => (n, true),
        Job::Broadcast {
            topic,
            notification,
        } => {
            let Some(umeng) = providers.umeng.as_ref() else {
                debug!("broadcast without third-party provider, dropping");
                return;
            };
            let policy = RetryPolicy::default();
            let target = UmengTarget::Groupcast(topic);
            let outcome =
                run_with_retry(policy, stop, || umeng.send(&notification, target.clone())).await;
            if let Err(e) = outcome {
                warn!(uid = %notification.uid, error = %e, "broadcast failed");
            }
            return;
        }
    };

    let Some(kind) = select_provider(
        &notification.targets,
        notification.class,
        providers.apns.is_some(),
        providers.umeng.is_some(),
        providers.fcm.is_some(),
    ) else {
        debug!(uid = %notification.uid, "no usable push registration, dropping");
        return;
    };

    let policy = RetryPolicy::default();
    let outcome = match kind {
        ProviderKind::Apns | ProviderKind::ApnsVoip => {
            let apns = providers.apns.as_ref().expect("selection implies apns");
            let voip = kind == ProviderKind::ApnsVoip;
            let badge = next_badge(router, &notification).await;
            let result = run_with_retry(policy, stop, || apns.send(&notification, badge, voip))
                .await
                .map(|_| ());
            if result.is_ok() && voip && !is_resend {
                qos.schedule_resend(notification.clone());
            }
            result
        }
        ProviderKind::Umeng => {
            let umeng = providers.umeng.as_ref().expect("selection implies umeng");
            let target = UmengTarget::Unicast(notification.targets.umeng_id.clone());
            run_with_retry(policy, stop, || umeng.send(&notification, target.clone()))
                .await
                .map(|_| ())
        }
        ProviderKind::Fcm => {
            let fcm = providers.fcm.as_ref().expect("selection implies fcm");
            run_with_retry(policy, stop, || fcm.send(&notification))
                .await
                .map(|_| ())
        }
    };

    match outcome {
        Ok(()) => {
            info!(uid = %notification.uid, gid = notification.gid, mid = notification.mid,
                ?kind, "push submitted");
        }
        Err(e) => {
            warn!(uid = %notification.uid, gid = notification.gid, mid = notification.mid,
                ?kind, error = %e, "push failed");
        }
    }
}

/// Bump the cluster-wide badge counter for the target user. Badge loss is
/// tolerable; the push still goes out without one.
async fn next_badge(router: &RedisRouter, notification: &Notification) -> Option<u64> {
    let key = keys::badge_key(&notification.uid);
    match router.incr(PartitionKey::Key(&key), &key).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(uid = %notification.uid, error = %e, "badge incr failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(apn: &str, voip: &str, umeng: &str, gcm: &str) -> PushTargets {
        PushTargets {
            apn_id: apn.into(),
            voip_apn_id: voip.into(),
            umeng_id: umeng.into(),
            gcm_id: gcm.into(),
            ..Default::default()
        }
    }

    #[test]
    fn calling_class_prefers_voip_channel() {
        let t = targets("apn", "voip", "umeng", "gcm");
        assert_eq!(
            select_provider(&t, NotificationClass::Calling, true, true, true),
            Some(ProviderKind::ApnsVoip)
        );
        assert_eq!(
            select_provider(&t, NotificationClass::Normal, true, true, true),
            Some(ProviderKind::Apns)
        );
    }

    #[test]
    fn provider_order_is_apns_umeng_fcm() {
        assert_eq!(
            select_provider(
                &targets("", "", "umeng", "gcm"),
                NotificationClass::Normal,
                true,
                true,
                true
            ),
            Some(ProviderKind::Umeng)
        );
        assert_eq!(
            select_provider(
                &targets("", "", "", "gcm"),
                NotificationClass::Normal,
                true,
                true,
                true
            ),
            Some(ProviderKind::Fcm)
        );
    }

    #[test]
    fn no_registration_drops_silently() {
        assert_eq!(
            select_provider(
                &targets("", "", "", ""),
                NotificationClass::Normal,
                true,
                true,
                true
            ),
            None
        );
    }

    #[test]
    fn disabled_provider_falls_through() {
        // apns configured off: an apn-only device cannot be reached
        assert_eq!(
            select_provider(
                &targets("apn", "", "", "gcm"),
                NotificationClass::Normal,
                false,
                true,
                true
            ),
            Some(ProviderKind::Fcm)
        );
    }
}
