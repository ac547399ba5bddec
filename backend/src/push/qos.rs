// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! VoIP QoS resend.
//!
//! A successful VoIP submission is resent on a fixed schedule to tolerate
//! iOS call-UI races. The resend stops when the application layer acks the
//! call or the configured resend count is exhausted, whichever comes first.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Notification;

struct PendingResend {
    generation: u64,
    token: CancellationToken,
}

pub struct QosManager {
    max_resend_count: u32,
    resend_delay: Duration,
    resend_tx: mpsc::UnboundedSender<Notification>,
    generation: AtomicU64,
    pending: Arc<Mutex<HashMap<String, PendingResend>>>,
}

impl QosManager {
    /// `resend_tx` feeds resends back into the provider send path.
    pub fn new(
        max_resend_count: u32,
        resend_delay: Duration,
        resend_tx: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            max_resend_count,
            resend_delay,
            resend_tx,
            generation: AtomicU64::new(0),
            pending: Arc::default(),
        }
    }

    /// Schedule resends for a successfully submitted VoIP notification.
    /// Rescheduling the same notification id replaces the previous
    /// schedule.
    pub fn schedule_resend(&self, notification: Notification) {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock().expect("qos pending lock poisoned");
            if let Some(previous) = pending.insert(
                notification.id.clone(),
                PendingResend {
                    generation,
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        let max = self.max_resend_count;
        let delay = self.resend_delay;
        let resend_tx = self.resend_tx.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            for round in 0..max {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(id = %notification.id, round, "voip resend cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        if resend_tx.send(notification.clone()).is_err() {
                            break;
                        }
                    }
                }
            }
            // only remove the entry this task owns; the id may have been
            // rescheduled meanwhile
            let mut pending = pending.lock().expect("qos pending lock poisoned");
            if pending
                .get(&notification.id)
                .is_some_and(|p| p.generation == generation)
            {
                pending.remove(&notification.id);
            }
        });
    }

    /// Abort a pending resend, e.g. because the callee acked the call.
    pub fn cancel(&self, notification_id: &str) {
        let entry = self
            .pending
            .lock()
            .expect("qos pending lock poisoned")
            .remove(notification_id);
        if let Some(entry) = entry {
            entry.token.cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("qos pending lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use embercommon::identifiers::Uid;

    use crate::push::{NotificationClass, PushTargets};

    use super::*;

    fn notification(id: &str) -> Notification {
        Notification {
            id: id.into(),
            uid: Uid::new("u1"),
            gid: 1,
            mid: 2,
            class: NotificationClass::Calling,
            targets: PushTargets::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resends_until_count_exhausted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let qos = QosManager::new(3, Duration::from_millis(100), tx);
        qos.schedule_resend(notification("n1"));

        for _ in 0..3 {
            let resent = rx.recv().await.unwrap();
            assert_eq!(resent.id, "n1");
        }
        // the task removes itself once the schedule is exhausted
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(qos.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_further_resends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let qos = QosManager::new(10, Duration::from_millis(100), tx);
        qos.schedule_resend(notification("n2"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "n2");
        qos.cancel("n2");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(qos.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_id_replaces_previous_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let qos = QosManager::new(1, Duration::from_millis(100), tx);
        qos.schedule_resend(notification("n3"));
        qos.schedule_resend(notification("n3"));

        // only the second schedule survives: exactly one resend arrives
        let resent = rx.recv().await.unwrap();
        assert_eq!(resent.id, "n3");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(qos.pending_count(), 0);
    }
}
