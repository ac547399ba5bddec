// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use tracing::debug;

const REPLENISH_INTERVAL: Duration = Duration::from_secs(60);

/// Token bucket bounding how many bytes the output thread may write per
/// replenish window. The replenisher resets the quota to the threshold; it
/// does not accumulate unused tokens.
pub(crate) struct ThrottleControl {
    threshold: i64,
    quota: Arc<(Mutex<i64>, Condvar)>,
}

impl ThrottleControl {
    pub(crate) fn new(threshold: i64) -> Self {
        Self {
            threshold,
            quota: Arc::new((Mutex::new(threshold), Condvar::new())),
        }
    }

    /// Spawn the replenisher thread.
    pub(crate) fn start(&self) {
        let quota = self.quota.clone();
        let threshold = self.threshold;
        thread::Builder::new()
            .name("metrics.throttle".into())
            .spawn(move || {
                loop {
                    thread::sleep(REPLENISH_INTERVAL);
                    let (lock, cvar) = &*quota;
                    *lock.lock().expect("throttle quota poisoned") = threshold;
                    cvar.notify_all();
                }
            })
            .expect("spawn metrics throttle thread");
    }

    /// Take `n` bytes from the quota, blocking until the next replenish when
    /// exhausted.
    pub(crate) fn check_write_quota(&self, n: i64) {
        let (lock, cvar) = &*self.quota;
        let mut quota = lock.lock().expect("throttle quota poisoned");
        loop {
            *quota -= n;
            if *quota >= 0 {
                return;
            }
            debug!(requested = n, quota = *quota, "write over quota, waiting");
            quota = cvar.wait(quota).expect("throttle quota poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_within_threshold_does_not_block() {
        let throttle = ThrottleControl::new(1000);
        throttle.check_write_quota(400);
        throttle.check_write_quota(400);
        // 200 left; still non-negative after this take
        throttle.check_write_quota(200);
    }

    #[test]
    fn exhausted_quota_blocks_until_replenish() {
        let throttle = Arc::new(ThrottleControl::new(100));
        let t = throttle.clone();
        let handle = thread::spawn(move || {
            t.check_write_quota(80);
            t.check_write_quota(80);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());
        // replenish by hand instead of waiting a minute
        let (lock, cvar) = &*throttle.quota;
        *lock.lock().unwrap() = 100;
        cvar.notify_all();
        handle.join().unwrap();
    }
}
