// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{sync::Arc, time::Instant};

use embermetrics::MetricsClient;

/// Emits exactly one mix metric per handler call on every exit path:
/// construct at entry, set the return code on each branch, report on drop.
pub struct ExecMarker {
    metrics: Arc<MetricsClient>,
    service: &'static str,
    topic: &'static str,
    start: Instant,
    return_code: i32,
}

impl ExecMarker {
    pub fn new(metrics: Arc<MetricsClient>, service: &'static str, topic: &'static str) -> Self {
        Self {
            metrics,
            service,
            topic,
            start: Instant::now(),
            return_code: 0,
        }
    }

    pub fn set_return_code(&mut self, return_code: i32) {
        self.return_code = return_code;
    }
}

impl Drop for ExecMarker {
    fn drop(&mut self) {
        self.metrics.mark_duration_and_retcode(
            self.service,
            self.topic,
            self.start.elapsed().as_micros() as i64,
            self.return_code,
        );
    }
}
