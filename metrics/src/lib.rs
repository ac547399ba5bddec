// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-local metrics collection.
//!
//! Producers push events through a bounded non-blocking queue; a single
//! consumer thread buckets them into the current interval statistic, a
//! rotator thread snapshots the statistic every reporting interval, and an
//! output thread serializes snapshots as CSV into a rolling file set guarded
//! by a disk-write quota. Producers never block and never touch the disk.

mod file_output;
mod report;
mod statistic;
mod throttle;

pub use statistic::MetricsStatistic;

use std::{
    cell::Cell,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{file_output::MetricsFileOutput, report::ReportMetrics};

/// Configuration for the metrics client.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Capacity of the report queue; overflow drops the event.
    pub report_queue_size: usize,
    /// Directory the rolling files are written into.
    pub metrics_dir: String,
    /// Max size of one output file before rolling.
    pub file_size_bytes: u64,
    /// Max number of output files kept on disk.
    pub file_count: usize,
    /// Five-character client id encoded into file names.
    pub client_id: String,
    /// Bytes the output thread may write per 60 s window.
    pub write_threshold_bytes: i64,
    /// Bucketing interval.
    pub report_interval_ms: u64,
    /// Version string emitted in mix rows.
    pub app_version: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_queue_size: 65536,
            metrics_dir: "./metrics".into(),
            file_size_bytes: 64 * 1024 * 1024,
            file_count: 10,
            client_id: "00000".into(),
            write_threshold_bytes: 10 * 1024 * 1024,
            report_interval_ms: 60_000,
            app_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Handle used by the rest of the process to report metrics.
///
/// Cheap to clone through an [`Arc`]; all methods are non-blocking.
pub struct MetricsClient {
    report_tx: SyncSender<ReportMetrics>,
}

impl MetricsClient {
    /// Start the collection threads and return the shared client.
    ///
    /// Panics on invalid configuration; metrics are wired up at process
    /// startup and a misconfiguration there is unrecoverable.
    pub fn start(config: MetricsConfig) -> Arc<Self> {
        assert_eq!(
            config.client_id.len(),
            5,
            "metrics client id must be 5 characters"
        );
        assert!(config.report_interval_ms > 0, "report interval must be > 0");

        let (report_tx, report_rx) = mpsc::sync_channel(config.report_queue_size);
        let (snapshot_tx, snapshot_rx) = mpsc::channel::<MetricsStatistic>();

        let statistic = Arc::new(Mutex::new(MetricsStatistic::new()));

        Self::spawn_consumer(report_rx, statistic.clone());
        Self::spawn_rotator(statistic, snapshot_tx, config.report_interval_ms);
        Self::spawn_output(snapshot_rx, config.clone());

        info!(
            dir = %config.metrics_dir,
            interval_ms = config.report_interval_ms,
            "metrics client started"
        );
        Arc::new(Self { report_tx })
    }

    /// Report one service call with its elapsed time and return code.
    pub fn mark_duration_and_retcode(
        &self,
        service: &str,
        topic: &str,
        duration_us: i64,
        retcode: impl ToString,
    ) {
        self.enqueue(ReportMetrics::Mix {
            service: service.to_owned(),
            topic: topic.to_owned(),
            retcode: retcode.to_string(),
            duration_us,
        });
    }

    /// Set a gauge-style counter to an absolute value.
    pub fn counter_set(&self, name: &str, value: i64) {
        self.enqueue(ReportMetrics::CounterSet {
            name: name.to_owned(),
            value,
        });
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, delta: i64) {
        self.enqueue(ReportMetrics::CounterAdd {
            name: name.to_owned(),
            value: delta,
        });
    }

    /// Emit a raw value in the next snapshot, unaggregated.
    pub fn direct_output(&self, name: &str, value: &str) {
        self.enqueue(ReportMetrics::Direct {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }

    fn enqueue(&self, report: ReportMetrics) {
        if let Err(TrySendError::Full(_)) = self.report_tx.try_send(report) {
            log_drop_throttled();
        }
    }

    fn spawn_consumer(report_rx: Receiver<ReportMetrics>, statistic: Arc<Mutex<MetricsStatistic>>) {
        thread::Builder::new()
            .name("metrics.report".into())
            .spawn(move || {
                while let Ok(report) = report_rx.recv() {
                    let mut stat = statistic.lock().expect("metrics statistic poisoned");
                    stat.apply(report);
                }
            })
            .expect("spawn metrics consumer thread");
    }

    fn spawn_rotator(
        statistic: Arc<Mutex<MetricsStatistic>>,
        snapshot_tx: mpsc::Sender<MetricsStatistic>,
        interval_ms: u64,
    ) {
        thread::Builder::new()
            .name("metrics.rotate".into())
            .spawn(move || {
                loop {
                    thread::sleep(Duration::from_millis(interval_ms));
                    let snapshot = {
                        let mut stat =
                            statistic.lock().expect("metrics statistic poisoned");
                        std::mem::replace(&mut *stat, MetricsStatistic::new())
                    };
                    if snapshot_tx.send(snapshot).is_err() {
                        return;
                    }
                }
            })
            .expect("spawn metrics rotator thread");
    }

    fn spawn_output(snapshot_rx: Receiver<MetricsStatistic>, config: MetricsConfig) {
        thread::Builder::new()
            .name("metrics.output".into())
            .spawn(move || {
                let mut output = MetricsFileOutput::new(
                    &config.metrics_dir,
                    config.file_size_bytes,
                    config.file_count,
                    &config.client_id,
                    config.write_threshold_bytes,
                );
                while let Ok(snapshot) = snapshot_rx.recv() {
                    let lines = snapshot.output_lines(&config.app_version);
                    if lines.is_empty() {
                        continue;
                    }
                    output.write_lines(&lines);
                    output.flush();
                }
            })
            .expect("spawn metrics output thread");
    }
}

fn log_drop_throttled() {
    thread_local! {
        static LAST_DROP_LOG: Cell<Option<Instant>> = const { Cell::new(None) };
    }
    LAST_DROP_LOG.with(|last| {
        let now = Instant::now();
        let should_log = match last.get() {
            Some(prev) => now.duration_since(prev) >= Duration::from_secs(1),
            None => true,
        };
        if should_log {
            last.set(Some(now));
            warn!("metrics report queue full, dropping report");
        }
    });
}
