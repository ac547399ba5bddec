// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::report::ReportMetrics;

/// Aggregated mix entry for one (service, topic).
#[derive(Clone, Debug, Default)]
pub struct MixMetrics {
    pub total_duration_us: i64,
    pub duration_count: i64,
    /// Reports per return code.
    pub retcode_counts: BTreeMap<String, i64>,
}

impl MixMetrics {
    fn mark(&mut self, duration_us: i64, retcode: String) {
        self.total_duration_us += duration_us;
        self.duration_count += 1;
        *self.retcode_counts.entry(retcode).or_default() += 1;
    }

    fn avg_duration_us(&self) -> i64 {
        if self.duration_count == 0 {
            0
        } else {
            self.total_duration_us / self.duration_count
        }
    }
}

/// All metrics accumulated during one reporting interval.
///
/// One row per (service, topic, retcode) for mix metrics, one row per
/// counter, one row per marked direct-output value.
#[derive(Clone, Debug)]
pub struct MetricsStatistic {
    /// Unix millis at which this interval started.
    pub timestamp_ms: i64,
    pub mix: BTreeMap<(String, String), MixMetrics>,
    pub counters: BTreeMap<String, i64>,
    pub direct: BTreeMap<String, Vec<String>>,
}

impl MetricsStatistic {
    pub(crate) fn new() -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64;
        Self {
            timestamp_ms,
            mix: BTreeMap::new(),
            counters: BTreeMap::new(),
            direct: BTreeMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, report: ReportMetrics) {
        match report {
            ReportMetrics::Mix {
                service,
                topic,
                retcode,
                duration_us,
            } => {
                self.mix
                    .entry((service, topic))
                    .or_default()
                    .mark(duration_us, retcode);
            }
            ReportMetrics::CounterSet { name, value } => {
                self.counters.insert(name, value);
            }
            ReportMetrics::CounterAdd { name, value } => {
                *self.counters.entry(name).or_default() += value;
            }
            ReportMetrics::Direct { name, value } => {
                self.direct.entry(name).or_default().push(value);
            }
        }
    }

    /// Serialize the snapshot as CSV rows.
    pub fn output_lines(&self, app_version: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ((service, topic), mix) in &self.mix {
            let avg = mix.avg_duration_us();
            for (retcode, count) in &mix.retcode_counts {
                lines.push(format!(
                    "mix,{},{},{},{},{},{},{}",
                    self.timestamp_ms, service, topic, app_version, count, retcode, avg
                ));
            }
        }
        for (name, value) in &self.counters {
            lines.push(format!("{},{},{}", name, self.timestamp_ms, value));
        }
        for (name, values) in &self.direct {
            for value in values {
                lines.push(format!("{},{},{}", name, self.timestamp_ms, value));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_rows_split_by_retcode_share_avg() {
        let mut stat = MetricsStatistic::new();
        for _ in 0..3 {
            stat.apply(ReportMetrics::Mix {
                service: "group".into(),
                topic: "send_msg".into(),
                retcode: "0".into(),
                duration_us: 100,
            });
        }
        stat.apply(ReportMetrics::Mix {
            service: "group".into(),
            topic: "send_msg".into(),
            retcode: "1101003".into(),
            duration_us: 500,
        });

        let lines = stat.output_lines("1.0.0");
        assert_eq!(lines.len(), 2);
        // avg over all four reports: (3*100 + 500) / 4 = 200
        let ts = stat.timestamp_ms;
        assert!(lines.contains(&format!("mix,{ts},group,send_msg,1.0.0,3,0,200")));
        assert!(lines.contains(&format!("mix,{ts},group,send_msg,1.0.0,1,1101003,200")));
    }

    #[test]
    fn counter_set_overrides_add_accumulates() {
        let mut stat = MetricsStatistic::new();
        stat.apply(ReportMetrics::CounterAdd {
            name: "online".into(),
            value: 2,
        });
        stat.apply(ReportMetrics::CounterAdd {
            name: "online".into(),
            value: 3,
        });
        stat.apply(ReportMetrics::CounterSet {
            name: "online".into(),
            value: 7,
        });
        assert_eq!(stat.counters["online"], 7);
        stat.apply(ReportMetrics::CounterAdd {
            name: "online".into(),
            value: 1,
        });
        assert_eq!(stat.counters["online"], 8);
    }

    #[test]
    fn direct_values_emit_one_row_each() {
        let mut stat = MetricsStatistic::new();
        stat.apply(ReportMetrics::Direct {
            name: "probe".into(),
            value: "a".into(),
        });
        stat.apply(ReportMetrics::Direct {
            name: "probe".into(),
            value: "b".into(),
        });
        let lines = stat.output_lines("1");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("probe,"));
    }
}
