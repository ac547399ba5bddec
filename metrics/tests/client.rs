// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end test of the metrics pipeline: report -> bucket -> snapshot ->
//! rolling file.

use std::{fs, path::PathBuf, thread, time::Duration};

use embermetrics::{MetricsClient, MetricsConfig};

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("embermetrics-e2e-{}", uuid::Uuid::new_v4()))
}

fn read_all_lines(dir: &PathBuf) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir).unwrap().flatten() {
        let content = fs::read_to_string(entry.path()).unwrap();
        lines.extend(content.lines().map(str::to_owned));
    }
    lines
}

#[test]
fn mix_reports_appear_aggregated_in_snapshot_file() {
    let dir = temp_dir();
    let client = MetricsClient::start(MetricsConfig {
        metrics_dir: dir.to_str().unwrap().to_owned(),
        report_interval_ms: 500,
        client_id: "emb01".into(),
        app_version: "9.9.9".into(),
        ..Default::default()
    });

    for _ in 0..2000 {
        client.mark_duration_and_retcode("group", "send_msg", 10_000, 200);
    }

    // one full interval plus slack for the consumer and output threads
    thread::sleep(Duration::from_millis(1600));

    let mix_lines: Vec<String> = read_all_lines(&dir)
        .into_iter()
        .filter(|l| l.starts_with("mix,"))
        .collect();
    assert_eq!(mix_lines.len(), 1, "got {mix_lines:?}");

    let fields: Vec<&str> = mix_lines[0].split(',').collect();
    assert_eq!(fields[0], "mix");
    assert_eq!(fields[2], "group");
    assert_eq!(fields[3], "send_msg");
    assert_eq!(fields[4], "9.9.9");
    assert_eq!(fields[5], "2000");
    assert_eq!(fields[6], "200");
    assert_eq!(fields[7], "10000");

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn counters_and_direct_output_reach_the_file() {
    let dir = temp_dir();
    let client = MetricsClient::start(MetricsConfig {
        metrics_dir: dir.to_str().unwrap().to_owned(),
        report_interval_ms: 300,
        client_id: "emb02".into(),
        ..Default::default()
    });

    client.counter_add("sessions_online", 5);
    client.counter_add("sessions_online", -2);
    client.direct_output("redis_probe", "partition0:ok");

    thread::sleep(Duration::from_millis(1200));

    let lines = read_all_lines(&dir);
    assert!(
        lines.iter().any(|l| l.starts_with("sessions_online,") && l.ends_with(",3")),
        "got {lines:?}"
    );
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("redis_probe,") && l.ends_with(",partition0:ok")),
        "got {lines:?}"
    );

    fs::remove_dir_all(&dir).unwrap();
}
