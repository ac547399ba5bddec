// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

/// One event flowing through the report queue.
#[derive(Clone, Debug)]
pub(crate) enum ReportMetrics {
    Mix {
        service: String,
        topic: String,
        retcode: String,
        duration_us: i64,
    },
    CounterSet {
        name: String,
        value: i64,
    },
    CounterAdd {
        name: String,
        value: i64,
    },
    Direct {
        name: String,
        value: String,
    },
}
