// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use chrono::DateTime;

/// Length of an RFC 3339 timestamp with nanoseconds, e.g. `2024-01-01T00:00:00.000000000Z`.
pub const TIMESTAMP_LEN: usize = 30;

/// Splits `"<ts> <line>"` records into their lines, checking each timestamp parses.
#[allow(dead_code)]
pub fn strip_timestamps(text: &str) -> Vec<String> {
    text.lines()
        .map(|record| {
            let (ts, line) = record
                .split_once(' ')
                .unwrap_or_else(|| panic!("record without timestamp: {record:?}"));
            assert_eq!(ts.len(), TIMESTAMP_LEN, "timestamp width in {record:?}");
            if let Err(e) = DateTime::parse_from_rfc3339(ts) {
                panic!("bad timestamp {ts:?}: {e}");
            }
            line.to_string()
        })
        .collect()
}
