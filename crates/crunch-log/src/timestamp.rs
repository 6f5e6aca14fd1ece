// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width timestamps for log lines.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats the instant a line was captured. Every emitted line begins with
/// the returned string followed by a single space.
pub type Timestamper = fn(DateTime<Utc>) -> String;

/// Formats `t` as RFC 3339 with a nine digit fractional second, so that every
/// timestamp has the same width (`2006-01-02T15:04:05.000000000Z`).
pub fn rfc3339_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
