// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits, markers and defaults shared across the pipeline.

/// Maximum length of a stdout/stderr line before it is split into segments.
pub const MAX_LOG_LINE: usize = 1 << 12;

/// Marks the boundaries of a line that was split because it exceeded [`MAX_LOG_LINE`].
pub const CONTINUATION_MARKER: &str = "[...]";

/// Consecutive non-EOF read failures tolerated before a reader gives up on its stream.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// How far the throttle reset deadline is pushed once the per-job cap is hit.
pub const HARD_CAP_SILENCE_SECS: u64 = 365 * 24 * 60 * 60;

/// Appended to every rate-limit notice sent to the remote API.
pub const DURABLE_COPY_NOTE: &str =
    "A complete log is still being written to durable storage, and will be available when the job finishes.";

pub const DEFAULT_LIMIT_LOG_BYTES_PER_JOB: u64 = 67_108_864;
pub const DEFAULT_THROTTLE_BYTES: u64 = 65_536;
pub const DEFAULT_THROTTLE_PERIOD_SECS: u64 = 60;
pub const DEFAULT_THROTTLE_LINES: u64 = 1_024;
pub const DEFAULT_PARTIAL_LINE_THROTTLE_PERIOD_SECS: u64 = 5;
pub const DEFAULT_BYTES_PER_EVENT: u64 = 4_096;
pub const DEFAULT_SECONDS_BETWEEN_EVENTS: u64 = 1;

// Discovery document keys
pub const KEY_LIMIT_LOG_BYTES_PER_JOB: &str = "crunchLimitLogBytesPerJob";
pub const KEY_THROTTLE_BYTES: &str = "crunchLogThrottleBytes";
pub const KEY_THROTTLE_PERIOD: &str = "crunchLogThrottlePeriod";
pub const KEY_THROTTLE_LINES: &str = "crunchLogThrottleLines";
pub const KEY_PARTIAL_LINE_THROTTLE_PERIOD: &str = "crunchLogPartialLineThrottlePeriod";
pub const KEY_BYTES_PER_EVENT: &str = "crunchLogBytesPerEvent";
pub const KEY_SECONDS_BETWEEN_EVENTS: &str = "crunchLogSecondsBetweenEvents";
