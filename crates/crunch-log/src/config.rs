// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log throttling parameters.
//!
//! The thresholds are read once at startup from the API server's discovery
//! document. A key that cannot be fetched or parsed falls back to its built-in
//! default; loading never fails, so missing configuration cannot prevent a job
//! from starting.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::api::Discovery;
use crate::constants::*;

/// Immutable throttling configuration for one job's log writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogThrottleConfig {
    /// Lifetime byte ceiling; once exceeded the remote log is silenced for good.
    pub limit_log_bytes_per_job: u64,
    /// Bytes accepted per throttle window before the window closes.
    pub throttle_bytes: u64,
    /// Length of a throttle window.
    pub throttle_period: Duration,
    /// Lines accepted per throttle window before the window closes.
    pub throttle_lines: u64,
    /// Minimum spacing between partial-line notices.
    pub partial_line_throttle_period: Duration,
    /// Pending API text that forces a flush.
    pub bytes_per_event: u64,
    /// Maximum buffering delay, for both the timestamping sink and the API batch.
    pub flush_interval: Duration,
}

impl Default for LogThrottleConfig {
    fn default() -> Self {
        Self {
            limit_log_bytes_per_job: DEFAULT_LIMIT_LOG_BYTES_PER_JOB,
            throttle_bytes: DEFAULT_THROTTLE_BYTES,
            throttle_period: Duration::from_secs(DEFAULT_THROTTLE_PERIOD_SECS),
            throttle_lines: DEFAULT_THROTTLE_LINES,
            partial_line_throttle_period: Duration::from_secs(
                DEFAULT_PARTIAL_LINE_THROTTLE_PERIOD_SECS,
            ),
            bytes_per_event: DEFAULT_BYTES_PER_EVENT,
            flush_interval: Duration::from_secs(DEFAULT_SECONDS_BETWEEN_EVENTS),
        }
    }
}

impl LogThrottleConfig {
    /// Loads every parameter from `discovery`, substituting the default for
    /// each one that is unavailable.
    pub async fn load(discovery: &dyn Discovery) -> Self {
        Self {
            limit_log_bytes_per_job: read_u64(
                discovery,
                KEY_LIMIT_LOG_BYTES_PER_JOB,
                DEFAULT_LIMIT_LOG_BYTES_PER_JOB,
            )
            .await,
            throttle_bytes: read_u64(discovery, KEY_THROTTLE_BYTES, DEFAULT_THROTTLE_BYTES).await,
            throttle_period: Duration::from_secs(
                read_u64(
                    discovery,
                    KEY_THROTTLE_PERIOD,
                    DEFAULT_THROTTLE_PERIOD_SECS,
                )
                .await,
            ),
            throttle_lines: read_u64(discovery, KEY_THROTTLE_LINES, DEFAULT_THROTTLE_LINES).await,
            partial_line_throttle_period: Duration::from_secs(
                read_u64(
                    discovery,
                    KEY_PARTIAL_LINE_THROTTLE_PERIOD,
                    DEFAULT_PARTIAL_LINE_THROTTLE_PERIOD_SECS,
                )
                .await,
            ),
            bytes_per_event: read_u64(discovery, KEY_BYTES_PER_EVENT, DEFAULT_BYTES_PER_EVENT)
                .await,
            flush_interval: Duration::from_secs(
                read_u64(
                    discovery,
                    KEY_SECONDS_BETWEEN_EVENTS,
                    DEFAULT_SECONDS_BETWEEN_EVENTS,
                )
                .await,
            ),
        }
    }
}

async fn read_u64(discovery: &dyn Discovery, key: &str, default: u64) -> u64 {
    match discovery.discovery(key).await {
        Ok(value) => match as_u64(&value) {
            Some(parsed) => parsed,
            None => {
                debug!("Discovery value for {key} is not a non-negative number: {value}. Using default {default}");
                default
            }
        },
        Err(e) => {
            debug!("Failed to read {key} from discovery: {e}. Using default {default}");
            default
        }
    }
}

// Discovery publishes numbers as JSON floats.
fn as_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
    })
}
