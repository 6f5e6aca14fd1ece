// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # crunch-log
//!
//! Log capture for container jobs: a process's output streams are split into
//! bounded lines, timestamped, buffered, and handed to a writer that keeps a
//! complete durable copy while forwarding a rate-limited copy to the API
//! server's log table.
//!
//! ```text
//!   stdout/stderr ──> read_write_lines ──> ThrottledLogger ──flush task──> ApiLogWriter
//!                                                                            ├─> durable LogWriter (everything)
//!                                                                            └─> RateLimiter ──> LogApi (batched)
//! ```
//!
//! - [`line_reader`]: bounded line splitting with `[...]` continuation markers
//! - [`throttled_logger`]: timestamping sink with a background flush task
//! - [`api_log_writer`]: durable tee and API batching
//! - [`rate_limiter`]: byte, line and partial-line throttling with a per-job cap
//! - [`config`]: throttling thresholds from the discovery document

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

pub mod api;
pub mod api_log_writer;
pub mod config;
pub mod constants;
pub mod errors;
pub mod line_reader;
pub mod logger;
pub mod rate_limiter;
pub mod throttled_logger;
pub mod timestamp;
pub mod writer;

pub use api::{ApiClient, ApiClientConfig, Discovery, LogApi, LogEntry};
pub use api_log_writer::ApiLogWriter;
pub use config::LogThrottleConfig;
pub use errors::{ApiError, Error};
pub use line_reader::read_write_lines;
pub use throttled_logger::{ThrottledLogger, ThrottledLoggerBuilder};
pub use writer::{FileLogWriter, LogWriter};

/// Sets up the logger for one stream of a job: an [`ApiLogWriter`] tagged
/// with `event_type`, behind a [`ThrottledLogger`] that flushes every
/// `config.flush_interval`.
///
/// Must be called inside a tokio runtime.
pub fn new_job_logger(
    api: Arc<dyn LogApi>,
    object_uuid: &str,
    event_type: &str,
    durable: Option<Box<dyn LogWriter>>,
    config: Arc<LogThrottleConfig>,
) -> ThrottledLogger {
    let flush_interval = config.flush_interval;
    let writer = ApiLogWriter::new(api, object_uuid, event_type, durable, config);
    ThrottledLogger::new(Box::new(writer), flush_interval)
}
