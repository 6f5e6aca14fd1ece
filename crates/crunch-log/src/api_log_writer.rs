// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tee writer that keeps a complete durable copy of a log stream and sends a
//! rate-limited copy to the remote logging API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::api::{LogApi, LogEntry};
use crate::config::LogThrottleConfig;
use crate::errors::{ApiError, Error};
use crate::rate_limiter::{RateLimiter, ThrottleWindow, Verdict};
use crate::timestamp::{rfc3339_timestamp, Timestamper};
use crate::writer::LogWriter;

/// Downstream writer of one job stream.
///
/// Every write goes to the durable writer unchanged. Lines that pass the
/// [`RateLimiter`] are batched and sent with one `create_log_entry` call once
/// the batch is larger than `bytes_per_event` or older than `flush_interval`.
///
/// Not shared: the owning [`ThrottledLogger`](crate::ThrottledLogger) flush
/// task is the only caller.
pub struct ApiLogWriter {
    api: Arc<dyn LogApi>,
    object_uuid: String,
    event_type: String,
    durable: Option<Box<dyn LogWriter>>,
    config: Arc<LogThrottleConfig>,
    limiter: RateLimiter,
    batch: Vec<u8>,
    flushed_at: Option<DateTime<Utc>>,
}

impl ApiLogWriter {
    pub fn new(
        api: Arc<dyn LogApi>,
        object_uuid: &str,
        event_type: &str,
        durable: Option<Box<dyn LogWriter>>,
        config: Arc<LogThrottleConfig>,
    ) -> Self {
        Self::with_timestamper(api, object_uuid, event_type, durable, config, rfc3339_timestamp)
    }

    /// Like [`ApiLogWriter::new`], formatting notice timestamps with `timestamper`.
    pub fn with_timestamper(
        api: Arc<dyn LogApi>,
        object_uuid: &str,
        event_type: &str,
        durable: Option<Box<dyn LogWriter>>,
        config: Arc<LogThrottleConfig>,
        timestamper: Timestamper,
    ) -> Self {
        Self {
            api,
            object_uuid: object_uuid.to_string(),
            event_type: event_type.to_string(),
            durable,
            limiter: RateLimiter::new(Arc::clone(&config), timestamper),
            config,
            batch: Vec::new(),
            flushed_at: None,
        }
    }

    pub fn window(&self) -> &ThrottleWindow {
        self.limiter.window()
    }

    /// Bytes accepted for the API but not sent yet.
    pub fn pending(&self) -> &[u8] {
        &self.batch
    }

    /// Processes `data` as if it arrived at `now`.
    ///
    /// Returns the number of bytes sent to the API, 0 when the batch was
    /// kept for later. A durable write failure or a failed API call is
    /// reported as [`Error::Flush`]. Throttle counters are kept either way
    /// and nothing is retried.
    pub async fn write_at(&mut self, data: &[u8], now: DateTime<Utc>) -> Result<usize, Error> {
        let durable_err = match self.durable.as_mut() {
            Some(durable) => durable.write(data).await.err(),
            None => None,
        };

        if let Some(notice) = self.limiter.start_window_if_due(now) {
            self.push_line(notice.as_bytes());
        }

        for line in data.split(|b| *b == b'\n') {
            if !self.limiter.is_open() {
                self.limiter.skip(line.len());
                continue;
            }
            if line.is_empty() {
                continue;
            }
            match self.limiter.rate_limit(line, now) {
                Verdict::Accept(line) => self.push_line(line),
                Verdict::Notice(notice) => self.push_line(notice.as_bytes()),
                Verdict::Drop => {}
            }
        }

        let mut flushed = 0;
        let mut api_err = None;
        if self.flush_due(now) {
            match self.send_batch(now).await {
                Ok(n) => flushed = n,
                Err(e) => api_err = Some(e),
            }
        }

        if durable_err.is_some() || api_err.is_some() {
            return Err(Error::Flush {
                durable: durable_err.map(Box::new),
                api: api_err,
            });
        }
        Ok(flushed)
    }

    /// Sends the pending batch now, whatever its size or age.
    pub async fn flush(&mut self) -> Result<usize, Error> {
        self.send_batch(Utc::now()).await.map_err(Error::from)
    }

    fn push_line(&mut self, line: &[u8]) {
        self.batch.extend_from_slice(line);
        self.batch.push(b'\n');
    }

    fn flush_due(&self, now: DateTime<Utc>) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        if self.batch.len() as u64 > self.config.bytes_per_event {
            return true;
        }
        let interval = TimeDelta::from_std(self.config.flush_interval).unwrap_or(TimeDelta::MAX);
        self.flushed_at
            .map_or(true, |flushed_at| now - flushed_at >= interval)
    }

    /// Sends the batch as one log entry. The batch is cleared even when the
    /// call fails, so a broken API cannot make it grow without bound.
    async fn send_batch(&mut self, now: DateTime<Utc>) -> Result<usize, ApiError> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batch);
        self.flushed_at = Some(now);

        let entry = LogEntry::new(
            &self.object_uuid,
            &self.event_type,
            String::from_utf8_lossy(&batch).into_owned(),
        );
        match self.api.create_log_entry(&entry).await {
            Ok(()) => {
                debug!(
                    "Sent {} bytes of {} log for {}",
                    batch.len(),
                    self.event_type,
                    self.object_uuid
                );
                Ok(batch.len())
            }
            Err(e) => {
                warn!(
                    "Dropped {} bytes of {} log for {}: {e}",
                    batch.len(),
                    self.event_type,
                    self.object_uuid
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl LogWriter for ApiLogWriter {
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.write_at(data, Utc::now()).await
    }

    /// Sends whatever is still batched, then closes the durable writer. A
    /// durable close error is returned in preference to a flush error.
    async fn close(&mut self) -> Result<(), Error> {
        let flushed = self.flush().await;
        if let Some(mut durable) = self.durable.take() {
            durable.close().await?;
        }
        flushed.map(|_| ())
    }
}
