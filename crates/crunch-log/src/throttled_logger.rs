// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timestamping, buffering sink in front of a downstream [`LogWriter`].
//!
//! ```text
//!   write() ──lock──> buffer ──swap──> flush task ──> LogWriter::write
//!                                        ^
//!                    interval tick ──────┤
//!                    FlushCommand  ──────┘
//! ```
//!
//! Callers write from any thread without waiting on the downstream writer.
//! A single tokio task owns the downstream writer; it swaps the buffer for an
//! empty one on every tick or command and forwards what it took, so the
//! downstream writer only ever sees one caller.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::errors::Error;
use crate::timestamp::{rfc3339_timestamp, Timestamper};
use crate::writer::LogWriter;

/// Receives every formatted line, without its trailing newline, as soon as
/// it is written.
pub type ImmediateFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns an [`ImmediateFn`] that mirrors lines to `tracing` at info level.
pub fn immediate_tracing() -> ImmediateFn {
    Arc::new(|line: &str| {
        info!(target: "crunch_log::immediate", "{line}");
    })
}

#[derive(Debug)]
pub enum FlushCommand {
    /// Flush now and acknowledge once the downstream write returned.
    Flush(oneshot::Sender<()>),
    /// Flush one last time and stop.
    Shutdown,
}

struct Shared {
    buf: Mutex<Vec<u8>>,
    timestamper: Timestamper,
    immediate: Option<ImmediateFn>,
}

impl Shared {
    fn lock_buf(&self) -> MutexGuard<'_, Vec<u8>> {
        // The buffer is plain bytes; a panicking writer cannot leave it inconsistent.
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_buf(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock_buf())
    }
}

/// Timestamps each written line and periodically hands the accumulated
/// records to the downstream writer.
///
/// Must be created inside a tokio runtime.
pub struct ThrottledLogger {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<FlushCommand>,
    worker: tokio::sync::Mutex<Option<JoinHandle<Box<dyn LogWriter>>>>,
}

impl ThrottledLogger {
    /// Starts the flush task, which writes to `writer` at most once per
    /// `flush_interval`.
    pub fn new(writer: Box<dyn LogWriter>, flush_interval: Duration) -> Self {
        Self::builder(writer, flush_interval).build()
    }

    pub fn builder(writer: Box<dyn LogWriter>, flush_interval: Duration) -> ThrottledLoggerBuilder {
        ThrottledLoggerBuilder {
            writer,
            flush_interval,
            timestamper: rfc3339_timestamp,
            immediate: None,
        }
    }

    /// Appends `"<timestamp> <line>\n"` to the buffer for every line in
    /// `data` and returns `data.len()`.
    ///
    /// Lines end at `\n`; a `\r` right before it is dropped, and a final
    /// segment without newline is still a line.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.shared.lock_buf();
        for line in split_lines(data) {
            let now = Utc::now();
            let mut record = Vec::with_capacity(line.len() + 40);
            record.extend_from_slice((self.shared.timestamper)(now).as_bytes());
            record.push(b' ');
            record.extend_from_slice(line);

            if let Some(immediate) = &self.shared.immediate {
                immediate(&String::from_utf8_lossy(&record));
            }

            record.push(b'\n');
            buf.extend_from_slice(&record);
        }
        Ok(data.len())
    }

    /// Writes one formatted message as a log line.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        let message = args.to_string();
        // Writing to the in-memory buffer cannot fail.
        let _ = self.write(message.as_bytes());
    }

    /// Asks the flush task to forward the buffer now and waits until it has.
    pub async fn flush(&self) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(FlushCommand::Flush(ack_tx))
            .map_err(|e| Error::Worker(format!("Failed to send flush command: {e}")))?;
        ack_rx
            .await
            .map_err(|e| Error::Worker(format!("Failed to receive flush acknowledgement: {e}")))
    }

    /// Stops the flush task after a final flush, then closes the downstream
    /// writer and returns its result. If the flush task panicked the writer
    /// is lost and [`Error::Worker`] is returned without closing it.
    ///
    /// Later calls wait for the first one to finish and return `Ok(())`.
    pub async fn close(&self) -> Result<(), Error> {
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.take() else {
            debug!("Throttled logger already closed");
            return Ok(());
        };

        if self.tx.send(FlushCommand::Shutdown).is_err() {
            debug!("Flush task already stopped");
        }

        // The task owns the writer; if it panicked the writer is gone and cannot be closed.
        let mut writer = match handle.await {
            Ok(writer) => writer,
            Err(e) => {
                error!("Flush task failed, downstream writer was not closed: {e}");
                return Err(Error::Worker(format!("Failed to join flush task: {e}")));
            }
        };
        writer.close().await
    }
}

impl io::Write for &ThrottledLogger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ThrottledLogger::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct ThrottledLoggerBuilder {
    writer: Box<dyn LogWriter>,
    flush_interval: Duration,
    timestamper: Timestamper,
    immediate: Option<ImmediateFn>,
}

impl ThrottledLoggerBuilder {
    #[must_use]
    pub fn timestamper(mut self, timestamper: Timestamper) -> Self {
        self.timestamper = timestamper;
        self
    }

    #[must_use]
    pub fn immediate(mut self, immediate: ImmediateFn) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn build(self) -> ThrottledLogger {
        let shared = Arc::new(Shared {
            buf: Mutex::new(Vec::new()),
            timestamper: self.timestamper,
            immediate: self.immediate,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let task = FlushTask {
            shared: Arc::clone(&shared),
            writer: self.writer,
            rx,
            flush_interval: self.flush_interval,
        };
        let handle = tokio::spawn(task.run());

        ThrottledLogger {
            shared,
            tx,
            worker: tokio::sync::Mutex::new(Some(handle)),
        }
    }
}

struct FlushTask {
    shared: Arc<Shared>,
    writer: Box<dyn LogWriter>,
    rx: mpsc::UnboundedReceiver<FlushCommand>,
    flush_interval: Duration,
}

impl FlushTask {
    async fn run(mut self) -> Box<dyn LogWriter> {
        debug!("Log flush task started");

        // tokio intervals reject a zero period
        let mut ticker = interval(self.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            let (stopping, ack) = tokio::select! {
                command = self.rx.recv() => match command {
                    Some(FlushCommand::Flush(ack)) => (false, Some(ack)),
                    Some(FlushCommand::Shutdown) => (true, None),
                    None => {
                        debug!("Throttled logger dropped without close");
                        (true, None)
                    }
                },
                _ = ticker.tick() => (false, None),
            };

            self.flush().await;

            if let Some(ack) = ack {
                if ack.send(()).is_err() {
                    error!("Failed to acknowledge flush - receiver dropped");
                }
            }
            if stopping {
                break;
            }
        }

        debug!("Log flush task stopped");
        self.writer
    }

    async fn flush(&mut self) {
        let ready = self.shared.take_buf();
        if ready.is_empty() {
            return;
        }
        if let Err(e) = self.writer.write(&ready).await {
            error!("Failed to write {} bytes of log downstream: {e}", ready.len());
        }
    }
}

/// Splits `data` into lines the way a line scanner does: `\n` terminates a
/// line, a `\r` right before it is dropped, and a non-empty tail without
/// newline is the last line.
pub(crate) fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let (line, remaining) = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &rest[rest.len()..]),
        };
        rest = remaining;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    })
}
