// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Copies a process output stream into a [`ThrottledLogger`], one line at a time.
//!
//! Lines longer than [`MAX_LOG_LINE`] are forwarded in segments so that memory
//! stays bounded no matter what the process prints. The first segment of such
//! a line ends with [`CONTINUATION_MARKER`], every following segment starts
//! with it, and every segment but the last also ends with it.

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::constants::{CONTINUATION_MARKER, MAX_CONSECUTIVE_READ_ERRORS, MAX_LOG_LINE};
use crate::throttled_logger::ThrottledLogger;

/// A piece of one input line, without its line terminator.
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    bytes: Vec<u8>,
    /// The line continues past this segment.
    is_prefix: bool,
}

/// Line splitter over an async byte stream with a fixed-size buffer.
struct SegmentReader<R> {
    input: R,
    pending: Vec<u8>,
    eof: bool,
    /// A read returned data since the last call to `take_progress`.
    progressed: bool,
}

impl<R: AsyncRead + Unpin> SegmentReader<R> {
    fn new(input: R) -> Self {
        Self {
            input,
            pending: Vec::with_capacity(MAX_LOG_LINE),
            eof: false,
            progressed: false,
        }
    }

    fn take_progress(&mut self) -> bool {
        std::mem::take(&mut self.progressed)
    }

    /// Hands out whatever is buffered without waiting for a line end.
    fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Returns the next segment, or `None` at end of stream. Data buffered
    /// before a read error is kept for the next call.
    async fn next_segment(&mut self) -> io::Result<Option<Segment>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut bytes: Vec<u8> = self.pending.drain(..=pos).collect();
                bytes.pop();
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                return Ok(Some(Segment {
                    bytes,
                    is_prefix: false,
                }));
            }

            if self.pending.len() >= MAX_LOG_LINE {
                let mut split = MAX_LOG_LINE;
                // Keep a trailing '\r' so a "\r\n" split across segments is still a terminator.
                if self.pending[split - 1] == b'\r' {
                    split -= 1;
                }
                let bytes: Vec<u8> = self.pending.drain(..split).collect();
                return Ok(Some(Segment {
                    bytes,
                    is_prefix: true,
                }));
            }

            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let bytes = std::mem::take(&mut self.pending);
                return Ok(Some(Segment {
                    bytes,
                    is_prefix: false,
                }));
            }

            let mut chunk = [0u8; MAX_LOG_LINE];
            let room = MAX_LOG_LINE - self.pending.len();
            let n = self.input.read(&mut chunk[..room]).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
                self.progressed = true;
            }
        }
    }
}

/// Reads `input` until end of stream, writing every line (or segment of an
/// overlong line) to `logger`, then sends on `done`.
///
/// A read error is reported to the logger as
/// `"error reading container log: <err>"` and reading resumes. After
/// [`MAX_CONSECUTIVE_READ_ERRORS`] failures with no data read in between, the
/// stream is abandoned; bytes already read are still written out.
pub async fn read_write_lines<R>(input: R, logger: &ThrottledLogger, done: mpsc::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = SegmentReader::new(input);
    let mut continuing = false;
    let mut consecutive_errors = 0;

    loop {
        let segment = match reader.next_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                logger.log(format_args!("error reading container log: {e}"));
                if reader.take_progress() {
                    consecutive_errors = 0;
                }
                consecutive_errors += 1;
                if consecutive_errors < MAX_CONSECUTIVE_READ_ERRORS {
                    continue;
                }
                error!("Giving up on log stream after {consecutive_errors} consecutive read errors: {e}");
                let rest = reader.take_pending();
                if !rest.is_empty() {
                    forward(logger, continuing, rest, false);
                }
                break;
            }
        };
        if reader.take_progress() {
            consecutive_errors = 0;
        }

        let was_continuing = continuing;
        continuing = segment.is_prefix;
        forward(logger, was_continuing, segment.bytes, segment.is_prefix);
    }

    if done.send(()).await.is_err() {
        debug!("Log reader finished but nobody is waiting on it");
    }
}

/// Writes one segment, adding the continuation markers its position calls for.
fn forward(logger: &ThrottledLogger, continuing: bool, bytes: Vec<u8>, is_prefix: bool) {
    let prefix = if continuing { CONTINUATION_MARKER } else { "" };
    let suffix = if is_prefix { CONTINUATION_MARKER } else { "" };

    if prefix.is_empty() && suffix.is_empty() {
        write_segment(logger, &bytes);
        return;
    }
    let mut marked = Vec::with_capacity(prefix.len() + bytes.len() + suffix.len() + 1);
    marked.extend_from_slice(prefix.as_bytes());
    marked.extend_from_slice(&bytes);
    marked.extend_from_slice(suffix.as_bytes());
    marked.push(b'\n');
    write_segment(logger, &marked);
}

fn write_segment(logger: &ThrottledLogger, bytes: &[u8]) {
    if let Err(e) = logger.write(bytes) {
        error!("Failed to write log line: {e}");
    }
}
