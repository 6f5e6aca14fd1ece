// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recording implementations of the pipeline's collaborators

use async_trait::async_trait;
use crunch_log::{ApiError, Error, LogApi, LogEntry, LogWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Log API that keeps every entry it receives
#[derive(Default)]
pub struct RecordingApi {
    pub entries: Mutex<Vec<LogEntry>>,
}

#[allow(dead_code)]
impl RecordingApi {
    pub fn texts(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.properties.text.clone())
            .collect()
    }
}

#[async_trait]
impl LogApi for RecordingApi {
    async fn create_log_entry(&self, entry: &LogEntry) -> Result<(), ApiError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Durable writer that keeps everything in memory. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    pub data: Arc<Mutex<Vec<u8>>>,
    pub closes: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl RecordingWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.data.lock().unwrap().clone()).unwrap()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogWriter for RecordingWriter {
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
