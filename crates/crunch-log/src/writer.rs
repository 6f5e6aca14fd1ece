// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::errors::Error;

/// Append-only byte sink with an explicit close.
///
/// The timestamping sink writes its buffered records to a `LogWriter`, and
/// the tee writer forwards the same bytes to a durable `LogWriter`.
#[async_trait]
pub trait LogWriter: Send {
    /// Writes `data` and returns the number of bytes the writer reports as
    /// handled.
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    async fn close(&mut self) -> Result<(), Error>;
}

/// Durable writer that appends to a local file.
#[derive(Debug)]
pub struct FileLogWriter {
    file: Option<File>,
}

impl FileLogWriter {
    /// Opens `path` for appending, creating it if needed.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file: Some(file) })
    }
}

#[async_trait]
impl LogWriter for FileLogWriter {
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write to closed log file",
            )));
        };
        file.write_all(data).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
