// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide `tracing` subscriber for binaries embedding the log pipeline.

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::errors::Error;

/// Installs a plain-text subscriber filtered at `log_level` (for example
/// `"info"` or `"crunch_log=debug"`). HTTP stack internals are silenced.
///
/// Fails if the level does not parse or a global subscriber already exists.
pub fn init(log_level: &str) -> Result<(), Error> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level.to_lowercase());
    let filter = EnvFilter::try_new(env_filter)
        .map_err(|e| Error::Logging(format!("could not parse log level {log_level}: {e}")))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Logging(e.to_string()))?;

    debug!("Logging subsystem enabled");
    Ok(())
}
