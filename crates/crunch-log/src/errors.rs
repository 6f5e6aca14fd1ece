// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the log pipeline.

use reqwest::StatusCode;

/// Errors returned by the remote logging API and the discovery service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("discovery document has no key {0}")]
    MissingKey(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Errors surfaced by the pipeline's writers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// A tee write where the durable copy, the API call, or both failed.
    #[error("{}", describe_flush_failure(.durable, .api))]
    Flush {
        durable: Option<Box<Error>>,
        api: Option<ApiError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("flush worker failed: {0}")]
    Worker(String),

    #[error("failed to install log subscriber: {0}")]
    Logging(String),
}

fn describe_flush_failure(durable: &Option<Box<Error>>, api: &Option<ApiError>) -> String {
    let durable = durable
        .as_ref()
        .map_or_else(|| "ok".to_string(), ToString::to_string);
    let api = api.as_ref().map_or_else(|| "ok".to_string(), ToString::to_string);
    format!("durable writer: {durable}; log api: {api}")
}
