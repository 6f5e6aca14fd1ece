// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote logging API and discovery boundary.
//!
//! [`LogApi`] receives the rate-limited copy of a job's log, one
//! [`LogEntry`] per flush. [`Discovery`] supplies configuration values such as
//! the throttling thresholds. [`ApiClient`] implements both over HTTP.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::{ApiError, Error};

const LOGS_PATH: &str = "arvados/v1/logs";
const DISCOVERY_PATH: &str = "discovery/v1/apis/arvados/v1/rest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Text payload of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogProperties {
    pub text: String,
}

/// One "create log entry" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Object the log belongs to (the job or container).
    pub object_uuid: String,
    /// Stream tag, e.g. `stdout`, `stderr` or `crunch-run`.
    pub event_type: String,
    pub properties: LogProperties,
}

impl LogEntry {
    pub fn new(object_uuid: &str, event_type: &str, text: String) -> Self {
        Self {
            object_uuid: object_uuid.to_string(),
            event_type: event_type.to_string(),
            properties: LogProperties { text },
        }
    }
}

#[derive(Serialize)]
struct CreateLogRequest<'a> {
    log: &'a LogEntry,
}

/// Receiver of the near-real-time log copy.
#[async_trait]
pub trait LogApi: Send + Sync {
    async fn create_log_entry(&self, entry: &LogEntry) -> Result<(), ApiError>;
}

/// Source of named configuration values.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discovery(&self, key: &str) -> Result<Value, ApiError>;
}

/// Connection settings for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL of the API server, including the scheme.
    pub api_host: String,
    pub api_token: String,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    pub timeout: Duration,
}

impl ApiClientConfig {
    /// Reads `ARVADOS_API_HOST`, `ARVADOS_API_TOKEN` and
    /// `ARVADOS_API_HOST_INSECURE`. A host without a scheme is assumed to be
    /// served over https.
    pub fn from_env() -> Result<Self, Error> {
        let host = env::var("ARVADOS_API_HOST")
            .map_err(|_| Error::Config("ARVADOS_API_HOST is not set".to_string()))?;
        let api_token = env::var("ARVADOS_API_TOKEN")
            .map_err(|_| Error::Config("ARVADOS_API_TOKEN is not set".to_string()))?;
        let insecure = env::var("ARVADOS_API_HOST_INSECURE")
            .map(|val| matches!(val.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let api_host = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{host}")
        };

        Ok(Self {
            api_host,
            api_token,
            insecure,
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

/// HTTP client for the API server.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    discovery_document: OnceCell<Map<String, Value>>,
}

impl ApiClient {
    pub fn new(config: &ApiClientConfig) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("OAuth2 {}", config.api_token))
            .map_err(|e| Error::Config(format!("invalid API token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(ApiError::Request)?;

        Ok(Self {
            client,
            base_url: config.api_host.trim_end_matches('/').to_string(),
            discovery_document: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn fetch_discovery_document(&self) -> Result<Map<String, Value>, ApiError> {
        debug!("Fetching discovery document from {}", self.base_url);
        let resp = self.client.get(self.url(DISCOVERY_PATH)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        match resp.json::<Value>().await? {
            Value::Object(document) => Ok(document),
            other => Err(ApiError::Decode(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl LogApi for ApiClient {
    async fn create_log_entry(&self, entry: &LogEntry) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(self.url(LOGS_PATH))
            .json(&CreateLogRequest { log: entry })
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

#[async_trait]
impl Discovery for ApiClient {
    async fn discovery(&self, key: &str) -> Result<Value, ApiError> {
        let document = self
            .discovery_document
            .get_or_try_init(|| self.fetch_discovery_document())
            .await?;
        document
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::MissingKey(key.to_string()))
    }
}
