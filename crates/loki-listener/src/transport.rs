// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Instant;
use tracing::debug;

use crate::config::LokiConfig;
use crate::errors::TransportError;

/// Status codes Loki answers a successful push with.
pub const ACCEPTED_STATUS_CODES: [u16; 2] = [200, 204];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokiResponse {
    pub status: u16,
    pub body: String,
}

impl LokiResponse {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        ACCEPTED_STATUS_CODES.contains(&self.status)
    }
}

/// Delivers one encoded push payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: Bytes) -> Result<LokiResponse, TransportError>;
}

/// Pushes payloads to Loki over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(config: &LokiConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connection_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.idle_connection_timeout())
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;
        let url = config.push_url();
        reqwest::Url::parse(&url)
            .map_err(|e| TransportError::Build(format!("invalid push URL {url}: {e}")))?;
        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: Bytes) -> Result<LokiResponse, TransportError> {
        let time = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .body(payload)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        debug!(
            "LOKI | Push to {} answered {status} in {} ms",
            self.url,
            time.elapsed().as_millis()
        );
        Ok(LokiResponse { status, body })
    }
}
