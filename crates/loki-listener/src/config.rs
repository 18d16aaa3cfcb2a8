// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listener configuration.
//!
//! Values come either from the key/value parameters the load-test host passes
//! in ([`LokiConfig::from_parameters`]) or from `LOKI_*` environment variables
//! ([`LokiConfig::from_env`]). Missing or blank values fall back to the
//! defaults below; values that do not parse are rejected.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::labels::{parse_external_labels, LabelSet};

pub const KEY_PROTOCOL: &str = "loki_protocol";
pub const KEY_HOST: &str = "loki_host";
pub const KEY_PORT: &str = "loki_port";
pub const KEY_API_ENDPOINT: &str = "loki_api_endpoint";
pub const KEY_BATCH_SIZE: &str = "loki_batch_size";
pub const KEY_SEND_BATCH_INTERVAL_TIME: &str = "loki_send_batch_interval_time";
pub const KEY_EXTERNAL_LABELS: &str = "loki_external_labels";
pub const KEY_BATCH_TIMEOUT_MS: &str = "loki_batch_timeout_ms";
pub const KEY_CONNECTION_TIMEOUT_MS: &str = "loki_connection_timeout_ms";
pub const KEY_REQUEST_TIMEOUT_MS: &str = "loki_request_timeout_ms";

pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3100;
pub const DEFAULT_API_ENDPOINT: &str = "/loki/api/v1/push";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SEND_BATCH_INTERVAL_MS: u64 = 500;
pub const DEFAULT_EXTERNAL_LABELS: &str = "";
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

const DEFAULT_DISPATCH_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_METRICS_INITIAL_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokiConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub api_endpoint: String,
    /// Maximum results per chunk; every chunk yields one header and one body stream.
    pub batch_size: usize,
    /// Period of the dispatcher.
    pub send_batch_interval: Duration,
    /// Labels merged into every stream.
    pub external_labels: LabelSet,
    /// Idle HTTP connections expire after ten batch timeouts.
    pub batch_timeout: Duration,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    /// Delay before the dispatcher's first tick.
    pub dispatch_initial_delay: Duration,
    /// Delay before the first thread-metrics sample.
    pub metrics_initial_delay: Duration,
    pub metrics_interval: Duration,
    /// How often the teardown drain re-checks the pending count.
    pub drain_poll_interval: Duration,
    /// Upper bound on the teardown drain. `None` waits for as long as it takes.
    pub max_drain_time: Option<Duration>,
    /// How long teardown waits for in-flight sends before cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            send_batch_interval: Duration::from_millis(DEFAULT_SEND_BATCH_INTERVAL_MS),
            external_labels: LabelSet::new(),
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            dispatch_initial_delay: DEFAULT_DISPATCH_INITIAL_DELAY,
            metrics_initial_delay: DEFAULT_METRICS_INITIAL_DELAY,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            max_drain_time: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl LokiConfig {
    /// Builds a configuration from host parameters keyed by the `KEY_*` names.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| parameters.get(key).cloned())
    }

    /// Builds a configuration from `LOKI_*` environment variables, e.g.
    /// `LOKI_HOST` for [`KEY_HOST`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key.to_uppercase()).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            protocol: value(KEY_PROTOCOL)
                .map_or(defaults.protocol, |p| p.to_lowercase()),
            host: value(KEY_HOST).unwrap_or(defaults.host),
            port: parse(KEY_PORT, value(KEY_PORT))?.unwrap_or(defaults.port),
            api_endpoint: value(KEY_API_ENDPOINT)
                .map_or(defaults.api_endpoint, |path| normalize_path(&path)),
            batch_size: parse(KEY_BATCH_SIZE, value(KEY_BATCH_SIZE))?
                .unwrap_or(defaults.batch_size),
            send_batch_interval: parse_millis(
                KEY_SEND_BATCH_INTERVAL_TIME,
                value(KEY_SEND_BATCH_INTERVAL_TIME),
            )?
            .unwrap_or(defaults.send_batch_interval),
            external_labels: value(KEY_EXTERNAL_LABELS)
                .map_or(defaults.external_labels, |raw| parse_external_labels(&raw)),
            batch_timeout: parse_millis(KEY_BATCH_TIMEOUT_MS, value(KEY_BATCH_TIMEOUT_MS))?
                .unwrap_or(defaults.batch_timeout),
            connection_timeout: parse_millis(
                KEY_CONNECTION_TIMEOUT_MS,
                value(KEY_CONNECTION_TIMEOUT_MS),
            )?
            .unwrap_or(defaults.connection_timeout),
            request_timeout: parse_millis(KEY_REQUEST_TIMEOUT_MS, value(KEY_REQUEST_TIMEOUT_MS))?
                .unwrap_or(defaults.request_timeout),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// The parameter table with default values, as offered to the host.
    #[must_use]
    pub fn default_parameters() -> Vec<(&'static str, String)> {
        vec![
            (KEY_PROTOCOL, DEFAULT_PROTOCOL.to_string()),
            (KEY_HOST, DEFAULT_HOST.to_string()),
            (KEY_PORT, DEFAULT_PORT.to_string()),
            (KEY_API_ENDPOINT, DEFAULT_API_ENDPOINT.to_string()),
            (KEY_BATCH_SIZE, DEFAULT_BATCH_SIZE.to_string()),
            (
                KEY_SEND_BATCH_INTERVAL_TIME,
                DEFAULT_SEND_BATCH_INTERVAL_MS.to_string(),
            ),
            (KEY_EXTERNAL_LABELS, DEFAULT_EXTERNAL_LABELS.to_string()),
            (KEY_BATCH_TIMEOUT_MS, DEFAULT_BATCH_TIMEOUT_MS.to_string()),
            (
                KEY_CONNECTION_TIMEOUT_MS,
                DEFAULT_CONNECTION_TIMEOUT_MS.to_string(),
            ),
            (KEY_REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS.to_string()),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::Invalid(format!(
                "unsupported protocol {:?}, expected http or https",
                self.protocol
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".to_string()));
        }
        if self.send_batch_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "batch send interval must be greater than zero".to_string(),
            ));
        }
        if self.metrics_interval.is_zero() || self.drain_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics and drain intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Full URL of the push endpoint, e.g. `http://localhost:3100/loki/api/v1/push`.
    #[must_use]
    pub fn push_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.api_endpoint
        )
    }

    /// Idle HTTP connections are dropped after this long.
    #[must_use]
    pub fn idle_connection_timeout(&self) -> Duration {
        self.batch_timeout.saturating_mul(10)
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn parse<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: v,
            })
        })
        .transpose()
}

fn parse_millis(key: &str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(key, value)?.map(Duration::from_millis))
}
