// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the Loki listener.
//!
//! Only [`PipelineError`] ever reaches the host; the other types are logged and
//! recovered from where they occur.

use thiserror::Error;

/// Errors raised while reading the listener configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter could not be parsed into the expected type.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    /// A parameter parsed but is outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(String),
    /// The request never produced a response (connect failure, timeout, ...).
    #[error("request to Loki failed: {0}")]
    Request(String),
}

/// Errors raised by the [`crate::client::LokiClient`] send pool.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was stopped and no longer accepts sends.
    #[error("Loki client is stopped")]
    Stopped,
    /// The send was force-terminated during client shutdown.
    #[error("send cancelled during shutdown")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure to turn a stream batch into a wire payload.
#[derive(Debug, Error)]
#[error("failed to encode stream batch: {0}")]
pub struct EncodeError(pub String);

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        EncodeError(err.to_string())
    }
}

/// Failure to record a sample into the per-label accumulator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("sample result has no label")]
    MissingLabel,
}

/// Errors returned by the pipeline lifecycle entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// `start` was called outside of a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
    /// The requested transition is not valid from the current state.
    #[error("cannot {operation} a pipeline that is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::pipeline::PipelineState,
    },
}
