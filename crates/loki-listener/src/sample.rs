// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sample results handed over by the load-test engine.

use serde::Deserialize;

use crate::streams::LogLevel;

pub const REQUEST_PREFIX: &str = "Request ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AssertionResult {
    pub name: String,
    pub error: bool,
    pub failure: bool,
    pub failure_message: Option<String>,
}

/// One executed sampler, possibly with nested sub-results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SampleResult {
    pub label: String,
    /// Elapsed time in milliseconds.
    pub elapsed_ms: u64,
    pub error_count: u32,
    pub response_code: String,
    pub response_headers: String,
    pub response_body: String,
    pub assertions: Vec<AssertionResult>,
    pub sub_results: Vec<SampleResult>,
    /// Active threads across all thread groups when the sample finished.
    pub all_threads: u32,
}

impl SampleResult {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }

    #[must_use]
    pub fn level(&self) -> LogLevel {
        if self.is_success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        }
    }

    /// Whether the label names a transaction controller. "transactions"
    /// contains "transaction", so one case-insensitive check covers both.
    #[must_use]
    pub fn is_transaction(&self) -> bool {
        self.label.to_lowercase().contains("transaction")
    }

    /// Prefixes the label with `"Request "` unless it names a transaction.
    /// An empty label stays empty.
    pub fn apply_request_prefix(&mut self) {
        if !self.label.is_empty() && !self.is_transaction() {
            self.label.insert_str(0, REQUEST_PREFIX);
        }
    }
}
