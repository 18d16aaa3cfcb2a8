// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Loki listener
//!
//! Ships load-test sample results to a Loki push endpoint while a test runs.
//!
//! - [`pipeline`]: lifecycle, ingestion and the teardown drain
//! - [`queue`]: unbounded intake queue with in-flight accounting
//! - [`dispatcher`]: periodic task sending one queued batch per tick
//! - [`sampler`]: periodic thread-concurrency snapshots
//! - [`client`] and [`transport`]: the send pool and the HTTP push
//! - [`streams`], [`labels`] and [`encoder`]: the push payload
//! - [`metrics`] and [`report`]: per-label aggregates and the log line text

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod errors;
pub mod labels;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod sample;
pub mod sampler;
pub mod streams;
pub mod transport;

pub use config::LokiConfig;
pub use errors::PipelineError;
pub use metrics::{SharedThreadCounts, ThreadCounts, ThreadCountsSource};
pub use pipeline::{Pipeline, PipelineState};
pub use sample::{AssertionResult, SampleResult};
pub use transport::{HttpTransport, Transport};
