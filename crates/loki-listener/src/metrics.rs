// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-label timing accumulators and thread-concurrency counters.
//!
//! [`SamplerMetric`] keeps the most recent elapsed times it sees in bounded
//! windows, split into all / successful ("ok") / failed ("ko") subsets, and
//! answers min, mean, max and percentile queries over those windows for the
//! teardown summary. Hit and failure counts cover the whole run.
//! [`UserMetrics`] tracks how many threads were active when samples
//! completed; [`ThreadCounts`] is the engine's view of started and finished
//! threads.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::MetricsError;
use crate::sample::SampleResult;

/// Percentiles reported in the teardown summary.
pub const SUMMARY_PERCENTILES: [f64; 4] = [50.0, 70.0, 90.0, 95.0];

/// Elapsed times retained per subset of a [`SamplerMetric`].
pub const DEFAULT_METRICS_WINDOW: usize = 100;

/// Sliding window over the latest values; the oldest value is evicted once
/// the window is full.
#[derive(Debug, Clone)]
struct Samples {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Samples {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn add(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }

    fn min(&self) -> f64 {
        self.values.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    fn max(&self) -> f64 {
        self.values.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Estimates the `p`th percentile: position `p * (n + 1) / 100`, linear
    /// interpolation between neighbours, clamped to the extremes.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn percentile(&self, p: f64) -> f64 {
        let values = self.sorted();
        let n = values.len();
        match n {
            0 => return 0.0,
            1 => return values[0],
            _ => {}
        }
        let position = p.clamp(0.0, 100.0) * (n as f64 + 1.0) / 100.0;
        if position < 1.0 {
            return values[0];
        }
        if position >= n as f64 {
            return values[n - 1];
        }
        let lower_index = position.floor() as usize;
        let fraction = position - position.floor();
        let lower = values[lower_index - 1];
        let upper = values[lower_index];
        lower + fraction * (upper - lower)
    }
}

/// Timing aggregates for one sample label.
#[derive(Debug, Clone)]
pub struct SamplerMetric {
    all: Samples,
    ok: Samples,
    ko: Samples,
    hits: u64,
    successes: u64,
    failures: u64,
}

impl Default for SamplerMetric {
    fn default() -> Self {
        Self::with_window(DEFAULT_METRICS_WINDOW)
    }
}

impl SamplerMetric {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `window` elapsed times per subset.
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            all: Samples::with_capacity(window),
            ok: Samples::with_capacity(window),
            ko: Samples::with_capacity(window),
            hits: 0,
            successes: 0,
            failures: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn add(&mut self, result: &SampleResult) -> Result<(), MetricsError> {
        if result.label.is_empty() {
            return Err(MetricsError::MissingLabel);
        }
        let elapsed = result.elapsed_ms as f64;
        self.hits += 1;
        self.all.add(elapsed);
        if result.is_success() {
            self.successes += 1;
            self.ok.add(elapsed);
        } else {
            self.failures += 1;
            self.ko.add(elapsed);
        }
        Ok(())
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Requests recorded over the whole run, including those that have left
    /// the timing window.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Elapsed times currently held across the three windows.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.all.len() + self.ok.len() + self.ko.len()
    }

    #[must_use]
    pub fn all_min(&self) -> f64 {
        self.all.min()
    }

    #[must_use]
    pub fn all_mean(&self) -> f64 {
        self.all.mean()
    }

    #[must_use]
    pub fn all_max(&self) -> f64 {
        self.all.max()
    }

    #[must_use]
    pub fn all_percentile(&self, p: f64) -> f64 {
        self.all.percentile(p)
    }

    #[must_use]
    pub fn ok_min(&self) -> f64 {
        self.ok.min()
    }

    #[must_use]
    pub fn ok_mean(&self) -> f64 {
        self.ok.mean()
    }

    #[must_use]
    pub fn ok_max(&self) -> f64 {
        self.ok.max()
    }

    #[must_use]
    pub fn ok_percentile(&self, p: f64) -> f64 {
        self.ok.percentile(p)
    }

    #[must_use]
    pub fn ko_min(&self) -> f64 {
        self.ko.min()
    }

    #[must_use]
    pub fn ko_mean(&self) -> f64 {
        self.ko.mean()
    }

    #[must_use]
    pub fn ko_max(&self) -> f64 {
        self.ko.max()
    }

    #[must_use]
    pub fn ko_percentile(&self, p: f64) -> f64 {
        self.ko.percentile(p)
    }
}

/// Active-thread statistics over every ingested result.
#[derive(Debug, Clone, Default)]
pub struct UserMetrics {
    min_active_threads: Option<u32>,
    max_active_threads: u32,
    active_threads_sum: u64,
    hits: u64,
    errors: u64,
}

impl UserMetrics {
    pub fn add(&mut self, result: &SampleResult) {
        let active = result.all_threads;
        self.min_active_threads = Some(self.min_active_threads.map_or(active, |m| m.min(active)));
        self.max_active_threads = self.max_active_threads.max(active);
        self.active_threads_sum += u64::from(active);
        self.hits += 1;
        if !result.is_success() {
            self.errors += 1;
        }
    }

    #[must_use]
    pub fn min_active_threads(&self) -> u32 {
        self.min_active_threads.unwrap_or(0)
    }

    #[must_use]
    pub fn mean_active_threads(&self) -> u32 {
        if self.hits == 0 {
            return 0;
        }
        u32::try_from(self.active_threads_sum / self.hits).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn max_active_threads(&self) -> u32 {
        self.max_active_threads
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors
    }
}

/// Everything ingestion accumulates: thread statistics and one
/// [`SamplerMetric`] per sample label, ordered by label.
#[derive(Debug, Default)]
pub struct Accumulators {
    pub user: UserMetrics,
    pub samplers: BTreeMap<String, SamplerMetric>,
}

impl Accumulators {
    /// Records `result` under its label.
    pub fn record_sample(&mut self, result: &SampleResult) -> Result<(), MetricsError> {
        if result.label.is_empty() {
            return Err(MetricsError::MissingLabel);
        }
        self.samplers
            .entry(result.label.clone())
            .or_default()
            .add(result)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCounts {
    pub active: u64,
    pub started: u64,
    pub finished: u64,
}

/// Thread counters owned by the load-test engine.
pub trait ThreadCountsSource: Send + Sync {
    fn thread_counts(&self) -> ThreadCounts;
}

/// Atomic thread counters a host can update as its threads start and stop.
#[derive(Debug, Default)]
pub struct SharedThreadCounts {
    started: AtomicU64,
    finished: AtomicU64,
}

impl SharedThreadCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_started(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
    }

    pub fn thread_finished(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    /// Raises the started count to at least `started`.
    pub fn observe_started(&self, started: u64) {
        self.started.fetch_max(started, Ordering::AcqRel);
    }
}

impl ThreadCountsSource for SharedThreadCounts {
    fn thread_counts(&self) -> ThreadCounts {
        let started = self.started.load(Ordering::Acquire);
        let finished = self.finished.load(Ordering::Acquire);
        ThreadCounts {
            active: started.saturating_sub(finished),
            started,
            finished,
        }
    }
}
