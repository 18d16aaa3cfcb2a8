// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic thread-concurrency snapshots.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::labels::{thread_metrics_labels, LabelSet};
use crate::metrics::{Accumulators, ThreadCountsSource};
use crate::queue::IntakeQueue;
use crate::report::thread_metrics_line;
use crate::streams::{LogEntry, LogLevel, StreamBatch};

pub struct MetricsSampler {
    queue: Arc<IntakeQueue>,
    accumulators: Arc<Mutex<Accumulators>>,
    thread_counts: Arc<dyn ThreadCountsSource>,
    labels: LabelSet,
}

impl MetricsSampler {
    /// `base` is the pipeline's base label set; snapshots are labelled as
    /// thread metrics on top of it.
    #[must_use]
    pub fn new(
        queue: Arc<IntakeQueue>,
        accumulators: Arc<Mutex<Accumulators>>,
        thread_counts: Arc<dyn ThreadCountsSource>,
        base: &LabelSet,
    ) -> Self {
        Self {
            queue,
            accumulators,
            thread_counts,
            labels: thread_metrics_labels(base),
        }
    }

    /// Pushes one batch holding a single INFO snapshot line.
    pub fn tick(&self) {
        let user = self
            .accumulators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .clone();
        let line = thread_metrics_line(&user, self.thread_counts.thread_counts());
        self.queue.push(StreamBatch::single(
            self.labels.clone(),
            LogEntry::new(LogLevel::Info, line),
        ));
    }

    pub async fn run(&self, initial_delay: Duration, period: Duration, cancel: CancellationToken) {
        let mut interval = interval_at(Instant::now() + initial_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("LOKI | Metrics sampler started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.tick())).is_err() {
                        error!("LOKI | Metrics snapshot panicked, skipping it");
                    }
                }
            }
        }
        debug!("LOKI | Metrics sampler stopped");
    }
}
