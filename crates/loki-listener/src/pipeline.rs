// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the listener: start, ingestion and the teardown drain.
//!
//! ```text
//!   Idle --start--> Running --stop--> Draining --drained--> Stopped
//! ```
//!
//! [`Pipeline::stop`] stops the metrics sampler, waits until every pushed
//! batch has finished sending, stops the dispatcher and then sends one final
//! summary batch through the client before shutting it down.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::LokiClient;
use crate::config::LokiConfig;
use crate::dispatcher::{complete_send, Dispatcher};
use crate::encoder::{encode_or_diagnostic, JsonEncoder, PayloadEncoder};
use crate::errors::{MetricsError, PipelineError};
use crate::labels::{
    base_labels, response_body_labels, response_header_labels, sampler_metrics_labels, LabelSet,
};
use crate::metrics::{Accumulators, ThreadCountsSource};
use crate::queue::{DrainOutcome, IntakeQueue};
use crate::report::{response_body_line, response_header_line, sampler_summary_line};
use crate::sample::SampleResult;
use crate::sampler::MetricsSampler;
use crate::streams::{LogEntry, LogLevel, LogStream, StreamBatch};
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct PeriodicTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Prevents further ticks and waits for a tick in progress to finish.
    async fn shutdown(self, name: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("LOKI | {name} task ended abnormally: {e}");
        }
    }
}

struct RunningTasks {
    client: Arc<LokiClient>,
    dispatcher: PeriodicTask,
    sampler: PeriodicTask,
}

pub struct Pipeline {
    config: LokiConfig,
    base_labels: LabelSet,
    header_labels: LabelSet,
    body_labels: LabelSet,
    encoder: Arc<dyn PayloadEncoder>,
    queue: Arc<IntakeQueue>,
    /// Also serializes `ingest` calls and their state check.
    accumulators: Arc<Mutex<Accumulators>>,
    state: Mutex<PipelineState>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: LokiConfig) -> Self {
        let base = base_labels(&config.external_labels);
        Self {
            header_labels: response_header_labels(&base),
            body_labels: response_body_labels(&base),
            base_labels: base,
            config,
            encoder: Arc::new(JsonEncoder),
            queue: Arc::new(IntakeQueue::new()),
            accumulators: Arc::new(Mutex::new(Accumulators::default())),
            state: Mutex::new(PipelineState::Idle),
            tasks: Mutex::new(None),
        }
    }

    /// Replaces the payload encoder used for every batch.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn PayloadEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Starts the pipeline against the HTTP endpoint in the configuration.
    pub fn start(&self, thread_counts: Arc<dyn ThreadCountsSource>) -> Result<(), PipelineError> {
        self.config.validate()?;
        let transport = HttpTransport::new(&self.config)?;
        info!("LOKI | Pushing logs to {}", transport.url());
        self.start_with_transport(Arc::new(transport), thread_counts)
    }

    /// Starts the pipeline on the current tokio runtime, sending through
    /// `transport`.
    ///
    /// Nothing is spawned until every fallible step has succeeded, so a
    /// failed start leaves the pipeline idle with nothing to unwind.
    pub fn start_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        thread_counts: Arc<dyn ThreadCountsSource>,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != PipelineState::Idle {
            return Err(PipelineError::InvalidState {
                operation: "start",
                state: *state,
            });
        }
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;

        let client = Arc::new(LokiClient::new(transport, runtime.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.queue),
            Arc::clone(&client),
            Arc::clone(&self.encoder),
            self.base_labels.clone(),
        ));
        let sampler = Arc::new(MetricsSampler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.accumulators),
            thread_counts,
            &self.base_labels,
        ));

        let dispatcher_cancel = CancellationToken::new();
        let dispatcher_handle = {
            let cancel = dispatcher_cancel.clone();
            let initial_delay = self.config.dispatch_initial_delay;
            let period = self.config.send_batch_interval;
            runtime.spawn(async move { dispatcher.run(initial_delay, period, cancel).await })
        };
        let sampler_cancel = CancellationToken::new();
        let sampler_handle = {
            let cancel = sampler_cancel.clone();
            let initial_delay = self.config.metrics_initial_delay;
            let period = self.config.metrics_interval;
            runtime.spawn(async move { sampler.run(initial_delay, period, cancel).await })
        };

        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunningTasks {
            client,
            dispatcher: PeriodicTask {
                cancel: dispatcher_cancel,
                handle: dispatcher_handle,
            },
            sampler: PeriodicTask {
                cancel: sampler_cancel,
                handle: sampler_handle,
            },
        });
        *state = PipelineState::Running;
        info!(
            "LOKI | Started, batch size {}, dispatching every {} ms",
            self.config.batch_size,
            self.config.send_batch_interval.as_millis()
        );
        Ok(())
    }

    /// Turns `results` into one batch and queues it.
    ///
    /// Results arriving when the pipeline is not running are dropped.
    pub fn ingest(&self, results: Vec<SampleResult>) {
        let mut accumulators = self
            .accumulators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = self.state();
        if state != PipelineState::Running {
            warn!(
                "LOKI | Dropping {} sample results, pipeline is {state}",
                results.len()
            );
            return;
        }
        debug!("LOKI | Store sampler results to loki database");

        let results = flatten_results(results);
        let unlabelled = record_metrics(&mut accumulators, &results);
        if unlabelled > 0 {
            warn!("LOKI | {unlabelled} sample results without a label left out of the summary");
        }
        let batch = build_batch(
            &results,
            self.config.batch_size,
            &self.header_labels,
            &self.body_labels,
        );
        self.queue.push(batch);
    }

    /// Drains the queue and shuts the pipeline down.
    ///
    /// Returns once the summary batch has been sent and the client stopped.
    /// Calling it on a pipeline that is not running does nothing.
    pub async fn stop(&self) {
        {
            // Holding the ingest lock makes the transition visible to every
            // later ingest call.
            let _ingest = self
                .accumulators
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != PipelineState::Running {
                warn!("LOKI | Ignoring stop, pipeline is {state}");
                return;
            }
            *state = PipelineState::Draining;
        }
        let Some(tasks) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            self.set_state(PipelineState::Stopped);
            return;
        };

        info!("LOKI | Stopping, {} batches pending", self.queue.pending());
        tasks.sampler.shutdown("Metrics sampler").await;

        match self
            .queue
            .wait_until_drained(self.config.drain_poll_interval, self.config.max_drain_time)
            .await
        {
            DrainOutcome::Drained => debug!("LOKI | All pending batches sent"),
            DrainOutcome::TimedOut { remaining } => {
                warn!("LOKI | Stopping with {remaining} batches still pending");
            }
        }
        tasks.dispatcher.shutdown("Dispatcher").await;

        let summary = self.summary_batch();
        let payload = encode_or_diagnostic(self.encoder.as_ref(), &summary, &self.base_labels);
        debug!(
            "LOKI | Summary Payload: {}",
            String::from_utf8_lossy(&payload)
        );
        let ticket = self.queue.track();
        let result = tasks.client.send(payload).await;
        complete_send(result, ticket);

        tasks.client.stop(self.config.shutdown_grace).await;
        self.set_state(PipelineState::Stopped);
        info!("LOKI | Stopped");
    }

    /// One INFO line per sample label, in label order.
    fn summary_batch(&self) -> StreamBatch {
        let accumulators = self
            .accumulators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            "LOKI | {} sample results ingested, {} with errors",
            accumulators.user.hits(),
            accumulators.user.errors()
        );
        let mut stream = LogStream::new(sampler_metrics_labels(&self.base_labels));
        for (label, metric) in &accumulators.samplers {
            stream.push(LogEntry::new(
                LogLevel::Info,
                sampler_summary_line(label, metric),
            ));
        }
        let mut batch = StreamBatch::new();
        batch.push_stream(stream);
        batch
    }

    fn set_state(&self, next: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batches pushed whose send has not completed yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    #[must_use]
    pub fn config(&self) -> &LokiConfig {
        &self.config
    }
}

/// Applies the request prefix and appends each result's direct sub-results
/// right after it.
pub(crate) fn flatten_results(results: Vec<SampleResult>) -> Vec<SampleResult> {
    let mut flattened = Vec::with_capacity(results.len());
    for mut result in results {
        result.apply_request_prefix();
        let sub_results = std::mem::take(&mut result.sub_results);
        flattened.push(result);
        for mut sub_result in sub_results {
            sub_result.apply_request_prefix();
            flattened.push(sub_result);
        }
    }
    flattened
}

/// Feeds every result to the thread statistics and to its label's timing
/// aggregates. Returns how many results had no label and so no aggregate.
pub(crate) fn record_metrics(accumulators: &mut Accumulators, results: &[SampleResult]) -> usize {
    let mut unlabelled = 0;
    for result in results {
        accumulators.user.add(result);
        match accumulators.record_sample(result) {
            Ok(()) => {}
            Err(MetricsError::MissingLabel) => unlabelled += 1,
        }
    }
    unlabelled
}

/// Splits `results` into chunks of at most `batch_size` and gives every chunk
/// a response-header stream followed by a response-body stream.
pub(crate) fn build_batch(
    results: &[SampleResult],
    batch_size: usize,
    header_labels: &LabelSet,
    body_labels: &LabelSet,
) -> StreamBatch {
    let mut batch = StreamBatch::new();
    for chunk in results.chunks(batch_size.max(1)) {
        let mut headers = LogStream::new(header_labels.clone());
        let mut bodies = LogStream::new(body_labels.clone());
        for result in chunk {
            headers.push(LogEntry::new(result.level(), response_header_line(result)));
            bodies.push(LogEntry::new(result.level(), response_body_line(result)));
        }
        batch.push_stream(headers);
        batch.push_stream(bodies);
    }
    batch
}
