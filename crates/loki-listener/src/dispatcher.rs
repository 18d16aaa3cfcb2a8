// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic task that moves batches from the intake queue to Loki.
//!
//! Every tick pops at most one batch, encodes it and hands it to the client
//! without waiting for the response. The batch stays pending until the send
//! completes; the completion callback logs the outcome and releases the
//! batch's [`InFlight`] ticket.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{LokiClient, SendResult};
use crate::encoder::{encode_or_diagnostic, PayloadEncoder};
use crate::errors::ClientError;
use crate::labels::LabelSet;
use crate::queue::{InFlight, IntakeQueue};

pub struct Dispatcher {
    queue: Arc<IntakeQueue>,
    client: Arc<LokiClient>,
    encoder: Arc<dyn PayloadEncoder>,
    /// Labels for the diagnostic batch sent when encoding fails.
    labels: LabelSet,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        queue: Arc<IntakeQueue>,
        client: Arc<LokiClient>,
        encoder: Arc<dyn PayloadEncoder>,
        labels: LabelSet,
    ) -> Self {
        Self {
            queue,
            client,
            encoder,
            labels,
        }
    }

    /// Dispatches the head of the queue, if any. Returns whether a batch was
    /// handed to the client.
    pub fn tick(&self) -> Result<bool, ClientError> {
        if self.queue.is_empty() {
            return Ok(false);
        }
        let Some((batch, ticket)) = self.queue.pop() else {
            return Ok(false);
        };
        let payload = encode_or_diagnostic(self.encoder.as_ref(), &batch, &self.labels);
        debug!(
            "LOKI | Loki Request Payload: {}",
            String::from_utf8_lossy(&payload)
        );
        // If the client refuses the send, the callback and its ticket are
        // dropped, which still releases the pending count.
        self.client
            .send_async(payload, move |result| complete_send(result, ticket))?;
        Ok(true)
    }

    /// Ticks after `initial_delay` and then every `period` until `cancel`
    /// fires. A tick that is running when `cancel` fires is finished first.
    ///
    /// A panicking tick is logged and the loop keeps going. The batch it had
    /// popped is lost, and dropping its ticket during the unwind releases the
    /// pending count.
    pub async fn run(&self, initial_delay: Duration, period: Duration, cancel: CancellationToken) {
        let mut interval = interval_at(Instant::now() + initial_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("LOKI | Dispatcher started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.tick())) {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("LOKI | Failed to dispatch stream batch: {e}"),
                        Err(_) => error!("LOKI | Dispatch tick panicked, stream batch dropped"),
                    }
                }
            }
        }
        debug!("LOKI | Dispatcher stopped");
    }
}

/// Logs the outcome of a send and releases its pending slot.
pub(crate) fn complete_send(result: SendResult, ticket: InFlight) {
    log_response(&result);
    ticket.complete();
}

pub(crate) fn log_response(result: &SendResult) {
    debug!("============= Send Log To Loki ===================");
    match result {
        Ok(response) => {
            debug!("LOKI | status={} body={}", response.status, response.body);
            if !response.is_accepted() {
                error!(
                    "LOKI | Error in send loki log with status code [{}] and error [{}]",
                    response.status, response.body
                );
            }
        }
        Err(e) => error!("LOKI | Error in send loki log: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::RecordingTransport;
    use crate::encoder::tests::{FailingEncoder, PanicOnceEncoder};
    use crate::encoder::JsonEncoder;
    use crate::streams::{LogEntry, LogLevel, StreamBatch};
    use tokio::runtime::Handle;

    fn batch(text: &str) -> StreamBatch {
        StreamBatch::single(LabelSet::new(), LogEntry::new(LogLevel::Info, text))
    }

    fn dispatcher(
        transport: Arc<RecordingTransport>,
        encoder: Arc<dyn PayloadEncoder>,
    ) -> (Dispatcher, Arc<IntakeQueue>, Arc<LokiClient>) {
        let queue = Arc::new(IntakeQueue::new());
        let client = Arc::new(LokiClient::new(transport, Handle::current()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&client),
            encoder,
            LabelSet::from_pairs([("jmeter_plugin", "loki-log")]),
        );
        (dispatcher, queue, client)
    }

    #[tokio::test]
    async fn empty_queue_tick_is_a_noop() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, _) = dispatcher(transport.clone(), Arc::new(JsonEncoder));
        assert!(!dispatcher.tick().unwrap());
        assert_eq!(queue.pending(), 0);
        assert!(transport.payloads().is_empty());
    }

    #[tokio::test]
    async fn one_batch_per_tick_in_fifo_order() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, client) = dispatcher(transport.clone(), Arc::new(JsonEncoder));
        queue.push(batch("first"));
        queue.push(batch("second"));

        assert!(dispatcher.tick().unwrap());
        assert_eq!(queue.len(), 1);
        assert!(dispatcher.tick().unwrap());
        assert!(!dispatcher.tick().unwrap());

        client.stop(Duration::from_secs(5)).await;
        assert_eq!(queue.pending(), 0);

        let texts: Vec<String> = transport
            .payloads()
            .iter()
            .map(|p| {
                let parsed: StreamBatch = serde_json::from_slice(p).unwrap();
                parsed.streams()[0].entries()[0].text().to_string()
            })
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn rejected_status_still_releases_the_batch() {
        let transport = Arc::new(RecordingTransport::new(500));
        let (dispatcher, queue, client) = dispatcher(transport, Arc::new(JsonEncoder));
        queue.push(batch("a"));
        dispatcher.tick().unwrap();
        client.stop(Duration::from_secs(5)).await;

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn encoding_failure_sends_diagnostic() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, client) = dispatcher(transport.clone(), Arc::new(FailingEncoder));
        queue.push(batch("a"));
        assert!(dispatcher.tick().unwrap());
        client.stop(Duration::from_secs(5)).await;

        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 1);
        let parsed: StreamBatch = serde_json::from_slice(&payloads[0]).unwrap();
        let entry = &parsed.streams()[0].entries()[0];
        assert_eq!(entry.level(), LogLevel::Error);
        assert!(entry.text().starts_with("[Error] Can't generate test metrics"));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn stopped_client_releases_the_batch() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, client) = dispatcher(transport, Arc::new(JsonEncoder));
        client.stop(Duration::from_secs(1)).await;
        queue.push(batch("late"));

        assert!(matches!(dispatcher.tick(), Err(ClientError::Stopped)));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_cancelled() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, client) = dispatcher(transport.clone(), Arc::new(JsonEncoder));
        for i in 0..3 {
            queue.push(batch(&i.to_string()));
        }
        let dispatcher = Arc::new(dispatcher);
        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .run(Duration::from_millis(500), Duration::from_millis(500), cancel)
                    .await;
            })
        };

        // Ticks at 500, 1000 and 1500 ms.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        cancel.cancel();
        task.await.unwrap();
        client.stop(Duration::from_secs(1)).await;

        assert_eq!(transport.payloads().len(), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_a_panicking_tick() {
        let transport = Arc::new(RecordingTransport::new(204));
        let (dispatcher, queue, client) =
            dispatcher(transport.clone(), Arc::new(PanicOnceEncoder::default()));
        for i in 0..3 {
            queue.push(batch(&i.to_string()));
        }
        let dispatcher = Arc::new(dispatcher);
        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .run(Duration::from_millis(500), Duration::from_millis(500), cancel)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!task.is_finished());
        cancel.cancel();
        task.await.unwrap();
        client.stop(Duration::from_secs(1)).await;

        let texts: Vec<String> = transport
            .payloads()
            .iter()
            .map(|p| {
                let parsed: StreamBatch = serde_json::from_slice(p).unwrap();
                parsed.streams()[0].entries()[0].text().to_string()
            })
            .collect();
        assert_eq!(texts, vec!["1", "2"]);
        assert_eq!(queue.pending(), 0);
    }
}
