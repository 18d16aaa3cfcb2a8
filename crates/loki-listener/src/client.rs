// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Send pool in front of a [`Transport`].
//!
//! Sends run as tasks on the runtime the client was created on and are
//! tracked so shutdown can wait for them. [`LokiClient::send_async`] is
//! fire-and-forget: the completion callback observes the outcome.
//! [`LokiClient::stop`] closes the pool, gives in-flight sends a grace period
//! and cancels whatever is left.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::errors::ClientError;
use crate::transport::{LokiResponse, Transport};

pub type SendResult = Result<LokiResponse, ClientError>;

pub struct LokiClient {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl LokiClient {
    /// Creates a client whose sends run on `runtime`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self {
            transport,
            runtime,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts sending `payload` and returns immediately. `on_complete` runs
    /// exactly once with the outcome, including when the send is cancelled by
    /// [`LokiClient::stop`].
    pub fn send_async<F>(&self, payload: Bytes, on_complete: F) -> Result<(), ClientError>
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(ClientError::Stopped);
        }
        let send = self.send_task(payload);
        self.tracker.spawn_on(
            async move {
                on_complete(send.await);
            },
            &self.runtime,
        );
        Ok(())
    }

    /// Sends `payload` through the pool and waits for the outcome.
    pub async fn send(&self, payload: Bytes) -> SendResult {
        if self.tracker.is_closed() {
            return Err(ClientError::Stopped);
        }
        let handle = self.tracker.spawn_on(self.send_task(payload), &self.runtime);
        handle.await.unwrap_or(Err(ClientError::Cancelled))
    }

    fn send_task(
        &self,
        payload: Bytes,
    ) -> impl std::future::Future<Output = SendResult> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        async move {
            tokio::select! {
                result = transport.send(payload) => result.map_err(ClientError::from),
                () = cancel.cancelled() => Err(ClientError::Cancelled),
            }
        }
    }

    /// Sends started and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stops accepting sends and waits up to `grace` for in-flight ones, then
    /// cancels the rest.
    pub async fn stop(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "LOKI | {} sends still in flight after {} ms, cancelling them",
                self.in_flight(),
                grace.as_millis()
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }
        debug!("LOKI | Client stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::TransportError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Transport that answers with a fixed status after an optional delay and
    /// records every payload.
    pub(crate) struct RecordingTransport {
        pub(crate) status: u16,
        pub(crate) delay: Duration,
        pub(crate) payloads: Mutex<Vec<Bytes>>,
    }

    impl RecordingTransport {
        pub(crate) fn new(status: u16) -> Self {
            Self {
                status,
                delay: Duration::ZERO,
                payloads: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn payloads(&self) -> Vec<Bytes> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, payload: Bytes) -> Result<LokiResponse, TransportError> {
            self.payloads.lock().unwrap().push(payload);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(LokiResponse {
                status: self.status,
                body: String::new(),
            })
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _payload: Bytes) -> Result<LokiResponse, TransportError> {
            Err(TransportError::Request("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn send_async_invokes_callback() {
        let transport = Arc::new(RecordingTransport::new(204));
        let client = LokiClient::new(transport.clone(), Handle::current());
        let (tx, rx) = oneshot::channel();

        client
            .send_async(Bytes::from_static(b"payload"), move |result| {
                let _ = tx.send(result.map(|r| r.status).ok());
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), Some(204));
        assert_eq!(transport.payloads(), vec![Bytes::from_static(b"payload")]);
    }

    #[tokio::test]
    async fn transport_errors_reach_the_callback() {
        let client = LokiClient::new(Arc::new(FailingTransport), Handle::current());
        let (tx, rx) = oneshot::channel();
        client
            .send_async(Bytes::from_static(b"x"), move |result| {
                let _ = tx.send(matches!(result, Err(ClientError::Transport(_))));
            })
            .unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn stopped_client_rejects_sends() {
        let client = LokiClient::new(Arc::new(RecordingTransport::new(200)), Handle::current());
        client.stop(Duration::from_secs(1)).await;
        assert!(client.is_stopped());
        assert!(matches!(
            client.send_async(Bytes::new(), |_| {}),
            Err(ClientError::Stopped)
        ));
        assert!(matches!(
            client.send(Bytes::new()).await,
            Err(ClientError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_sends() {
        let mut transport = RecordingTransport::new(200);
        transport.delay = Duration::from_secs(3);
        let client = LokiClient::new(Arc::new(transport), Handle::current());
        let (tx, rx) = oneshot::channel();
        client
            .send_async(Bytes::new(), move |result| {
                let _ = tx.send(result.is_ok());
            })
            .unwrap();

        client.stop(Duration::from_secs(15)).await;
        assert_eq!(client.in_flight(), 0);
        assert!(rx.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_sends_past_the_grace_period() {
        let mut transport = RecordingTransport::new(200);
        transport.delay = Duration::from_secs(3600);
        let client = LokiClient::new(Arc::new(transport), Handle::current());
        let (tx, rx) = oneshot::channel();
        client
            .send_async(Bytes::new(), move |result| {
                let _ = tx.send(matches!(result, Err(ClientError::Cancelled)));
            })
            .unwrap();

        client.stop(Duration::from_secs(1)).await;
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn awaited_send_returns_response() {
        let client = LokiClient::new(Arc::new(RecordingTransport::new(200)), Handle::current());
        let response = client.send(Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(response.status, 200);
    }
}
