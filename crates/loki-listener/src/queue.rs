// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unbounded intake queue with in-flight accounting.
//!
//! ```text
//!   ingest ──┐                         ┌──> InFlight ticket ──> send completion
//!            ├──> push ──> [ FIFO ] ──> pop
//!   sampler ─┘      │                  (does not touch pending)
//!                   └──> pending += 1            pending -= 1 <──┘
//! ```
//!
//! The pending count tracks batches that were pushed but whose transmission
//! has not completed yet. Popping a batch hands out an [`InFlight`] ticket and
//! leaves the count untouched; the count only goes down when the ticket is
//! completed (or dropped), once the send has finished. An empty queue is
//! therefore not the same as a drained one: a popped batch may still be on the
//! wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::streams::StreamBatch;

#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    changed: Notify,
}

impl Pending {
    fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        // Saturating: the count never goes below zero.
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.changed.notify_one();
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Proof that one batch is still pending.
///
/// Completing or dropping the ticket decrements the pending count, so each
/// ticket accounts for exactly one decrement.
#[must_use = "dropping the ticket marks the batch as completed"]
#[derive(Debug)]
pub struct InFlight {
    pending: Arc<Pending>,
}

impl InFlight {
    /// Marks the transmission attempt as finished.
    pub fn complete(self) {}
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pending.decrement();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// The maximum drain time elapsed with batches still pending.
    TimedOut { remaining: usize },
}

#[derive(Debug)]
pub struct IntakeQueue {
    tx: mpsc::UnboundedSender<StreamBatch>,
    rx: Mutex<mpsc::UnboundedReceiver<StreamBatch>>,
    queued: AtomicUsize,
    pending: Arc<Pending>,
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IntakeQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            pending: Arc::new(Pending::default()),
        }
    }

    /// Appends `batch` to the tail. Never blocks.
    pub fn push(&self, batch: StreamBatch) {
        self.pending.increment();
        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.tx.send(batch) {
            // The receiver lives as long as the queue, so this is unreachable
            // in practice; undo the accounting so the drain cannot hang.
            error!("LOKI | Failed to enqueue stream batch: {e}");
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.pending.decrement();
        }
    }

    /// Takes the head batch, if any. Never blocks and leaves the pending count
    /// alone: the returned ticket carries the decrement.
    pub fn pop(&self) -> Option<(StreamBatch, InFlight)> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = rx.try_recv().ok()?;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Some((
            batch,
            InFlight {
                pending: Arc::clone(&self.pending),
            },
        ))
    }

    /// Counts a batch that is sent without going through the queue.
    pub fn track(&self) -> InFlight {
        self.pending.increment();
        InFlight {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Batches pushed (or tracked) whose transmission has not completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Batches waiting to be popped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the pending count reaches zero.
    ///
    /// Checks the count every `poll_interval`, or earlier when a ticket
    /// completes. An early wake-up is logged and the loop re-checks. With
    /// `max_wait` set, gives up once that much time has passed.
    pub async fn wait_until_drained(
        &self,
        poll_interval: Duration,
        max_wait: Option<Duration>,
    ) -> DrainOutcome {
        let started = Instant::now();
        loop {
            let remaining = self.pending();
            if remaining == 0 {
                return DrainOutcome::Drained;
            }

            let mut sleep_for = poll_interval;
            if let Some(max_wait) = max_wait {
                let elapsed = started.elapsed();
                if elapsed >= max_wait {
                    warn!(
                        "LOKI | Gave up waiting for pending batches after {} ms, {remaining} remaining",
                        elapsed.as_millis()
                    );
                    return DrainOutcome::TimedOut { remaining };
                }
                sleep_for = sleep_for.min(max_wait - elapsed);
            }

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {
                    info!("LOKI | Wait to complete send, remaining {}", self.pending());
                }
                () = self.pending.changed.notified() => {
                    debug!("LOKI | Drain wait woken early, remaining {}", self.pending());
                }
            }
        }
    }
}
