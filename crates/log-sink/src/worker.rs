// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sends sealed batches to the store and drives their retries.
//!
//! Every batch received from the batcher gets its own task. A task holds a
//! "pending" permit for as long as the batch is owned by the worker, and a
//! request permit only while a bulk request is on the wire, so retry
//! sleeps never occupy a request slot.
//!
//! ```text
//!   Batcher ──mpsc──> run() ──spawn──> deliver_batch()
//!                                          │
//!                              acquire request permit
//!                                          │
//!                                    process(attempt)
//!                                   /        |        \
//!                           Delivered    Retrying    Dropped
//!                                            │
//!                                  sleep until next_retry_at
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::Receiver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batcher::Batch;
use crate::config::DataStreamName;
use crate::error::DeliveryError;
use crate::record::LogRecord;
use crate::retry::{DeliveryAttempt, RetryController, RetryDecision};
use crate::stats::SinkStats;
use crate::store::{BulkStore, ItemStatus};

/// Result of one bulk request for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(usize),
    /// Some documents were accepted. Retryable rejections form `retry`;
    /// `rejected` documents were refused for good and are dropped.
    Partial {
        delivered: usize,
        retry: Option<Batch>,
        rejected: usize,
        error: DeliveryError,
    },
    Failed(DeliveryError),
    Fatal(DeliveryError),
}

pub struct DeliveryWorker {
    store: Arc<dyn BulkStore>,
    stream: DataStreamName,
    controller: RetryController,
    stats: Arc<SinkStats>,
    request_permits: Arc<Semaphore>,
    pending_permits: Arc<Semaphore>,
    hard_stop: CancellationToken,
    abandoned_sample: Mutex<Option<String>>,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        store: Arc<dyn BulkStore>,
        stream: DataStreamName,
        controller: RetryController,
        stats: Arc<SinkStats>,
        max_in_flight: usize,
        max_pending_batches: usize,
        hard_stop: CancellationToken,
    ) -> Self {
        DeliveryWorker {
            store,
            stream,
            controller,
            stats,
            request_permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            pending_permits: Arc::new(Semaphore::new(max_pending_batches.max(1))),
            hard_stop,
            abandoned_sample: Mutex::new(None),
        }
    }

    /// Message of a record from a batch abandoned by a hard stop, if any.
    pub fn abandoned_sample(&self) -> Option<String> {
        self.abandoned_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consumes batches until the batcher hangs up and every batch reached a
    /// terminal state, or until the hard stop token fires.
    pub async fn run(self: Arc<Self>, mut rx: Receiver<Batch>) {
        debug!("DELIVERY | Worker started for data stream {}", self.stream);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = self.hard_stop.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join_result(result),
                pending = Arc::clone(&self.pending_permits).acquire_owned() => {
                    let Ok(pending) = pending else { break };
                    let batch = tokio::select! {
                        biased;
                        () = self.hard_stop.cancelled() => break,
                        batch = rx.recv() => batch,
                    };
                    let Some(batch) = batch else {
                        debug!("DELIVERY | Batcher closed, finishing outstanding batches");
                        break;
                    };
                    // Taking the request permit here, in arrival order, keeps
                    // first attempts ordered by batch id.
                    let request = tokio::select! {
                        biased;
                        () = self.hard_stop.cancelled() => {
                            self.note_abandoned(&batch);
                            break;
                        }
                        request = Arc::clone(&self.request_permits).acquire_owned() => request,
                    };
                    let Ok(request) = request else { break };
                    tasks.spawn(Arc::clone(&self).deliver_batch(batch, pending, request));
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            log_join_result(result);
        }

        if self.hard_stop.is_cancelled() {
            while let Ok(batch) = rx.try_recv() {
                self.note_abandoned(&batch);
            }
        }
        debug!("DELIVERY | Worker stopped");
    }

    async fn deliver_batch(
        self: Arc<Self>,
        batch: Batch,
        _pending: OwnedSemaphorePermit,
        first_request: OwnedSemaphorePermit,
    ) {
        let mut attempt = DeliveryAttempt::new(batch);
        let mut request = Some(first_request);

        loop {
            let permit = match request.take() {
                Some(permit) => permit,
                None => {
                    let acquired = tokio::select! {
                        biased;
                        () = self.hard_stop.cancelled() => {
                            self.note_abandoned(attempt.batch());
                            return;
                        }
                        permit = Arc::clone(&self.request_permits).acquire_owned() => permit,
                    };
                    let Ok(permit) = acquired else { return };
                    permit
                }
            };

            let retry = tokio::select! {
                biased;
                () = self.hard_stop.cancelled() => None,
                retry = self.process(&mut attempt) => Some(retry),
            };
            drop(permit);

            match retry {
                None => {
                    self.note_abandoned(attempt.batch());
                    return;
                }
                Some(false) => return,
                Some(true) => {}
            }

            if let Some(next_retry_at) = attempt.next_retry_at() {
                tokio::select! {
                    biased;
                    () = self.hard_stop.cancelled() => {
                        self.note_abandoned(attempt.batch());
                        return;
                    }
                    () = sleep_until(next_retry_at) => {}
                }
            }
        }
    }

    /// Sends the batch once and classifies the response.
    pub async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let statuses = match self.store.bulk_write(&self.stream, batch.records()).await {
            Ok(statuses) => statuses,
            Err(e) if e.is_retryable() => return DeliveryOutcome::Failed(e),
            Err(e) => return DeliveryOutcome::Fatal(e),
        };

        if statuses.len() != batch.len() {
            return DeliveryOutcome::Failed(DeliveryError::InvalidResponse(format!(
                "expected {} items, got {}",
                batch.len(),
                statuses.len()
            )));
        }

        let mut delivered = 0;
        let mut retry_records: Vec<LogRecord> = Vec::new();
        let mut retry_reason = None;
        let mut rejected = 0;
        let mut rejected_reason = None;

        for (record, status) in batch.records().iter().zip(statuses) {
            match status {
                ItemStatus::Accepted => delivered += 1,
                ItemStatus::Retryable { status, reason } => {
                    retry_records.push(record.clone());
                    retry_reason.get_or_insert_with(|| format!("{status} {reason}"));
                }
                ItemStatus::Rejected { status, reason } => {
                    rejected += 1;
                    rejected_reason.get_or_insert_with(|| format!("{status} {reason}"));
                }
            }
        }

        if let Some(reason) = &rejected_reason {
            error!(
                "DELIVERY | Store refused {} documents of batch {} ({} records): {}",
                rejected,
                batch.id(),
                batch.len(),
                reason
            );
        }

        let retry_count = retry_records.len();
        match (delivered, retry_count, rejected) {
            (_, 0, 0) => DeliveryOutcome::Delivered(delivered),
            (0, _, 0) => DeliveryOutcome::Failed(DeliveryError::PartialRejection {
                rejected: retry_count,
                reason: retry_reason.unwrap_or_default(),
            }),
            (0, 0, _) => DeliveryOutcome::Fatal(DeliveryError::Mapping(
                rejected_reason.unwrap_or_default(),
            )),
            _ => {
                let (retry, error) = if retry_count > 0 {
                    (
                        Some(Batch::new(batch.id(), retry_records)),
                        DeliveryError::PartialRejection {
                            rejected: retry_count,
                            reason: retry_reason.unwrap_or_default(),
                        },
                    )
                } else {
                    (None, DeliveryError::Mapping(rejected_reason.unwrap_or_default()))
                };
                DeliveryOutcome::Partial {
                    delivered,
                    retry,
                    rejected,
                    error,
                }
            }
        }
    }

    /// Runs one attempt. Returns `true` when the attempt (possibly replaced by
    /// the retryable remainder of a partial success) is scheduled again.
    pub async fn process(&self, attempt: &mut DeliveryAttempt) -> bool {
        attempt.start();
        let size = attempt.batch().len();
        let outcome = {
            let _in_flight = InFlight::new(&self.stats, size);
            self.deliver(attempt.batch()).await
        };

        match outcome {
            DeliveryOutcome::Delivered(delivered) => {
                debug!(
                    "DELIVERY | Delivered batch {} ({} records) after {} retries",
                    attempt.batch().id(),
                    delivered,
                    attempt.attempt_count()
                );
                self.stats.record_delivered(delivered);
                attempt.succeed();
                false
            }
            DeliveryOutcome::Failed(e) => self.retry_or_drop(attempt, e),
            DeliveryOutcome::Fatal(e) => {
                self.controller.on_fatal(attempt, e);
                self.log_drop(attempt);
                self.stats.record_dropped(size);
                false
            }
            DeliveryOutcome::Partial {
                delivered,
                retry,
                rejected,
                error,
            } => {
                debug!(
                    "DELIVERY | Batch {} partially delivered: {} accepted, {} to retry, {} refused",
                    attempt.batch().id(),
                    delivered,
                    retry.as_ref().map_or(0, Batch::len),
                    rejected
                );
                self.stats.record_delivered(delivered);
                self.stats.record_dropped(rejected);
                let Some(retry) = retry else {
                    attempt.succeed();
                    return false;
                };
                let remainder = DeliveryAttempt::split_from(attempt, retry);
                attempt.succeed();
                *attempt = remainder;
                self.retry_or_drop(attempt, error)
            }
        }
    }

    fn retry_or_drop(&self, attempt: &mut DeliveryAttempt, error: DeliveryError) -> bool {
        let size = attempt.batch().len();
        match self.controller.on_failure(attempt, error) {
            RetryDecision::Retry { delay } => {
                warn!(
                    "DELIVERY | Batch {} ({} records) failed on attempt {}: {}. Retrying in {:?}",
                    attempt.batch().id(),
                    size,
                    attempt.attempt_count(),
                    attempt
                        .last_error()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    delay
                );
                self.stats.record_retried(size);
                true
            }
            RetryDecision::Drop => {
                self.log_drop(attempt);
                self.stats.record_dropped(size);
                false
            }
        }
    }

    fn log_drop(&self, attempt: &DeliveryAttempt) {
        error!(
            "DELIVERY | Dropping batch {} ({} records) after {} attempts: {}. First message: {:?}",
            attempt.batch().id(),
            attempt.batch().len(),
            attempt.attempt_count(),
            attempt
                .last_error()
                .map(ToString::to_string)
                .unwrap_or_default(),
            attempt.batch().sample().unwrap_or_default()
        );
    }

    fn note_abandoned(&self, batch: &Batch) {
        warn!(
            "DELIVERY | Abandoning batch {} ({} records) at shutdown deadline",
            batch.id(),
            batch.len()
        );
        let mut sample = self
            .abandoned_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sample.is_none() {
            *sample = batch.sample().map(str::to_string);
        }
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("DELIVERY | Delivery task failed: {e}");
    }
}

/// Counts records on the wire for the lifetime of a request, including
/// requests cut short by a hard stop.
struct InFlight<'a> {
    stats: &'a SinkStats,
    records: usize,
}

impl<'a> InFlight<'a> {
    fn new(stats: &'a SinkStats, records: usize) -> Self {
        stats.request_started(records);
        InFlight { stats, records }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.stats.request_finished(self.records);
    }
}
