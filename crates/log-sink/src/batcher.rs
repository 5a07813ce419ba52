// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups queued records into delivery batches.
//!
//! A batch is sealed when it reaches `max_batch_size` records or when
//! `max_batch_age` has elapsed since its first record was taken from the
//! queue, whichever comes first. Sealed batches go to the delivery worker over a
//! bounded channel, so a slow store eventually pushes back on the queue.
//!
//! # Shutdown
//!
//! When the cancellation token fires the batcher stops waiting on timers,
//! drains whatever is left in the queue into full-size batches (plus one final
//! partial batch) and drops its sender, which tells the worker no more batches
//! are coming.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::queue::RecordQueue;
use crate::record::LogRecord;

/// An ordered group of records shipped in one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: u64,
    records: Vec<LogRecord>,
}

impl Batch {
    #[must_use]
    pub fn new(id: u64, records: Vec<LogRecord>) -> Self {
        Batch { id, records }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Message of the first record, for diagnostics about lost batches.
    pub fn sample(&self) -> Option<&str> {
        self.records.first().map(LogRecord::message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SealReason {
    Size,
    Age,
    Shutdown,
}

pub struct Batcher {
    queue: Arc<RecordQueue>,
    tx: Sender<Batch>,
    max_batch_size: usize,
    max_batch_age: Duration,
    cancel_token: CancellationToken,
    next_id: u64,
}

impl Batcher {
    #[must_use]
    pub fn new(
        queue: Arc<RecordQueue>,
        tx: Sender<Batch>,
        max_batch_size: usize,
        max_batch_age: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Batcher {
            queue,
            tx,
            max_batch_size: max_batch_size.max(1),
            max_batch_age,
            cancel_token,
            next_id: 0,
        }
    }

    /// Runs until cancelled (then flushes) or until the worker goes away.
    pub async fn run(mut self) {
        debug!(
            "BATCHER | Started (max_batch_size={}, max_batch_age={:?})",
            self.max_batch_size, self.max_batch_age
        );

        let mut current: Vec<LogRecord> = Vec::with_capacity(self.max_batch_size);
        let mut opened_at: Option<Instant> = None;

        loop {
            self.fill(&mut current, &mut opened_at);

            if current.len() >= self.max_batch_size {
                if !self.seal(&mut current, &mut opened_at, SealReason::Size).await {
                    return;
                }
                continue;
            }

            let deadline = opened_at.map(|opened| opened + self.max_batch_age);

            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                () = wait_until(deadline) => {
                    if !self.seal(&mut current, &mut opened_at, SealReason::Age).await {
                        return;
                    }
                }
                () = self.queue.notified() => {}
            }
        }

        debug!("BATCHER | Received shutdown signal, flushing remaining records");
        loop {
            self.fill(&mut current, &mut opened_at);
            if current.is_empty() {
                break;
            }
            if !self
                .seal(&mut current, &mut opened_at, SealReason::Shutdown)
                .await
            {
                return;
            }
        }
        debug!("BATCHER | Stopped");
    }

    fn fill(&self, current: &mut Vec<LogRecord>, opened_at: &mut Option<Instant>) {
        let room = self.max_batch_size.saturating_sub(current.len());
        if room == 0 {
            return;
        }
        let drained = self.queue.drain(room);
        if drained.is_empty() {
            return;
        }
        if opened_at.is_none() {
            *opened_at = Some(Instant::now());
        }
        current.extend(drained);
    }

    /// Hands the in-progress batch to the worker. Returns `false` once the
    /// worker is gone and batching can no longer make progress.
    async fn seal(
        &mut self,
        current: &mut Vec<LogRecord>,
        opened_at: &mut Option<Instant>,
        reason: SealReason,
    ) -> bool {
        *opened_at = None;
        if current.is_empty() {
            return true;
        }

        let records = std::mem::replace(current, Vec::with_capacity(self.max_batch_size));
        self.next_id += 1;
        let batch = Batch::new(self.next_id, records);
        debug!(
            "BATCHER | Sealed batch {} with {} records ({:?})",
            batch.id(),
            batch.len(),
            reason
        );

        if let Err(e) = self.tx.send(batch).await {
            error!(
                "BATCHER | Delivery worker stopped, batch {} with {} records was not handed over",
                e.0.id(),
                e.0.len()
            );
            return false;
        }
        true
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
