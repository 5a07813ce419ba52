// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, mutex-protected FIFO buffer between producers and the batcher.
//!
//! Producers call [`RecordQueue::enqueue`] from any task; the batcher waits on
//! [`RecordQueue::notified`] and pulls records with [`RecordQueue::drain`].
//!
//! # Backpressure
//!
//! The queue never evicts and never blocks. When `capacity` records are
//! buffered, `enqueue` returns [`EnqueueError::QueueFull`] and the caller
//! decides how to shed load (the HTTP layer answers 503).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::EnqueueError;
use crate::record::LogRecord;

#[derive(Debug, Default)]
struct QueueState {
    records: VecDeque<LogRecord>,
    closed: bool,
}

#[derive(Debug)]
pub struct RecordQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl RecordQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        RecordQueue {
            state: Mutex::new(QueueState {
                records: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    // Records are plain data, so a panic while holding the lock cannot leave
    // the deque half-updated.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record, failing immediately when the queue is full or closed.
    pub fn enqueue(&self, record: LogRecord) -> Result<(), EnqueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(EnqueueError::Closed);
            }
            if state.records.len() >= self.capacity {
                warn!(
                    "QUEUE | Record queue full ({} records), rejecting record",
                    self.capacity
                );
                return Err(EnqueueError::QueueFull {
                    capacity: self.capacity,
                });
            }
            state.records.push_back(record);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes up to `max_items` records in insertion order.
    pub fn drain(&self, max_items: usize) -> Vec<LogRecord> {
        let mut state = self.lock();
        let count = max_items.min(state.records.len());
        state.records.drain(..count).collect()
    }

    /// Stops accepting records. Buffered records stay drainable.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            debug!(
                "QUEUE | Closing record queue with {} buffered records",
                state.records.len()
            );
            state.closed = true;
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Resolves once a record was enqueued (or the queue closed) since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Message of the oldest buffered record, used in shutdown diagnostics.
    pub fn peek_message(&self) -> Option<String> {
        self.lock()
            .records
            .front()
            .map(|record| record.message().to_string())
    }
}
