// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Record counters shared by the intake path and the delivery pipeline.
#[derive(Debug, Default)]
pub struct SinkStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub in_flight: u64,
}

impl StatsSnapshot {
    /// Records accepted by the queue that have not reached a terminal outcome.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.delivered)
            .saturating_sub(self.dropped)
    }
}

impl SinkStats {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, records: usize) {
        self.delivered.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_retried(&self, records: usize) {
        self.retried.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, records: usize) {
        self.dropped.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn request_started(&self, records: usize) {
        self.in_flight.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn request_finished(&self, records: usize) {
        // Never underflows: every finish pairs with a start of the same size
        self.in_flight.fetch_sub(records as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
