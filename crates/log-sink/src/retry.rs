// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-batch delivery state machine and exponential backoff.
//!
//! ```text
//! Pending -> InFlight -> Delivered
//!               |  \
//!               |   `-> Dropped            (fatal error)
//!               v
//!            Failed -> Retrying -> InFlight
//!               |
//!               `-> Dropped                (attempt_count > max_retries)
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::batcher::Batch;
use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    InFlight,
    Failed,
    Retrying,
    Dropped,
    Delivered,
}

impl AttemptState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Dropped | AttemptState::Delivered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of random spread, `delay * (1 ± jitter)`
    pub jitter: f64,
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^attempt_count)` without jitter.
    #[must_use]
    pub fn base_backoff(&self, attempt_count: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << attempt_count.min(31))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Jittered backoff, never above `max_delay`.
    pub fn backoff<R: Rng>(&self, attempt_count: u32, rng: &mut R) -> Duration {
        let delay = self.base_backoff(attempt_count);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

/// A batch moving through delivery, with its retry bookkeeping.
#[derive(Debug)]
pub struct DeliveryAttempt {
    batch: Batch,
    attempt_count: u32,
    next_retry_at: Option<Instant>,
    last_error: Option<DeliveryError>,
    state: AttemptState,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn new(batch: Batch) -> Self {
        DeliveryAttempt {
            batch,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            state: AttemptState::Pending,
        }
    }

    /// Attempt for the retryable remainder of a partially accepted batch.
    /// It carries the parent's attempt count and is in flight until the
    /// controller records the partial failure against it.
    #[must_use]
    pub fn split_from(parent: &DeliveryAttempt, batch: Batch) -> Self {
        DeliveryAttempt {
            batch,
            attempt_count: parent.attempt_count,
            next_retry_at: None,
            last_error: None,
            state: AttemptState::InFlight,
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Pending or Retrying -> InFlight.
    pub fn start(&mut self) {
        debug_assert!(
            matches!(self.state, AttemptState::Pending | AttemptState::Retrying),
            "cannot start attempt in state {:?}",
            self.state
        );
        self.state = AttemptState::InFlight;
        self.next_retry_at = None;
    }

    pub fn succeed(&mut self) {
        self.state = AttemptState::Delivered;
        self.next_retry_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Drop,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        RetryController { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a retryable failure and schedules the next try, or drops the
    /// attempt once it has used up its retries.
    pub fn on_failure(&self, attempt: &mut DeliveryAttempt, error: DeliveryError) -> RetryDecision {
        attempt.state = AttemptState::Failed;
        let previous = attempt.attempt_count;
        attempt.attempt_count = previous.saturating_add(1);
        attempt.last_error = Some(error);

        if attempt.attempt_count > self.policy.max_retries {
            attempt.state = AttemptState::Dropped;
            attempt.next_retry_at = None;
            return RetryDecision::Drop;
        }

        let delay = self.policy.backoff(previous, &mut rand::rng());
        attempt.next_retry_at = Some(Instant::now() + delay);
        attempt.state = AttemptState::Retrying;
        RetryDecision::Retry { delay }
    }

    /// Fatal errors drop the attempt without counting a retry.
    pub fn on_fatal(&self, attempt: &mut DeliveryAttempt, error: DeliveryError) {
        attempt.last_error = Some(error);
        attempt.next_retry_at = None;
        attempt.state = AttemptState::Dropped;
    }
}
