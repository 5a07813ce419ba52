// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Rejection of a submission before it reaches the sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' must not be blank")]
    BlankField(&'static str),

    #[error("additionalData must be a JSON object or null, got {0}")]
    InvalidAdditionalData(&'static str),
}

/// Rejection returned by [`crate::queue::RecordQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("record queue is full ({capacity} records)")]
    QueueFull { capacity: usize },

    #[error("record queue is closed")]
    Closed,
}

/// Everything the upstream producer can get back from a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("submission rejected: {0}")]
    Rejected(#[from] EnqueueError),
}

/// Failure of a single request against the backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("store responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("store rejected {rejected} documents: {reason}")]
    PartialRejection { rejected: usize, reason: String },

    #[error("unexpected bulk response: {0}")]
    InvalidResponse(String),

    #[error("malformed batch: {0}")]
    Malformed(String),

    #[error("authentication rejected by store ({status})")]
    Unauthorized { status: u16 },

    #[error("mapping incompatible with destination: {0}")]
    Mapping(String),
}

impl DeliveryError {
    /// Whether sending the same documents again can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Timeout(_)
            | DeliveryError::Connection(_)
            | DeliveryError::PartialRejection { .. }
            | DeliveryError::InvalidResponse(_) => true,
            DeliveryError::Status { status, .. } => is_retryable_status(*status),
            DeliveryError::Malformed(_)
            | DeliveryError::Unauthorized { .. }
            | DeliveryError::Mapping(_) => false,
        }
    }
}

/// 429 and every 5xx are transient; other statuses will fail the same way again.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Errors surfaced by the sink lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store not reachable after {waited:?}: {last_error}")]
    StartupUnreachable {
        waited: Duration,
        last_error: DeliveryError,
    },

    #[error("failed to bootstrap data stream {stream}: {source}")]
    Bootstrap {
        stream: String,
        #[source]
        source: DeliveryError,
    },

    #[error("shutdown timed out with {abandoned} records not delivered")]
    ShutdownIncomplete {
        abandoned: usize,
        sample: Option<String>,
    },
}
