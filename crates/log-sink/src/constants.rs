// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits and timings for the delivery sink.
//!
//! Every value here can be overridden through [`crate::config::SinkConfig`].

use std::time::Duration;

/// Default Elasticsearch endpoint when `ELASTICSEARCH_URL` is not set.
pub const DEFAULT_STORE_URL: &str = "http://elasticsearch:9200";

/// Default destination data stream, `logs-api-logs-prod`.
pub const DEFAULT_STREAM_TYPE: &str = "logs";
pub const DEFAULT_STREAM_DATASET: &str = "api-logs";
pub const DEFAULT_STREAM_NAMESPACE: &str = "prod";

/// Default environment stamped on every record.
pub const DEFAULT_ENVIRONMENT: &str = "Production";

/// Maximum number of records buffered before `enqueue` starts failing.
///
/// At roughly 1KB per record this bounds the queue to ~10MB.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Maximum number of records in one `_bulk` request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

/// Maximum time a partially filled batch waits before it is sealed.
pub const DEFAULT_MAX_BATCH_AGE: Duration = Duration::from_secs(2);

/// Retries after the first failed attempt before a batch is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Fraction of the computed backoff added or removed at random.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Concurrent `_bulk` requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Batches the worker owns at once, including those waiting for a retry.
pub const DEFAULT_MAX_PENDING_BATCHES: usize = 64;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for every configured duration.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
