// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous delivery of structured log records to Elasticsearch.
//!
//! The crate is organized as a small pipeline:
//!
//! ```text
//!   submit(RawSubmission)
//!          │  validate + normalize
//!          v
//!   ┌──────────────┐
//!   │ RecordQueue  │  (bounded, fail-fast)
//!   └──────┬───────┘
//!          v
//!   ┌──────────────┐
//!   │   Batcher    │  (size / age triggers)
//!   └──────┬───────┘
//!          v
//!   ┌──────────────┐      ┌────────────────┐
//!   │ DeliveryWorker├────>│ RetryController│  (backoff + jitter)
//!   └──────┬───────┘      └────────────────┘
//!          v
//!   ┌──────────────┐
//!   │  BulkStore   │  (Elasticsearch _bulk)
//!   └──────────────┘
//! ```
//!
//! [`lifecycle::LogSink`] owns the whole pipeline: it waits for the store,
//! bootstraps the destination data stream, spawns the background tasks and
//! flushes everything on shutdown.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod queue;
pub mod record;
pub mod retry;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::{BootstrapPolicy, DataStreamName, SinkConfig};
pub use error::SinkError;
pub use lifecycle::{LogSink, SinkHandle};
pub use record::{LogLevel, LogRecord, RawSubmission};
