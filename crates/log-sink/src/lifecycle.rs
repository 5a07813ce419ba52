// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup and shutdown of the delivery pipeline.
//!
//! [`LogSink::start`] waits for the store, bootstraps the data stream and
//! spawns the batcher and worker tasks. [`LogSink::shutdown`] closes the
//! queue, lets the batcher flush everything and gives the worker
//! `shutdown_timeout` to finish before abandoning what is left.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{Batch, Batcher};
use crate::config::{BootstrapPolicy, SinkConfig};
use crate::error::{DeliveryError, EnqueueError, SinkError, SubmitError};
use crate::queue::RecordQueue;
use crate::record::{LogRecord, RawSubmission};
use crate::retry::RetryController;
use crate::stats::{SinkStats, StatsSnapshot};
use crate::store::{BulkStore, ElasticsearchStore};
use crate::worker::DeliveryWorker;

/// Producer side of the sink. Cheap to clone and safe to share between
/// request handlers.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    queue: Arc<RecordQueue>,
    stats: Arc<SinkStats>,
    environment: Arc<str>,
}

impl SinkHandle {
    /// Validates, normalizes and enqueues a submission. Never waits.
    pub fn submit(&self, raw: RawSubmission) -> Result<(), SubmitError> {
        let record = LogRecord::from_submission(raw, &self.environment, Utc::now())?;
        self.enqueue(record)?;
        Ok(())
    }

    /// Echoes the record to the process log and hands it to the queue.
    pub fn enqueue(&self, record: LogRecord) -> Result<(), EnqueueError> {
        let echo = record.clone();
        match self.queue.enqueue(record) {
            Ok(()) => {
                self.stats.record_enqueued();
                echo.emit();
                Ok(())
            }
            Err(e) => {
                self.stats.record_rejected();
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

pub struct LogSink {
    handle: SinkHandle,
    queue: Arc<RecordQueue>,
    worker: Arc<DeliveryWorker>,
    stats: Arc<SinkStats>,
    graceful: CancellationToken,
    hard_stop: CancellationToken,
    batcher_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl LogSink {
    /// Starts a sink writing to the Elasticsearch nodes named in `config`.
    pub async fn connect(config: SinkConfig) -> Result<Self, SinkError> {
        config.validate()?;
        let store = ElasticsearchStore::from_config(&config)?;
        Self::start(config, Arc::new(store)).await
    }

    pub async fn start(config: SinkConfig, store: Arc<dyn BulkStore>) -> Result<Self, SinkError> {
        config.validate()?;

        wait_for_store(
            store.as_ref(),
            config.startup_wait_timeout,
            config.startup_poll_interval,
        )
        .await?;

        match store.bootstrap(&config.stream).await {
            Ok(()) => info!("LIFECYCLE | Data stream {} is ready", config.stream),
            Err(e) => match config.bootstrap_policy {
                BootstrapPolicy::Fail => {
                    error!(
                        "LIFECYCLE | Failed to bootstrap data stream {}: {e}",
                        config.stream
                    );
                    return Err(SinkError::Bootstrap {
                        stream: config.stream.to_string(),
                        source: e,
                    });
                }
                BootstrapPolicy::Continue => warn!(
                    "LIFECYCLE | Failed to bootstrap data stream {}: {e}. Continuing",
                    config.stream
                ),
            },
        }

        let queue = Arc::new(RecordQueue::new(config.queue_capacity));
        let stats = Arc::new(SinkStats::default());
        let graceful = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Batch>(config.max_in_flight);

        let batcher = Batcher::new(
            Arc::clone(&queue),
            tx,
            config.max_batch_size,
            config.max_batch_age,
            graceful.clone(),
        );
        let worker = Arc::new(DeliveryWorker::new(
            store,
            config.stream.clone(),
            RetryController::new(config.retry_policy()),
            Arc::clone(&stats),
            config.max_in_flight,
            config.max_pending_batches,
            hard_stop.clone(),
        ));

        let batcher_task = tokio::spawn(batcher.run());
        let worker_task = tokio::spawn(Arc::clone(&worker).run(rx));

        info!(
            "LIFECYCLE | Log sink started (stream={}, queue_capacity={}, max_batch_size={})",
            config.stream, config.queue_capacity, config.max_batch_size
        );

        Ok(LogSink {
            handle: SinkHandle {
                queue: Arc::clone(&queue),
                stats: Arc::clone(&stats),
                environment: Arc::from(config.environment.as_str()),
            },
            queue,
            worker,
            stats,
            graceful,
            hard_stop,
            batcher_task,
            worker_task,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stops intake and flushes everything buffered. Records still undelivered
    /// after `shutdown_timeout` are abandoned and reported.
    pub async fn shutdown(self) -> Result<(), SinkError> {
        let LogSink {
            queue,
            worker,
            stats,
            graceful,
            hard_stop,
            mut batcher_task,
            mut worker_task,
            shutdown_timeout,
            ..
        } = self;

        info!(
            "LIFECYCLE | Shutting down, flushing {} queued records (timeout {:?})",
            queue.len(),
            shutdown_timeout
        );
        queue.close();
        graceful.cancel();

        let drained = timeout(shutdown_timeout, async {
            log_task_result("batcher", (&mut batcher_task).await);
            log_task_result("worker", (&mut worker_task).await);
        })
        .await;

        if drained.is_ok() {
            info!(
                "LIFECYCLE | Shutdown complete: {}",
                describe(&stats.snapshot())
            );
            return Ok(());
        }

        hard_stop.cancel();
        log_task_result("worker", (&mut worker_task).await);
        batcher_task.abort();
        if let Err(e) = batcher_task.await {
            if !e.is_cancelled() {
                error!("LIFECYCLE | batcher task failed: {e}");
            }
        }

        let snapshot = stats.snapshot();
        let abandoned = usize::try_from(snapshot.outstanding()).unwrap_or(usize::MAX);
        let sample = worker.abandoned_sample().or_else(|| queue.peek_message());
        error!(
            "LIFECYCLE | Shutdown timed out after {:?}, abandoning {} records (sample: {:?}): {}",
            shutdown_timeout,
            abandoned,
            sample,
            describe(&snapshot)
        );
        Err(SinkError::ShutdownIncomplete { abandoned, sample })
    }
}

/// Polls `ping` until the store answers or `wait` has elapsed.
pub async fn wait_for_store(
    store: &dyn BulkStore,
    wait: Duration,
    poll_interval: Duration,
) -> Result<(), SinkError> {
    let started = Instant::now();
    let deadline = started.checked_add(wait).ok_or_else(|| {
        SinkError::InvalidConfig(format!("startup wait of {wait:?} is out of range"))
    })?;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match timeout(remaining, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(format!(
                "no answer within {remaining:?}"
            ))),
        };

        match result {
            Ok(()) => {
                info!("LIFECYCLE | Store reachable after {attempts} attempts");
                return Ok(());
            }
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    error!(
                        "LIFECYCLE | Store unreachable after {:?} ({attempts} attempts): {e}",
                        started.elapsed()
                    );
                    return Err(SinkError::StartupUnreachable {
                        waited: started.elapsed(),
                        last_error: e,
                    });
                }
                debug!("LIFECYCLE | Waiting for store (attempt {attempts}): {e}");
                sleep(poll_interval.min(deadline - now)).await;
            }
        }
    }
}

fn log_task_result(task: &str, result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("LIFECYCLE | {task} task failed: {e}");
    }
}

fn describe(snapshot: &StatsSnapshot) -> String {
    format!(
        "enqueued={} rejected={} delivered={} retried={} dropped={}",
        snapshot.enqueued,
        snapshot.rejected,
        snapshot.delivered,
        snapshot.retried,
        snapshot.dropped
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataStreamName;
    use crate::error::ValidationError;
    use crate::store::ItemStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Unreachable for the first `down_pings` pings, then accepts everything.
    struct FlakyStore {
        down_pings: usize,
        pings: AtomicUsize,
        bootstrap: Mutex<Option<DeliveryError>>,
        written: AtomicUsize,
    }

    impl FlakyStore {
        fn new(down_pings: usize) -> Self {
            FlakyStore {
                down_pings,
                pings: AtomicUsize::new(0),
                bootstrap: Mutex::new(None),
                written: AtomicUsize::new(0),
            }
        }

        fn failing_bootstrap(self, error: DeliveryError) -> Self {
            *self.bootstrap.lock().unwrap() = Some(error);
            self
        }
    }

    #[async_trait]
    impl BulkStore for FlakyStore {
        async fn ping(&self) -> Result<(), DeliveryError> {
            let ping = self.pings.fetch_add(1, Ordering::SeqCst);
            if ping < self.down_pings {
                Err(DeliveryError::Connection("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn bootstrap(&self, _stream: &DataStreamName) -> Result<(), DeliveryError> {
            match self.bootstrap.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn bulk_write(
            &self,
            _stream: &DataStreamName,
            records: &[LogRecord],
        ) -> Result<Vec<ItemStatus>, DeliveryError> {
            self.written.fetch_add(records.len(), Ordering::SeqCst);
            Ok(vec![ItemStatus::Accepted; records.len()])
        }
    }

    fn config() -> SinkConfig {
        SinkConfig {
            startup_wait_timeout: Duration::from_secs(10),
            startup_poll_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn raw(application: Option<&str>, level: &str, message: &str) -> RawSubmission {
        RawSubmission {
            application: application.map(str::to_string),
            level: Some(level.to_string()),
            message: Some(message.to_string()),
            additional_data: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_waits_for_store() {
        let store = Arc::new(FlakyStore::new(3));
        let started = Instant::now();

        let sink = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>)
            .await
            .unwrap();

        assert_eq!(store.pings.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
        sink.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_unreachable_is_fatal() {
        let store = Arc::new(FlakyStore::new(usize::MAX));

        let result = LogSink::start(config(), store).await;
        let Err(SinkError::StartupUnreachable { waited, last_error }) = result else {
            panic!("expected StartupUnreachable");
        };
        assert!(waited >= Duration::from_secs(10));
        assert!(matches!(last_error, DeliveryError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_wait_out_of_range_is_rejected() {
        let store = FlakyStore::new(usize::MAX);

        let result =
            wait_for_store(&store, Duration::from_secs(u64::MAX), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SinkError::InvalidConfig(_))));
        assert_eq!(store.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_failure_policy() {
        let store = Arc::new(
            FlakyStore::new(0).failing_bootstrap(DeliveryError::Unauthorized { status: 403 }),
        );
        let result = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>).await;
        assert!(matches!(result, Err(SinkError::Bootstrap { .. })));

        let continue_config = SinkConfig {
            bootstrap_policy: BootstrapPolicy::Continue,
            ..config()
        };
        let sink = LogSink::start(continue_config, store).await.unwrap();
        sink.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(FlakyStore::new(0));
        let config = SinkConfig {
            max_batch_size: 0,
            ..config()
        };
        assert!(matches!(
            LogSink::start(config, store).await,
            Err(SinkError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_validates_and_counts() {
        let store = Arc::new(FlakyStore::new(0));
        let sink = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>)
            .await
            .unwrap();
        let handle = sink.handle();

        assert!(handle.submit(raw(Some("billing"), "Error", "boom")).is_ok());
        assert_eq!(
            handle.submit(raw(None, "Error", "orphan")),
            Err(SubmitError::Validation(ValidationError::MissingField(
                "application"
            )))
        );
        assert_eq!(handle.stats().enqueued, 1);

        sink.shutdown().await.unwrap();
        assert_eq!(store.written.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.submit(raw(Some("billing"), "Error", "late")),
            Err(SubmitError::Rejected(EnqueueError::Closed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_fails_fast_when_queue_full() {
        let store = Arc::new(FlakyStore::new(0));
        let config = SinkConfig {
            queue_capacity: 2,
            ..config()
        };
        let sink = LogSink::start(config, store).await.unwrap();
        let handle = sink.handle();

        // The batcher task has not run yet, so nothing leaves the queue
        assert!(handle.submit(raw(Some("api"), "Information", "1")).is_ok());
        assert!(handle.submit(raw(Some("api"), "Information", "2")).is_ok());
        assert_eq!(
            handle.submit(raw(Some("api"), "Information", "3")),
            Err(SubmitError::Rejected(EnqueueError::QueueFull { capacity: 2 }))
        );
        assert_eq!(handle.stats().rejected, 1);

        sink.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_rejected_records_are_not_echoed() {
        let store = Arc::new(FlakyStore::new(0));
        let config = SinkConfig {
            queue_capacity: 1,
            ..config()
        };
        let sink = LogSink::start(config, store).await.unwrap();
        let handle = sink.handle();

        assert!(handle.submit(raw(Some("api"), "Warning", "kept-record")).is_ok());
        assert!(handle.submit(raw(Some("api"), "Warning", "overflow-record")).is_err());
        sink.shutdown().await.unwrap();
        assert!(handle.submit(raw(Some("api"), "Warning", "late-record")).is_err());

        assert!(logs_contain("kept-record"));
        assert!(!logs_contain("overflow-record"));
        assert!(!logs_contain("late-record"));
    }
}
