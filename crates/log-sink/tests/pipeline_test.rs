// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use log_sink::config::DataStreamName;
use log_sink::error::{DeliveryError, SinkError};
use log_sink::store::{BulkStore, ItemStatus};
use log_sink::{LogRecord, LogSink, RawSubmission, SinkConfig};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Step {
    Respond(Result<Vec<ItemStatus>, DeliveryError>),
    /// Never answers
    Hang,
}

/// In-memory store replaying a script of bulk responses. Once the script is
/// exhausted every document is accepted.
#[derive(Default)]
struct ScriptedStore {
    reachable: bool,
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Vec<LogRecord>>>,
}

impl ScriptedStore {
    fn reachable(script: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedStore {
            reachable: true,
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(ScriptedStore::default())
    }

    fn requests(&self) -> Vec<Vec<LogRecord>> {
        self.requests.lock().unwrap().clone()
    }

    fn delivered_messages(&self) -> Vec<String> {
        self.requests()
            .iter()
            .flatten()
            .map(|record| record.message().to_string())
            .collect()
    }
}

#[async_trait]
impl BulkStore for ScriptedStore {
    async fn ping(&self) -> Result<(), DeliveryError> {
        if self.reachable {
            Ok(())
        } else {
            Err(DeliveryError::Connection(
                "tcp connect error: Connection refused".to_string(),
            ))
        }
    }

    async fn bootstrap(&self, _stream: &DataStreamName) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn bulk_write(
        &self,
        _stream: &DataStreamName,
        records: &[LogRecord],
    ) -> Result<Vec<ItemStatus>, DeliveryError> {
        self.requests.lock().unwrap().push(records.to_vec());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Respond(response)) => response,
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(vec![ItemStatus::Accepted; records.len()]),
        }
    }
}

fn config() -> SinkConfig {
    SinkConfig {
        environment: "Staging".to_string(),
        max_batch_size: 10,
        max_batch_age: Duration::from_secs(2),
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        startup_wait_timeout: Duration::from_secs(5),
        startup_poll_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

fn submission(message: &str) -> RawSubmission {
    RawSubmission {
        application: Some("orders-api".to_string()),
        level: Some("WARNING".to_string()),
        message: Some(message.to_string()),
        additional_data: Some(json!({"request": {"id": "abc", "retries": 2}})),
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_delivers_queued_records() {
    let store = ScriptedStore::reachable(vec![]);
    let sink = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>)
        .await
        .unwrap();
    let handle = sink.handle();

    for i in 0..5 {
        handle.submit(submission(&format!("order {i}"))).unwrap();
    }
    assert_eq!(handle.queued(), 5);

    sink.shutdown().await.unwrap();

    assert_eq!(
        store.delivered_messages(),
        vec!["order 0", "order 1", "order 2", "order 3", "order 4"]
    );
    assert_eq!(handle.queued(), 0);
    let stats = handle.stats();
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.outstanding(), 0);

    let first = &store.requests()[0][0];
    assert_eq!(first.environment(), "Staging");
    assert_eq!(first.application(), "orders-api");
    assert_eq!(first.level().as_ref(), "Warning");
    assert_eq!(
        first.attributes().get("request.id").map(String::as_str),
        Some("abc")
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_fails_startup() {
    let store = ScriptedStore::unreachable();

    let Err(error) = LogSink::start(config(), store).await else {
        panic!("startup should fail");
    };
    match error {
        SinkError::StartupUnreachable { waited, last_error } => {
            assert!(waited >= Duration::from_secs(5));
            assert!(matches!(last_error, DeliveryError::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_is_sent_without_waiting_for_age() {
    let store = ScriptedStore::reachable(vec![]);
    let sink = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>)
        .await
        .unwrap();
    let handle = sink.handle();

    for i in 0..25 {
        handle.submit(submission(&i.to_string())).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sizes: Vec<usize> = store.requests().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10]);

    // The remaining five go out once the batch ages
    tokio::time::sleep(Duration::from_secs(2)).await;
    let sizes: Vec<usize> = store.requests().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10, 5]);

    sink.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partial_rejection_retries_only_rejected_documents() {
    let mut statuses = vec![ItemStatus::Accepted; 10];
    for status in &mut statuses[7..] {
        *status = ItemStatus::Retryable {
            status: 429,
            reason: "es_rejected_execution_exception: rejected execution".to_string(),
        };
    }
    let store = ScriptedStore::reachable(vec![Step::Respond(Ok(statuses))]);
    let sink = LogSink::start(config(), Arc::clone(&store) as Arc<dyn BulkStore>)
        .await
        .unwrap();
    let handle = sink.handle();

    for i in 0..10 {
        handle.submit(submission(&format!("m{i}"))).unwrap();
    }
    sink.shutdown().await.unwrap();

    let requests = store.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].len(), 10);
    let retried: Vec<&str> = requests[1].iter().map(LogRecord::message).collect();
    assert_eq!(retried, vec!["m7", "m8", "m9"]);

    let stats = handle.stats();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_dropped_after_max_retries() {
    let unavailable = || {
        Step::Respond(Err(DeliveryError::Status {
            status: 503,
            body: "cluster_block_exception".to_string(),
        }))
    };
    let store = ScriptedStore::reachable(vec![unavailable(), unavailable(), unavailable()]);
    let config = SinkConfig {
        max_retries: 2,
        ..config()
    };
    let sink = LogSink::start(config, Arc::clone(&store) as Arc<dyn BulkStore>)
        .await
        .unwrap();
    let handle = sink.handle();

    handle.submit(submission("doomed")).unwrap();
    sink.shutdown().await.unwrap();

    assert_eq!(store.requests().len(), 3);
    let stats = handle.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.retried, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_reports_abandoned_records() {
    let store = ScriptedStore::reachable(vec![Step::Hang]);
    let config = SinkConfig {
        shutdown_timeout: Duration::from_secs(3),
        ..config()
    };
    let sink = LogSink::start(config, Arc::clone(&store) as Arc<dyn BulkStore>)
        .await
        .unwrap();
    let handle = sink.handle();

    for message in ["stuck 1", "stuck 2", "stuck 3"] {
        handle.submit(submission(message)).unwrap();
    }

    match sink.shutdown().await {
        Err(SinkError::ShutdownIncomplete { abandoned, sample }) => {
            assert_eq!(abandoned, 3);
            assert_eq!(sample.as_deref(), Some("stuck 1"));
        }
        other => panic!("expected ShutdownIncomplete, got {other:?}"),
    }
}
