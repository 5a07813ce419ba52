// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backing store abstraction and its Elasticsearch implementation.
//!
//! The delivery core only sees [`BulkStore`]; [`ElasticsearchStore`] speaks
//! the REST API:
//!
//! - `GET /` for reachability,
//! - `PUT /_index_template/{type}-{dataset}` and `PUT /_data_stream/{name}`
//!   to bootstrap the destination,
//! - `POST /{name}/_bulk` with one `create` action per record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{DataStreamName, SinkConfig};
use crate::error::{is_retryable_status, DeliveryError, SinkError};
use crate::http::get_client;
use crate::record::LogRecord;

/// Outcome of one document inside a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Accepted,
    /// Rejected with 429 or 5xx; the same document may succeed later.
    Retryable { status: u16, reason: String },
    /// Rejected for good (mapping conflicts and other 4xx).
    Rejected { status: u16, reason: String },
}

impl ItemStatus {
    #[must_use]
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        if (200..300).contains(&status) {
            ItemStatus::Accepted
        } else if is_retryable_status(status) {
            ItemStatus::Retryable {
                status,
                reason: reason.into(),
            }
        } else {
            ItemStatus::Rejected {
                status,
                reason: reason.into(),
            }
        }
    }
}

#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Succeeds once the store answers requests.
    async fn ping(&self) -> Result<(), DeliveryError>;

    /// Creates the index template and data stream. Existing ones are kept.
    async fn bootstrap(&self, stream: &DataStreamName) -> Result<(), DeliveryError>;

    /// Writes `records` in one request. On success the result holds one
    /// status per document, in request order.
    async fn bulk_write(
        &self,
        stream: &DataStreamName,
        records: &[LogRecord],
    ) -> Result<Vec<ItemStatus>, DeliveryError>;
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

impl BulkItem {
    fn into_status(self) -> ItemStatus {
        let reason = match self.error {
            Some(BulkItemError {
                kind,
                reason: Some(reason),
            }) => format!("{kind}: {reason}"),
            Some(BulkItemError { kind, reason: None }) => kind,
            None => String::new(),
        };
        ItemStatus::from_status(self.status, reason)
    }
}

/// [`BulkStore`] backed by one or more Elasticsearch nodes.
///
/// Requests go to the current node. A transport failure moves the cursor to
/// the next node so the following request tries another one.
#[derive(Debug)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    nodes: Vec<String>,
    current: AtomicUsize,
}

impl ElasticsearchStore {
    pub fn new(client: reqwest::Client, nodes: Vec<String>) -> Result<Self, SinkError> {
        if nodes.is_empty() {
            return Err(SinkError::InvalidConfig(
                "at least one Elasticsearch URL is required".to_string(),
            ));
        }
        let nodes = nodes
            .into_iter()
            .map(|node| node.trim_end_matches('/').to_string())
            .collect();
        Ok(ElasticsearchStore {
            client,
            nodes,
            current: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &SinkConfig) -> Result<Self, SinkError> {
        let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
        Self::new(client, config.store_urls.clone())
    }

    /// Node the next request goes to.
    pub fn current_node(&self) -> &str {
        let index = self.current.load(Ordering::Relaxed) % self.nodes.len();
        &self.nodes[index]
    }

    async fn send(
        &self,
        build: impl FnOnce(&reqwest::Client, &str) -> RequestBuilder,
    ) -> Result<Response, DeliveryError> {
        let cursor = self.current.load(Ordering::Relaxed);
        let node = &self.nodes[cursor % self.nodes.len()];

        match build(&self.client, node).send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                let error = if e.is_timeout() {
                    DeliveryError::Timeout(e.to_string())
                } else {
                    DeliveryError::Connection(e.to_string())
                };
                if self.nodes.len() > 1
                    && self
                        .current
                        .compare_exchange(
                            cursor,
                            cursor.wrapping_add(1),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    warn!(
                        "DELIVERY | Request to {node} failed ({error}), switching to {}",
                        self.current_node()
                    );
                }
                Err(error)
            }
        }
    }
}

async fn error_for_response(response: Response) -> DeliveryError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, body)
}

fn classify_status(status: StatusCode, body: String) -> DeliveryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::Unauthorized {
            status: status.as_u16(),
        },
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            DeliveryError::Malformed(format!("{}: {body}", status.as_u16()))
        }
        _ => DeliveryError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

/// NDJSON body with a `create` action before each document.
pub fn bulk_body(records: &[LogRecord]) -> Result<String, DeliveryError> {
    let mut body = String::with_capacity(records.len() * 256);
    for record in records {
        let document = serde_json::to_string(&record.to_document())
            .map_err(|e| DeliveryError::Malformed(e.to_string()))?;
        body.push_str("{\"create\":{}}\n");
        body.push_str(&document);
        body.push('\n');
    }
    Ok(body)
}

fn index_template(stream: &DataStreamName) -> serde_json::Value {
    json!({
        "index_patterns": [stream.index_pattern()],
        "data_stream": {},
        "priority": 200,
        "template": {
            "mappings": {
                "properties": {
                    "@timestamp": { "type": "date" },
                    "message": { "type": "text" },
                    "log": { "properties": { "level": { "type": "keyword" } } },
                    "service": {
                        "properties": {
                            "name": { "type": "keyword" },
                            "environment": { "type": "keyword" }
                        }
                    },
                    "labels": { "type": "flattened" }
                }
            }
        }
    })
}

#[async_trait]
impl BulkStore for ElasticsearchStore {
    async fn ping(&self) -> Result<(), DeliveryError> {
        let response = self
            .send(|client, node| client.get(format!("{node}/")))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_for_response(response).await)
        }
    }

    async fn bootstrap(&self, stream: &DataStreamName) -> Result<(), DeliveryError> {
        let template = index_template(stream);
        let response = self
            .send(|client, node| {
                client
                    .put(format!("{node}/_index_template/{}", stream.template_name()))
                    .json(&template)
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        debug!(
            "LIFECYCLE | Index template {} is in place",
            stream.template_name()
        );

        let response = self
            .send(|client, node| client.put(format!("{node}/_data_stream/{stream}")))
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!("LIFECYCLE | Created data stream {stream}");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception")
        {
            debug!("LIFECYCLE | Data stream {stream} already exists");
            return Ok(());
        }
        Err(classify_status(status, body))
    }

    async fn bulk_write(
        &self,
        stream: &DataStreamName,
        records: &[LogRecord],
    ) -> Result<Vec<ItemStatus>, DeliveryError> {
        let body = bulk_body(records)?;
        let response = self
            .send(|client, node| {
                client
                    .post(format!("{node}/{stream}/_bulk"))
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(body)
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DeliveryError::Connection(e.to_string()))?;
        let parsed: BulkResponse = serde_json::from_slice(&bytes)
            .map_err(|e| DeliveryError::InvalidResponse(e.to_string()))?;

        if !parsed.errors {
            debug!(
                "DELIVERY | Bulk request to {stream} accepted {} documents",
                parsed.items.len()
            );
        }

        parsed
            .items
            .into_iter()
            .map(|item| {
                item.into_values().next().map(BulkItem::into_status).ok_or_else(|| {
                    DeliveryError::InvalidResponse("bulk item without action".to_string())
                })
            })
            .collect()
    }
}
