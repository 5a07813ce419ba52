// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::constants;
use crate::error::SinkError;
use crate::retry::RetryPolicy;

/// What to do when the destination data stream cannot be created at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPolicy {
    /// Abort startup.
    #[default]
    Fail,
    /// Log the failure and start anyway.
    Continue,
}

impl FromStr for BootstrapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" | "failure" => Ok(BootstrapPolicy::Fail),
            "continue" | "silent" => Ok(BootstrapPolicy::Continue),
            _ => Err(format!(
                "Invalid bootstrap policy '{s}'. Must be one of: fail, continue"
            )),
        }
    }
}

/// Destination data stream, `{type}-{dataset}-{namespace}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStreamName {
    kind: String,
    dataset: String,
    namespace: String,
}

impl DataStreamName {
    pub fn new(
        kind: impl Into<String>,
        dataset: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, SinkError> {
        let name = DataStreamName {
            kind: kind.into(),
            dataset: dataset.into(),
            namespace: namespace.into(),
        };
        for (field, value) in [
            ("type", &name.kind),
            ("dataset", &name.dataset),
            ("namespace", &name.namespace),
        ] {
            validate_stream_part(field, value)?;
        }
        Ok(name)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the index template owning this stream, `{type}-{dataset}`.
    #[must_use]
    pub fn template_name(&self) -> String {
        format!("{}-{}", self.kind, self.dataset)
    }

    /// Index pattern matched by the template, `{type}-{dataset}-*`.
    #[must_use]
    pub fn index_pattern(&self) -> String {
        format!("{}-{}-*", self.kind, self.dataset)
    }
}

impl Default for DataStreamName {
    fn default() -> Self {
        DataStreamName {
            kind: constants::DEFAULT_STREAM_TYPE.to_string(),
            dataset: constants::DEFAULT_STREAM_DATASET.to_string(),
            namespace: constants::DEFAULT_STREAM_NAMESPACE.to_string(),
        }
    }
}

impl fmt::Display for DataStreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.dataset, self.namespace)
    }
}

// Elasticsearch index names: lowercase, no whitespace, none of \ / * ? " < > | , # :
fn validate_stream_part(field: &str, value: &str) -> Result<(), SinkError> {
    if value.is_empty() {
        return Err(SinkError::InvalidConfig(format!(
            "data stream {field} cannot be empty"
        )));
    }
    if let Some(invalid) = value.chars().find(|c| {
        c.is_whitespace()
            || c.is_uppercase()
            || matches!(c, '\\' | '/' | '*' | '?' | '"' | '<' | '>' | '|' | ',' | '#' | ':')
    }) {
        return Err(SinkError::InvalidConfig(format!(
            "data stream {field} '{value}' contains invalid character '{invalid}'"
        )));
    }
    if value.starts_with(['-', '_', '+', '.']) {
        return Err(SinkError::InvalidConfig(format!(
            "data stream {field} '{value}' cannot start with '{}'",
            &value[..1]
        )));
    }
    Ok(())
}

/// Configuration of the delivery sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Elasticsearch nodes, tried in order on connection failures.
    pub store_urls: Vec<String>,
    pub stream: DataStreamName,
    /// Environment name stamped on every record (e.g. Production, Staging)
    pub environment: String,
    pub queue_capacity: usize,
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]` of random spread applied to each backoff delay
    pub jitter: f64,
    pub max_in_flight: usize,
    pub max_pending_batches: usize,
    pub request_timeout: Duration,
    pub startup_wait_timeout: Duration,
    pub startup_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub bootstrap_policy: BootstrapPolicy,
    pub https_proxy: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            store_urls: vec![constants::DEFAULT_STORE_URL.to_string()],
            stream: DataStreamName::default(),
            environment: constants::DEFAULT_ENVIRONMENT.to_string(),
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            max_batch_size: constants::DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: constants::DEFAULT_MAX_BATCH_AGE,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            base_delay: constants::DEFAULT_BASE_DELAY,
            max_delay: constants::DEFAULT_MAX_DELAY,
            jitter: constants::DEFAULT_JITTER,
            max_in_flight: constants::DEFAULT_MAX_IN_FLIGHT,
            max_pending_batches: constants::DEFAULT_MAX_PENDING_BATCHES,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            startup_wait_timeout: constants::DEFAULT_STARTUP_WAIT_TIMEOUT,
            startup_poll_interval: constants::DEFAULT_STARTUP_POLL_INTERVAL,
            shutdown_timeout: constants::DEFAULT_SHUTDOWN_TIMEOUT,
            bootstrap_policy: BootstrapPolicy::default(),
            https_proxy: None,
        }
    }
}

impl SinkConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, SinkError> {
        let defaults = Self::default();

        let store_urls = env::var("ELASTICSEARCH_URL")
            .ok()
            .map(|urls| parse_urls(&urls))
            .filter(|urls| !urls.is_empty())
            .unwrap_or(defaults.store_urls);

        let stream = DataStreamName::new(
            env::var("LOG_SINK_STREAM_TYPE").unwrap_or_else(|_| defaults.stream.kind.clone()),
            env::var("LOG_SINK_STREAM_DATASET")
                .unwrap_or_else(|_| defaults.stream.dataset.clone()),
            env::var("LOG_SINK_STREAM_NAMESPACE")
                .unwrap_or_else(|_| defaults.stream.namespace.clone()),
        )?;

        let bootstrap_policy = match env::var("LOG_SINK_BOOTSTRAP") {
            Ok(val) => BootstrapPolicy::from_str(&val).map_err(SinkError::InvalidConfig)?,
            Err(_) => defaults.bootstrap_policy,
        };

        let config = Self {
            store_urls,
            stream,
            environment: env::var("LOG_SINK_ENVIRONMENT").unwrap_or(defaults.environment),
            queue_capacity: env_or("LOG_SINK_QUEUE_CAPACITY", defaults.queue_capacity),
            max_batch_size: env_or("LOG_SINK_MAX_BATCH_SIZE", defaults.max_batch_size),
            max_batch_age: env_millis_or("LOG_SINK_MAX_BATCH_AGE_MS", defaults.max_batch_age),
            max_retries: env_or("LOG_SINK_MAX_RETRIES", defaults.max_retries),
            base_delay: env_millis_or("LOG_SINK_BASE_DELAY_MS", defaults.base_delay),
            max_delay: env_millis_or("LOG_SINK_MAX_DELAY_MS", defaults.max_delay),
            jitter: env_or("LOG_SINK_JITTER", defaults.jitter),
            max_in_flight: env_or("LOG_SINK_MAX_IN_FLIGHT", defaults.max_in_flight),
            max_pending_batches: env_or(
                "LOG_SINK_MAX_PENDING_BATCHES",
                defaults.max_pending_batches,
            ),
            request_timeout: env_secs_or(
                "LOG_SINK_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            ),
            startup_wait_timeout: env_secs_or(
                "LOG_SINK_STARTUP_TIMEOUT_SECS",
                defaults.startup_wait_timeout,
            ),
            startup_poll_interval: env_millis_or(
                "LOG_SINK_STARTUP_POLL_MS",
                defaults.startup_poll_interval,
            ),
            shutdown_timeout: env_secs_or(
                "LOG_SINK_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            ),
            bootstrap_policy,
            https_proxy: env::var("LOG_SINK_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.store_urls.is_empty() {
            return Err(SinkError::InvalidConfig(
                "at least one Elasticsearch URL is required".to_string(),
            ));
        }
        if let Some(url) = self
            .store_urls
            .iter()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(SinkError::InvalidConfig(format!(
                "Elasticsearch URL '{url}' must start with http:// or https://"
            )));
        }
        if self.environment.trim().is_empty() {
            return Err(SinkError::InvalidConfig(
                "environment cannot be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("queue_capacity", self.queue_capacity),
            ("max_batch_size", self.max_batch_size),
            ("max_in_flight", self.max_in_flight),
            ("max_pending_batches", self.max_pending_batches),
        ] {
            if value == 0 {
                return Err(SinkError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.max_pending_batches < self.max_in_flight {
            return Err(SinkError::InvalidConfig(
                "max_pending_batches must be at least max_in_flight".to_string(),
            ));
        }

        for (name, value) in [
            ("max_batch_age", self.max_batch_age),
            ("base_delay", self.base_delay),
            ("request_timeout", self.request_timeout),
            ("startup_poll_interval", self.startup_poll_interval),
        ] {
            if value.is_zero() {
                return Err(SinkError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        for (name, value) in [
            ("max_batch_age", self.max_batch_age),
            ("base_delay", self.base_delay),
            ("max_delay", self.max_delay),
            ("request_timeout", self.request_timeout),
            ("startup_wait_timeout", self.startup_wait_timeout),
            ("startup_poll_interval", self.startup_poll_interval),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value > constants::MAX_CONFIG_DURATION {
                return Err(SinkError::InvalidConfig(format!(
                    "{name} cannot exceed {:?}, got {value:?}",
                    constants::MAX_CONFIG_DURATION
                )));
            }
        }
        if self.max_delay < self.base_delay {
            return Err(SinkError::InvalidConfig(
                "max_delay must be at least base_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SinkError::InvalidConfig(format!(
                "jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

fn parse_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|url| url.trim().trim_end_matches('/'))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(val) => val.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("CONFIG | Ignoring invalid value '{val}' for {name}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .map(|_| Duration::from_millis(env_or(name, millis(default))))
        .unwrap_or(default)
}

fn env_secs_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .map(|_| Duration::from_secs(env_or(name, default.as_secs())))
        .unwrap_or(default)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
