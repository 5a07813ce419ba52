// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records: the raw submission accepted from producers and the normalized,
//! immutable [`LogRecord`] that travels through the sink.
//!
//! # Normalization
//!
//! - **Level**: free text, matched case-insensitively against the closed
//!   [`LogLevel`] set. Anything unrecognized (or missing) becomes
//!   [`LogLevel::Information`].
//! - **Attributes**: `additionalData` must be a JSON object or `null` and is
//!   flattened into an ordered `String -> String` map:
//!   - nested object keys are joined with `.` (`{"a":{"b":1}}` → `a.b = "1"`)
//!   - array elements are keyed by index (`{"tags":["x"]}` → `tags.0 = "x"`)
//!   - strings are kept verbatim, numbers and booleans use their JSON text
//!   - `null` values are omitted
//!
//!   Keys are ordered lexicographically, so the same payload always produces the
//!   same attribute map.
//! - **Timestamp**: assigned by the server in UTC at submission time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::ValidationError;

/// Severity of a submitted log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug,
    /// Default for missing or unrecognized levels.
    #[default]
    Information,
    Warning,
    Error,
    Fatal,
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Case-insensitive parsing of the five level names plus the common short
/// aliases `info`, `warn` and `critical`.
impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "information" | "info" => Ok(LogLevel::Information),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "fatal" | "critical" => Ok(LogLevel::Fatal),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: debug, information, warning, error, fatal"
            )),
        }
    }
}

impl LogLevel {
    /// Parses a submitted level, falling back to [`LogLevel::Information`].
    #[must_use]
    pub fn parse_or_default(input: Option<&str>) -> Self {
        match input {
            Some(level) => LogLevel::from_str(level).unwrap_or_else(|e| {
                debug!("RECORD | {e}, using {}", LogLevel::default());
                LogLevel::default()
            }),
            None => LogLevel::default(),
        }
    }
}

/// A log submission as received from the HTTP layer.
///
/// Field names follow the public JSON contract (`application`, `level`,
/// `message`, `additionalData`); PascalCase spellings are accepted as well.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSubmission {
    #[serde(default, alias = "Application")]
    pub application: Option<String>,
    #[serde(default, alias = "Level")]
    pub level: Option<String>,
    #[serde(default, alias = "Message")]
    pub message: Option<String>,
    #[serde(default, rename = "additionalData", alias = "AdditionalData")]
    pub additional_data: Option<Value>,
}

/// A normalized, immutable log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    application: String,
    level: LogLevel,
    message: String,
    attributes: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    environment: String,
}

impl LogRecord {
    #[must_use]
    pub fn new(
        application: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        attributes: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
        environment: impl Into<String>,
    ) -> Self {
        LogRecord {
            application: application.into(),
            level,
            message: message.into(),
            attributes,
            timestamp,
            environment: environment.into(),
        }
    }

    /// Validates and normalizes a raw submission, stamping it with `now`.
    pub fn from_submission(
        raw: RawSubmission,
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let application = raw
            .application
            .ok_or(ValidationError::MissingField("application"))?;
        if application.trim().is_empty() {
            return Err(ValidationError::BlankField("application"));
        }
        let message = raw.message.ok_or(ValidationError::MissingField("message"))?;
        let level = LogLevel::parse_or_default(raw.level.as_deref());
        let attributes = flatten_additional_data(raw.additional_data)?;

        Ok(LogRecord {
            application,
            level,
            message,
            attributes,
            timestamp: now,
            environment: environment.to_string(),
        })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Writes the record to the process log on the channel matching its severity.
    pub fn emit(&self) {
        match self.level {
            LogLevel::Debug => debug!(
                application = %self.application,
                attributes = ?self.attributes,
                "{}",
                self.message
            ),
            LogLevel::Information => info!(
                application = %self.application,
                attributes = ?self.attributes,
                "{}",
                self.message
            ),
            LogLevel::Warning => warn!(
                application = %self.application,
                attributes = ?self.attributes,
                "{}",
                self.message
            ),
            LogLevel::Error | LogLevel::Fatal => error!(
                application = %self.application,
                level = %self.level,
                attributes = ?self.attributes,
                "{}",
                self.message
            ),
        }
    }

    /// The Elastic Common Schema document indexed for this record.
    #[must_use]
    pub fn to_document(&self) -> EcsDocument<'_> {
        EcsDocument {
            timestamp: self
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            log: EcsLog {
                level: self.level.as_ref(),
            },
            message: &self.message,
            service: EcsService {
                name: &self.application,
                environment: &self.environment,
            },
            labels: &self.attributes,
        }
    }
}

/// Serialized shape of a record inside the data stream.
#[derive(Debug, Serialize)]
pub struct EcsDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    log: EcsLog<'a>,
    message: &'a str,
    service: EcsService<'a>,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct EcsLog<'a> {
    level: &'a str,
}

#[derive(Debug, Serialize)]
struct EcsService<'a> {
    name: &'a str,
    environment: &'a str,
}

/// Flattens `additionalData` into string attributes (see module docs).
pub fn flatten_additional_data(
    data: Option<Value>,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut attributes = BTreeMap::new();
    match data {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (key, value) in map {
                flatten_into(&mut attributes, key, value);
            }
        }
        Some(other) => {
            return Err(ValidationError::InvalidAdditionalData(json_type_name(
                &other,
            )))
        }
    }
    Ok(attributes)
}

fn flatten_into(out: &mut BTreeMap<String, String>, key: String, value: Value) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            out.insert(key, s);
        }
        Value::Bool(b) => {
            out.insert(key, b.to_string());
        }
        Value::Number(n) => {
            out.insert(key, n.to_string());
        }
        Value::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                flatten_into(out, format!("{key}.{index}"), item);
            }
        }
        Value::Object(map) => {
            for (child, item) in map {
                flatten_into(out, format!("{key}.{child}"), item);
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn submission(level: Option<&str>, additional_data: Option<Value>) -> RawSubmission {
        RawSubmission {
            application: Some("billing".to_string()),
            level: level.map(str::to_string),
            message: Some("payment processed".to_string()),
            additional_data,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_level_parsing_is_case_insensitive() {
        assert_eq!(LogLevel::from_str("debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("INFORMATION").unwrap(), LogLevel::Information);
        assert_eq!(LogLevel::from_str("Warning").unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::from_str("eRRoR").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("fatal").unwrap(), LogLevel::Fatal);
        assert_eq!(LogLevel::from_str(" warn ").unwrap(), LogLevel::Warning);
        assert!(LogLevel::from_str("bogus").is_err());
    }

    #[test]
    fn test_level_scenario_error_warning_bogus() {
        let levels: Vec<LogLevel> = ["Error", "WARNING", "bogus"]
            .iter()
            .map(|level| {
                LogRecord::from_submission(submission(Some(level), None), "Test", fixed_now())
                    .unwrap()
                    .level()
            })
            .collect();
        assert_eq!(
            levels,
            vec![LogLevel::Error, LogLevel::Warning, LogLevel::Information]
        );
    }

    #[test]
    fn test_missing_level_defaults_to_information() {
        let record =
            LogRecord::from_submission(submission(None, None), "Test", fixed_now()).unwrap();
        assert_eq!(record.level(), LogLevel::Information);
    }

    #[test]
    fn test_missing_application_is_rejected() {
        let mut raw = submission(Some("error"), None);
        raw.application = None;
        assert_eq!(
            LogRecord::from_submission(raw, "Test", fixed_now()),
            Err(ValidationError::MissingField("application"))
        );
    }

    #[test]
    fn test_blank_application_is_rejected() {
        let mut raw = submission(Some("error"), None);
        raw.application = Some("   ".to_string());
        assert_eq!(
            LogRecord::from_submission(raw, "Test", fixed_now()),
            Err(ValidationError::BlankField("application"))
        );
    }

    #[test]
    fn test_missing_message_is_rejected() {
        let mut raw = submission(Some("error"), None);
        raw.message = None;
        assert_eq!(
            LogRecord::from_submission(raw, "Test", fixed_now()),
            Err(ValidationError::MissingField("message"))
        );
    }

    #[test]
    fn test_empty_message_is_accepted() {
        let mut raw = submission(None, None);
        raw.message = Some(String::new());
        let record = LogRecord::from_submission(raw, "Test", fixed_now()).unwrap();
        assert_eq!(record.message(), "");
    }

    #[test]
    fn test_flatten_nested_payload() {
        let attributes = flatten_additional_data(Some(json!({
            "user": {"id": 42, "roles": ["admin", "ops"]},
            "retry": true,
            "note": "plain",
            "skipped": null,
            "ratio": 0.5
        })))
        .unwrap();

        let expected: Vec<(&str, &str)> = vec![
            ("note", "plain"),
            ("ratio", "0.5"),
            ("retry", "true"),
            ("user.id", "42"),
            ("user.roles.0", "admin"),
            ("user.roles.1", "ops"),
        ];
        let actual: Vec<(&str, &str)> = attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_flatten_null_and_missing_payload() {
        assert!(flatten_additional_data(None).unwrap().is_empty());
        assert!(flatten_additional_data(Some(Value::Null)).unwrap().is_empty());
        assert!(flatten_additional_data(Some(json!({}))).unwrap().is_empty());
    }

    #[test]
    fn test_flatten_rejects_non_object_payload() {
        assert_eq!(
            flatten_additional_data(Some(json!([1, 2]))),
            Err(ValidationError::InvalidAdditionalData("an array"))
        );
        assert_eq!(
            flatten_additional_data(Some(json!("text"))),
            Err(ValidationError::InvalidAdditionalData("a string"))
        );
    }

    #[test]
    fn test_raw_submission_accepts_both_casings() {
        let raw: RawSubmission = serde_json::from_value(json!({
            "Application": "orders",
            "Level": "Warning",
            "Message": "slow query",
            "AdditionalData": {"ms": 812}
        }))
        .unwrap();
        assert_eq!(raw.application.as_deref(), Some("orders"));
        assert_eq!(raw.additional_data, Some(json!({"ms": 812})));

        let raw: RawSubmission = serde_json::from_value(json!({
            "application": "orders",
            "message": "slow query",
            "additionalData": null
        }))
        .unwrap();
        assert_eq!(raw.level, None);
        assert_eq!(raw.additional_data, None);
    }

    #[test]
    fn test_document_shape() {
        let record = LogRecord::from_submission(
            submission(Some("warning"), Some(json!({"order": {"id": "A-1"}}))),
            "Staging",
            fixed_now(),
        )
        .unwrap();

        let document = serde_json::to_value(record.to_document()).unwrap();
        assert_eq!(
            document,
            json!({
                "@timestamp": "2024-03-01T12:30:00.000Z",
                "log": {"level": "Warning"},
                "message": "payment processed",
                "service": {"name": "billing", "environment": "Staging"},
                "labels": {"order.id": "A-1"}
            })
        );
    }
}
