//! Error type shared by every part of the engine.
//!
//! A [`TaskflowError`] carries a stable [`ErrorCode`]. The consumers decide
//! what to do with a failed event from the code alone: retry it, dead-letter
//! it, or treat it as already handled by another instance. The same code ends
//! up in logs, in the `taskflow_errors_total` counter and in dead-letter
//! records.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskflowError>;

/// Stable failure codes. Dead-letter records carry these as the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // bus
    TransientBusError,
    FatalBusError,
    PartitionUnavailable,
    SubscriptionClosed,

    // ingestion
    MalformedEnvelope,
    InvalidRecurrenceRule,

    // scheduling
    ScheduleConflict,

    // state store
    StoreError,
    StoreUnavailable,
    VersionConflict,
    RecordNotFound,

    SerializationError,
    DeserializationError,
    DeadlineExceeded,
    InvalidInput,

    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    InternalError,
    UnknownError,
}

impl ErrorCode {
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound => StatusCode::NOT_FOUND,
            Self::VersionConflict | Self::ScheduleConflict | Self::PartitionUnavailable => {
                StatusCode::CONFLICT
            }
            Self::MalformedEnvelope
            | Self::InvalidRecurrenceRule
            | Self::InvalidInput
            | Self::DeserializationError => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::TransientBusError | Self::StoreUnavailable | Self::SubscriptionClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The same event may succeed if handled again after a backoff.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientBusError
                | Self::StoreUnavailable
                | Self::StoreError
                | Self::VersionConflict
                | Self::DeadlineExceeded
        )
    }

    /// The event can never be handled; it goes straight to dead letters.
    pub const fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::FatalBusError
                | Self::MalformedEnvelope
                | Self::InvalidRecurrenceRule
                | Self::DeserializationError
        )
    }

    /// Outcomes of concurrent instances racing each other. Not a fault.
    pub const fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::ScheduleConflict | Self::VersionConflict | Self::PartitionUnavailable
        )
    }

    /// Subsystem label used in logs and metrics.
    pub const fn area(&self) -> &'static str {
        match self {
            Self::TransientBusError
            | Self::FatalBusError
            | Self::PartitionUnavailable
            | Self::SubscriptionClosed => "bus",
            Self::MalformedEnvelope | Self::InvalidRecurrenceRule => "ingestion",
            Self::ScheduleConflict => "scheduling",
            Self::StoreError
            | Self::StoreUnavailable
            | Self::VersionConflict
            | Self::RecordNotFound => "store",
            Self::SerializationError | Self::DeserializationError => "codec",
            Self::DeadlineExceeded => "time",
            Self::InvalidInput => "request",
            Self::ConfigurationError | Self::MissingConfiguration | Self::InvalidConfiguration => {
                "config"
            }
            Self::InternalError | Self::UnknownError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Error, Debug)]
pub struct TaskflowError {
    code: ErrorCode,
    /// Safe to return to HTTP clients.
    message: Cow<'static, str>,
    /// Operator-facing detail. Never leaves the process except in dead letters.
    detail: Option<String>,
    fields: BTreeMap<&'static str, serde_json::Value>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TaskflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({})", self.code, self.message, detail),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl TaskflowError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "taskflow_errors_total",
            "code" => code.to_string(),
            "area" => code.area(),
        )
        .increment(1);

        Self {
            code,
            message: message.into(),
            detail: None,
            fields: BTreeMap::new(),
            source: None,
        }
    }

    /// Error with a public message and a private operator detail.
    pub fn detailed(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        detail: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.detail = Some(detail.into());
        error
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::InternalError, "Internal engine error", detail)
    }

    pub fn not_found(what: &str, key: impl fmt::Display) -> Self {
        Self::new(ErrorCode::RecordNotFound, format!("No {} at {}", what, key))
    }

    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach a structured field; it is logged and returned to HTTP clients.
    pub fn with_context(mut self, key: &'static str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.fields.insert(key, value);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Best description for an operator: the detail if present.
    pub fn reason(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.message)
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_poison(&self) -> bool {
        self.code.is_poison()
    }

    /// Emit one event at a level chosen from the code. Contention and bad
    /// requests are debug noise; retryable failures warn; the rest are errors.
    pub fn log(&self) {
        let code = self.code.to_string();
        let area = self.code.area();
        let fields = FieldsDisplay(&self.fields);

        if self.code.is_contention() || self.code == ErrorCode::InvalidInput {
            tracing::debug!(error_code = %code, area, fields = %fields, "{}", self.message);
        } else if self.code.is_retryable() || self.code == ErrorCode::SubscriptionClosed {
            tracing::warn!(
                error_code = %code,
                area,
                detail = self.detail.as_deref(),
                fields = %fields,
                "{}",
                self.message
            );
        } else {
            tracing::error!(
                error_code = %code,
                area,
                detail = self.detail.as_deref(),
                fields = %fields,
                source = ?self.source,
                "{}",
                self.message
            );
        }
    }
}

struct FieldsDisplay<'a>(&'a BTreeMap<&'static str, serde_json::Value>);

impl fmt::Display for FieldsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// JSON body returned for failed HTTP requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&TaskflowError> for ErrorBody {
    fn from(error: &TaskflowError) -> Self {
        Self {
            success: false,
            error: error.message.to_string(),
            code: error.code,
            context: error
                .fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

impl IntoResponse for TaskflowError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorBody::from(&self))).into_response()
    }
}

impl From<redis::RedisError> for TaskflowError {
    fn from(error: redis::RedisError) -> Self {
        let code = if error.is_connection_refusal() || error.is_connection_dropped() {
            ErrorCode::StoreUnavailable
        } else if error.is_timeout() {
            ErrorCode::DeadlineExceeded
        } else {
            ErrorCode::StoreError
        };
        Self::detailed(code, "Redis command failed", error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TaskflowError {
    fn from(error: serde_json::Error) -> Self {
        use serde_json::error::Category;

        let code = match error.classify() {
            Category::Io => ErrorCode::SerializationError,
            Category::Syntax | Category::Data | Category::Eof => ErrorCode::DeserializationError,
        };
        Self::detailed(code, "Invalid JSON", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TaskflowError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "Timed out").with_source(error)
    }
}

impl From<std::io::Error> for TaskflowError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match error.kind() {
            ErrorKind::TimedOut => ErrorCode::DeadlineExceeded,
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                ErrorCode::StoreUnavailable
            }
            _ => ErrorCode::InternalError,
        };
        Self::detailed(code, "I/O failure", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for TaskflowError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };
        Self::detailed(code, "Could not load configuration", error.to_string())
    }
}

// Domain constructors

impl TaskflowError {
    /// The bus could not accept or deliver right now.
    pub fn transient_bus(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::TransientBusError, "Event bus unavailable", detail)
    }

    /// The bus rejected the record permanently.
    pub fn fatal_bus(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::FatalBusError, "Event bus rejected record", detail)
    }

    pub fn partition_unavailable(topic: &str, consumer: &str, partition: u32) -> Self {
        Self::new(
            ErrorCode::PartitionUnavailable,
            format!("{}/{} is owned by another {} instance", topic, partition, consumer),
        )
        .with_context("topic", topic)
        .with_context("consumer", consumer)
        .with_context("partition", partition)
    }

    pub fn malformed_envelope(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::MalformedEnvelope, "Malformed event envelope", detail)
    }

    pub fn invalid_recurrence_rule(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::InvalidRecurrenceRule, "Invalid recurrence rule", detail)
    }

    /// Another instance already moved this reminder out of `Pending`.
    pub fn schedule_conflict(reminder_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ScheduleConflict, format!("Reminder {} already transitioned", reminder_id))
    }

    pub fn version_conflict(key: &str, expected: Option<u64>, actual: Option<u64>) -> Self {
        Self::new(ErrorCode::VersionConflict, format!("Lost conditional write on {}", key))
            .with_context("key", key)
            .with_context("expected_version", expected)
            .with_context("actual_version", actual)
    }

    pub fn deadline_exceeded(operation: &str) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, format!("{} ran past its deadline", operation))
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::detailed(ErrorCode::InvalidConfiguration, "Invalid configuration", detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorCode; 20] = [
        ErrorCode::TransientBusError,
        ErrorCode::FatalBusError,
        ErrorCode::PartitionUnavailable,
        ErrorCode::SubscriptionClosed,
        ErrorCode::MalformedEnvelope,
        ErrorCode::InvalidRecurrenceRule,
        ErrorCode::ScheduleConflict,
        ErrorCode::StoreError,
        ErrorCode::StoreUnavailable,
        ErrorCode::VersionConflict,
        ErrorCode::RecordNotFound,
        ErrorCode::SerializationError,
        ErrorCode::DeserializationError,
        ErrorCode::DeadlineExceeded,
        ErrorCode::InvalidInput,
        ErrorCode::ConfigurationError,
        ErrorCode::MissingConfiguration,
        ErrorCode::InvalidConfiguration,
        ErrorCode::InternalError,
        ErrorCode::UnknownError,
    ];

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::RecordNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::VersionConflict.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::InvalidInput.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorCode::TransientBusError.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::UnknownError.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn retryable_and_poison_are_disjoint() {
        for code in ALL {
            assert!(!(code.is_retryable() && code.is_poison()), "{code} is both");
        }
        assert!(ErrorCode::TransientBusError.is_retryable());
        assert!(ErrorCode::InvalidRecurrenceRule.is_poison());
        assert!(!ErrorCode::ScheduleConflict.is_retryable());
    }

    #[test]
    fn every_code_has_an_area() {
        for code in ALL {
            assert!(!code.area().is_empty());
        }
        assert_eq!(ErrorCode::VersionConflict.area(), "store");
    }

    #[test]
    fn display_includes_detail() {
        let text = TaskflowError::transient_bus("broker restarting").to_string();
        assert!(text.starts_with("TransientBusError"));
        assert!(text.contains("broker restarting"));
    }

    #[test]
    fn reason_prefers_detail() {
        assert_eq!(TaskflowError::malformed_envelope("bad json").reason(), "bad json");
        assert_eq!(
            TaskflowError::schedule_conflict("r-1").reason(),
            "Reminder r-1 already transitioned"
        );
    }

    #[test]
    fn body_carries_code_and_context() {
        let err = TaskflowError::version_conflict("ledger/x", Some(1), Some(2));
        let json = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "VERSION_CONFLICT");
        assert_eq!(json["context"]["actual_version"], 2);

        let json = serde_json::to_value(ErrorBody::from(&TaskflowError::not_found("task", "t-1"))).unwrap();
        assert!(json.get("context").is_none());
    }

    #[test]
    fn serde_errors_classify_as_deserialization() {
        let err: TaskflowError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }
}
