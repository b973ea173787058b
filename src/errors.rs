//! Error types for the telemetry batcher

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectorError>;

/// Rejected input, raised synchronously and never retried
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("metric name cannot be empty")]
    EmptyMetricName,

    #[error("label names cannot be empty")]
    EmptyLabelName,

    #[error("sample value must be a number")]
    NotANumber,

    #[error("timestamp {0}ms is out of range")]
    TimestampOutOfRange(i64),
}

/// A single failed push to a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{path} responded with {status}: {body}")]
    Status {
        status: StatusCode,
        path: String,
        body: String,
    },

    #[error("request timed out")]
    Timeout,

    #[error("push rejected: {0}")]
    Rejected(String),
}

/// Which sink a delivery failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Logs,
    Metrics,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Logs => write!(f, "logs"),
            SinkKind::Metrics => write!(f, "metrics"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Every attempt failed; the affected items were reverted into their buffers
    #[error("{kind} push failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        kind: SinkKind,
        #[source]
        source: SinkError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_exhausted_retries_keeps_source() {
        let err = CollectorError::ExhaustedRetries {
            attempts: 3,
            kind: SinkKind::Metrics,
            source: SinkError::Rejected("backend down".to_string()),
        };

        assert_eq!(
            err.to_string(),
            "metrics push failed after 3 attempts: push rejected: backend down"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_validation_converts() {
        let err: CollectorError = ValidationError::NotANumber.into();
        assert!(matches!(err, CollectorError::Validation(ValidationError::NotANumber)));
    }

    #[test]
    fn test_status_error_display() {
        let err = SinkError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            path: "/loki/api/v1/push".to_string(),
            body: "try later".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "/loki/api/v1/push responded with 503 Service Unavailable: try later"
        );
    }
}
