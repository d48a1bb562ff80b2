use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Queue refused: {0}")]
    Queue(String),

    #[error("Identify failed: {0}")]
    Identify(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Operation already in progress: {0}")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BenchError>;

/// Where in the device pipeline a fault originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultScope {
    Discovery,
    Open,
    Identify,
    Write,
    Read,
    Protocol,
    Queue,
    Cancel,
    Unknown,
}

/// A bounded, reportable failure. Every failure path in the orchestrator ends
/// in one of these; nothing panics the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFault {
    pub at_ms: i64,
    pub scope: FaultScope,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub retryable: bool,
}

impl DeviceFault {
    pub fn new(scope: FaultScope, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            at_ms: Utc::now().timestamp_millis(),
            scope,
            message: message.into(),
            detail: None,
            retryable,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Classify a [`BenchError`] into a fault for the given scope. Transient
    /// I/O is retryable; protocol violations and path rejections are not.
    pub fn from_error(scope: FaultScope, err: &BenchError) -> Self {
        let retryable = match err {
            BenchError::Io(_) | BenchError::Serial(_) | BenchError::Identify(_) => true,
            BenchError::Protocol(_)
            | BenchError::Cancelled(_)
            | BenchError::Queue(_)
            | BenchError::Busy(_)
            | BenchError::Config(_)
            | BenchError::NotFound(_)
            | BenchError::Serialization(_)
            | BenchError::Internal(_) => false,
        };
        Self::new(scope, err.to_string(), retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_faults_are_retryable() {
        let err = BenchError::Io(std::io::Error::other("port vanished"));
        let fault = DeviceFault::from_error(FaultScope::Write, &err);
        assert!(fault.retryable);
        assert_eq!(fault.scope, FaultScope::Write);
    }

    #[test]
    fn protocol_faults_are_terminal() {
        let err = BenchError::Protocol("unknown key identifier: KeyZz".into());
        let fault = DeviceFault::from_error(FaultScope::Protocol, &err);
        assert!(!fault.retryable);
    }
}
