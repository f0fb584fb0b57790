use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("analysis of {key} timed out after {}ms", after.as_millis())]
    Timeout { key: String, after: Duration },
    #[error("analysis of {key} was cancelled")]
    Cancelled { key: String },
    #[error("analysis of {key} failed: {reason}")]
    Failed { key: String, reason: String },
    #[error("scheduler is shut down")]
    ShutDown,
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
            Self::ShutDown => "shut_down",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be between 0.0 and 1.0, got {value}")]
    OutOfRange { field: &'static str, value: f32 },
}
