use std::time::Duration;

use app_footprint_core::{AnalysisError, AnalysisMode, AnalysisRequest, StorageBreakdown};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequestDto {
    pub key: String,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AnalysisRequestDto {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: AnalysisMode::default(),
            force_refresh: false,
            timeout_ms: None,
        }
    }
}

impl From<AnalysisRequestDto> for AnalysisRequest {
    fn from(dto: AnalysisRequestDto) -> Self {
        let request = AnalysisRequest::new(dto.key, dto.mode).force_refresh(dto.force_refresh);
        match dto.timeout_ms {
            Some(ms) => request.with_timeout(Duration::from_millis(ms)),
            None => request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub key: String,
    // One of `timeout`, `cancelled`, `failed`, `shut_down` or
    // `invalid_request`.
    pub error: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn from_error(key: &str, err: &AnalysisError) -> Self {
        Self {
            key: key.to_string(),
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            key: String::new(),
            error: "invalid_request".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Analyze(AnalysisRequestDto),
    CancelAnalysis { key: String },
    CancelAll,
    ClearCache,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Analyze(_) => "analyze",
            Self::CancelAnalysis { .. } => "cancel_analysis",
            Self::CancelAll => "cancel_all",
            Self::ClearCache => "clear_cache",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Ack {
    pub op: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Breakdown(StorageBreakdown),
    Error(ErrorEnvelope),
    Ack(Ack),
}

impl Reply {
    pub fn ack(command: &Command) -> Self {
        Self::Ack(Ack {
            op: command.name().to_string(),
            ok: true,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
