use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "WAITING_APPROVAL" => Ok(Self::WaitingApproval),
            "CANCELLED" => Ok(Self::Cancelled),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventType {
    Log,
    StateUpdate,
    CheckpointSaved,
    InterruptRequired,
    Resumed,
    Completed,
    Error,
    Cancelled,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::StateUpdate => "STATE_UPDATE",
            Self::CheckpointSaved => "CHECKPOINT_SAVED",
            Self::InterruptRequired => "INTERRUPT_REQUIRED",
            Self::Resumed => "RESUMED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for RunEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOG" => Ok(Self::Log),
            "STATE_UPDATE" => Ok(Self::StateUpdate),
            "CHECKPOINT_SAVED" => Ok(Self::CheckpointSaved),
            "INTERRUPT_REQUIRED" => Ok(Self::InterruptRequired),
            "RESUMED" => Ok(Self::Resumed),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run event type: {}", s)),
        }
    }
}

/// An adapter-host run. Thread id equals run id; one root span per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub prompt: String,
    pub thread_id: String,
    pub root_span_id: String,
    /// Set while `WAITING_APPROVAL`.
    pub interrupt: Option<Value>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Stored run event, serialized in its wire shape (snake_case keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: i64,
    pub run_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    pub payload: Value,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
