//! Operations: the unit of work mediated between clients and hardware.

pub mod queue;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use queue::{OpContext, OpExec, OpHandle, OpOutcome, OpQueue, QueueConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpKind {
    Press,
    Hold,
    Release,
    PowerOn,
    PowerOff,
    Read,
    Write,
    List,
    Mkdir,
    Rename,
    Move,
    Delete,
}

impl OpKind {
    /// Key ops are subject to host-power gating; power ops are not.
    pub fn is_key(self) -> bool {
        matches!(self, Self::Press | Self::Hold | Self::Release)
    }

    pub fn is_imaging(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Caller-supplied metadata attached at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct OpMeta {
    pub label: Option<String>,
    pub requested_by: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub kind: OpKind,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub status: OpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Operation {
    pub fn new(kind: OpKind, meta: OpMeta) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            created_at: Utc::now().timestamp_millis(),
            started_at: None,
            ended_at: None,
            status: OpStatus::Queued,
            requested_by: meta.requested_by,
            label: meta.label,
            error: None,
            payload: meta.payload,
        }
    }
}
