use autobrowse_core::{ExecutionStatus, LogEntry, Progress};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Notifications about running executions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        execution_id: String,
        task_id: String,
        old: ExecutionStatus,
        new: ExecutionStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        execution_id: String,
        progress: Progress,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        execution_id: String,
        entry: LogEntry,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::StatusChanged { execution_id, .. }
            | ExecutionEvent::Progress { execution_id, .. }
            | ExecutionEvent::Log { execution_id, .. } => execution_id,
        }
    }
}
