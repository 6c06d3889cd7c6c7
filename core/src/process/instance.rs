//! Process instance state (spec §4.5): the persisted row a `ProcessManager`
//! reads and advances. Grounded on `Command`'s `FromRow` shape in
//! `crate::command`, with the process-specific fields (`data`,
//! `pending_parallel`, `history`) stored as JSONB the same way
//! `Command::payload`/`reply` are.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Compensating,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Waiting => "WAITING",
            ProcessStatus::Completed => "COMPLETED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Compensating => "COMPENSATING",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => ProcessStatus::Running,
            "WAITING" => ProcessStatus::Waiting,
            "COMPLETED" => ProcessStatus::Completed,
            "FAILED" => ProcessStatus::Failed,
            "COMPENSATING" => ProcessStatus::Compensating,
            other => unreachable!("unknown process status in storage: {other}"),
        }
    }
}

/// Tracks an in-flight parallel region (spec §4.5 step 2, Parallel strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingParallel {
    pub join_step: String,
    pub expected: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// branch step name -> command id scheduled for that branch, so replies
    /// can be attributed to the right branch.
    pub branch_commands: std::collections::HashMap<String, Uuid>,
    /// completed branches in the order they completed, for reverse-order
    /// compensation (spec §4.5 "Compensation").
    pub completion_order: Vec<String>,
}

impl PendingParallel {
    pub fn is_resolved(&self) -> bool {
        self.completed.len() + self.failed.len() >= self.expected.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub command_id: Option<Uuid>,
    pub status: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_type: String,
    pub business_key: String,
    pub current_step: String,
    pub status: String,
    pub data: serde_json::Value,
    pub pending_parallel: Option<serde_json::Value>,
    pub history: serde_json::Value,
    /// Completed steps in the order they finished, in the current execution
    /// path — used to walk backward during sequential compensation.
    pub completed_steps: serde_json::Value,
    /// The command id scheduled for `current_step` when it is not a
    /// parallel region — how `onReply` finds this instance (spec §4.5).
    pub current_command_id: Option<Uuid>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus::from_str(&self.status)
    }

    pub fn pending_parallel(&self) -> Option<PendingParallel> {
        self.pending_parallel
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn completed_steps(&self) -> Vec<String> {
        serde_json::from_value(self.completed_steps.clone()).unwrap_or_default()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        serde_json::from_value(self.history.clone()).unwrap_or_default()
    }
}
