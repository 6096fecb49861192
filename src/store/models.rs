//! Run Store entity types (§3.1, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    Pending,
    Creating,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed | Phase::Stopped | Phase::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Running => "Running",
            Phase::AwaitingInput => "AwaitingInput",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Stopped => "Stopped",
            Phase::Error => "Error",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Phase::Pending),
            "Creating" => Ok(Phase::Creating),
            "Running" => Ok(Phase::Running),
            "AwaitingInput" => Ok(Phase::AwaitingInput),
            "Completed" => Ok(Phase::Completed),
            "Failed" => Ok(Phase::Failed),
            "Stopped" => Ok(Phase::Stopped),
            "Error" => Ok(Phase::Error),
            other => Err(crate::error::Error::Internal(anyhow::anyhow!(
                "unrecognized phase '{other}' stored in run row"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowRef {
    pub name: String,
    pub version: String,
    pub graph: String,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub project: String,
    pub name: String,
    pub workflow_ref: WorkflowRef,
    pub image_digest: String,
    pub graphs: JsonValue,
    pub inputs: JsonValue,
    pub display_name: Option<String>,
    pub parent_run: Option<String>,
    /// Checkpoint thread this run belongs to (§3.1). A fresh run starts its
    /// own thread; a resumed/child run inherits its parent's.
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: uuid::Uuid,
    pub project: String,
    pub name: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub graph: String,
    pub image_digest: String,
    pub inputs: JsonValue,
    pub display_name: Option<String>,
    pub parent_run: Option<String>,
    pub thread_id: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub phase: Phase,
    pub job_name: Option<String>,
    pub service_name: Option<String>,
    pub credential_secret: Option<String>,
    pub current_node: Option<String>,
    pub checkpoint_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub is_error: Option<bool>,
    pub subtype: Option<String>,
    pub num_turns: Option<i32>,
    pub result_excerpt: Option<String>,
    pub awaiting_approval: bool,
    pub awaiting_approval_msg: Option<String>,
    pub awaiting_approval_at: Option<DateTime<Utc>>,
}

/// The mutable fields a writer may request to change, per the §4.8 allow-list.
/// Every field is optional; `None` means "leave unchanged".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusPatch {
    pub phase: Option<Phase>,
    pub job_name: Option<String>,
    pub service_name: Option<String>,
    pub credential_secret: Option<String>,
    pub message: Option<String>,
    pub is_error: Option<bool>,
    pub num_turns: Option<i32>,
    pub result_excerpt: Option<String>,
    pub subtype: Option<String>,
    pub current_node: Option<String>,
    pub checkpoint_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub awaiting_approval: Option<bool>,
    pub awaiting_approval_msg: Option<String>,
    /// Forces a non-monotonic phase move; only honored from the Reconciler.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: uuid::Uuid,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub node: Option<String>,
    pub checkpoint_id: Option<String>,
    pub payload: JsonValue,
    pub partial_id: Option<String>,
    pub partial_index: Option<i32>,
    pub partial_total: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub scope: String,
    pub scope_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub state: JsonValue,
    pub updated_at: DateTime<Utc>,
}
