//! State inspection snapshots.

use crate::interrupt::Interrupt;
use chrono::{DateTime, Utc};
use loomgraph_checkpoint::{CheckpointConfig, CheckpointMetadata};
use serde_json::Value;

/// A task that would run next from a snapshot's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Stable task key (node name, or `__push__:{node}:{idx}`).
    pub id: String,
    /// Node the task executes.
    pub name: String,
}

/// Read-only view of a thread's state at one checkpoint.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Channel values (engine-internal channels omitted).
    pub values: Value,
    /// Names of nodes that would execute next.
    pub next: Vec<String>,
    /// Unresolved interrupts recorded against this checkpoint.
    pub interrupts: Vec<Interrupt>,
    /// Tasks planned from this checkpoint.
    pub tasks: Vec<TaskInfo>,
    /// Address of this checkpoint (thread id + checkpoint id).
    pub config: CheckpointConfig,
    /// Address of the parent checkpoint, if any.
    pub parent_config: Option<CheckpointConfig>,
    /// Metadata stored with the checkpoint.
    pub metadata: CheckpointMetadata,
    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Whether the run this snapshot belongs to has finished: nothing to run
    /// next and no interrupt awaiting resolution.
    pub fn is_terminal(&self) -> bool {
        self.next.is_empty() && self.interrupts.is_empty()
    }
}
