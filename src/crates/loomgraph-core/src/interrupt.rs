//! Interrupt data types and the resume-replay scope.
//!
//! Suspension is implemented by re-invoking the node body from scratch on
//! resume and replaying suspend-call results in call order: the first
//! `interrupt()` call in an invocation gets resume value 0, the second gets
//! value 1, and so on. A call with no stored resume value raises the
//! [`GraphError::Interrupt`] control signal, which the scheduler catches.
//! This makes interrupt ids deterministic and resumption idempotent for
//! deterministic node bodies.
//!
//! [`GraphError::Interrupt`]: crate::error::GraphError::Interrupt

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A suspended, resumable point inside a node's execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interrupt {
    /// Deterministic id: `{task_id}:{call_index}`. Stable across replays of
    /// the same checkpoint, so resuming twice behaves identically.
    pub id: String,
    /// The value the node surfaced to the caller when suspending.
    pub value: serde_json::Value,
}

impl Interrupt {
    pub fn new(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self { id: id.into(), value }
    }

    /// Task id portion of the interrupt id.
    pub fn task_id(&self) -> &str {
        self.id.rsplit_once(':').map(|(task, _)| task).unwrap_or(&self.id)
    }
}

/// Per-invocation state backing the suspend primitive.
///
/// Created fresh for every invocation of a node body (including retry
/// re-invocations): the call-site cursor starts at zero each time so replay
/// order matches call order.
#[derive(Debug, Clone)]
pub struct InterruptScope {
    task_id: String,
    resume_values: Arc<Vec<serde_json::Value>>,
    cursor: Arc<AtomicUsize>,
    checkpointer_configured: bool,
}

impl InterruptScope {
    pub fn new(
        task_id: impl Into<String>,
        resume_values: Vec<serde_json::Value>,
        checkpointer_configured: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            resume_values: Arc::new(resume_values),
            cursor: Arc::new(AtomicUsize::new(0)),
            checkpointer_configured,
        }
    }

    /// Scope for contexts where suspension is impossible (no checkpointer).
    pub fn disabled(task_id: impl Into<String>) -> Self {
        Self::new(task_id, Vec::new(), false)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn checkpointer_configured(&self) -> bool {
        self.checkpointer_configured
    }

    /// Resolve one suspend call site.
    ///
    /// Returns `Ok(resume_value)` when this call site was already answered in
    /// a previous run of the task, `Err(interrupt)` when the task must
    /// suspend here.
    pub fn next(&self, value: serde_json::Value) -> std::result::Result<serde_json::Value, Interrupt> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        match self.resume_values.get(index) {
            Some(resume) => Ok(resume.clone()),
            None => Err(Interrupt::new(format!("{}:{}", self.task_id, index), value)),
        }
    }

    /// Resume values consumed so far in this invocation.
    pub fn consumed(&self) -> Vec<serde_json::Value> {
        let n = self.cursor.load(Ordering::SeqCst).min(self.resume_values.len());
        self.resume_values[..n].to_vec()
    }
}

/// Resume input supplied by the caller when continuing a paused run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    /// One value for the single pending interrupt of the run (the common
    /// case).
    Single(serde_json::Value),
    /// Values keyed by interrupt id, for runs with several tasks suspended
    /// at once.
    Keyed(std::collections::HashMap<String, serde_json::Value>),
}

impl From<serde_json::Value> for ResumeValue {
    fn from(value: serde_json::Value) -> Self {
        ResumeValue::Single(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_call_without_resume_suspends() {
        let scope = InterruptScope::new("cp:node", vec![], true);
        let err = scope.next(json!("approve?")).unwrap_err();
        assert_eq!(err.id, "cp:node:0");
        assert_eq!(err.value, json!("approve?"));
    }

    #[test]
    fn replay_returns_resume_values_in_call_order() {
        let scope = InterruptScope::new("cp:node", vec![json!(true), json!("second")], true);
        assert_eq!(scope.next(json!("q1")).unwrap(), json!(true));
        assert_eq!(scope.next(json!("q2")).unwrap(), json!("second"));
        // Third call site has no answer yet: suspend with index 2.
        let err = scope.next(json!("q3")).unwrap_err();
        assert_eq!(err.id, "cp:node:2");
        assert_eq!(scope.consumed(), vec![json!(true), json!("second")]);
    }

    #[test]
    fn interrupt_task_id_strips_call_index() {
        let interrupt = Interrupt::new("cp-1:node_a:0", json!(null));
        assert_eq!(interrupt.task_id(), "cp-1:node_a");
    }
}
