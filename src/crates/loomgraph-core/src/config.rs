//! Per-run configuration surface.

use crate::interrupt::ResumeValue;
use serde_json::Value;
use std::time::Duration;

/// Default superstep budget per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// When checkpoints are persisted during a run.
///
/// Interrupt checkpoints are always persisted synchronously regardless of
/// mode — suspending without durable state would lose the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Persist after every superstep, awaiting the write.
    #[default]
    Sync,
    /// Persist after every superstep on a background task.
    Async,
    /// Persist only when the run completes or pauses.
    Exit,
}

/// Configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Identifier scoping this run's checkpoint history. Required for
    /// checkpointing, interrupts, and the state APIs.
    pub thread_id: Option<String>,
    /// Start from this checkpoint instead of the thread's latest; starting
    /// from a historical one forks a new branch.
    pub checkpoint_id: Option<String>,
    /// Namespace within the thread.
    pub checkpoint_ns: Option<String>,
    /// Maximum supersteps before the run fails with a recursion-limit
    /// error.
    pub recursion_limit: usize,
    /// Abort any superstep exceeding this duration, committing nothing.
    pub step_timeout: Option<Duration>,
    /// Pause before executing any of these nodes.
    pub interrupt_before: Vec<String>,
    /// Pause after any of these nodes commits.
    pub interrupt_after: Vec<String>,
}

impl RunConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_interrupt_before(
        mut self,
        nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_after(
        mut self,
        nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_id: None,
            checkpoint_ns: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            step_timeout: None,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
        }
    }
}

/// Input to a run entry point.
#[derive(Debug, Clone)]
pub enum GraphInput {
    /// Fresh input applied to the designated input channels.
    Values(Value),
    /// Resume value(s) answering pending interrupts.
    Resume(ResumeValue),
    /// Continue from the current checkpoint without new input.
    None,
}

impl GraphInput {
    pub fn resume(value: impl Into<ResumeValue>) -> Self {
        GraphInput::Resume(value.into())
    }
}

impl From<Value> for GraphInput {
    fn from(value: Value) -> Self {
        if value.is_null() {
            GraphInput::None
        } else {
            GraphInput::Values(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_recursion_limit_is_25() {
        assert_eq!(RunConfig::default().recursion_limit, 25);
        assert_eq!(RunConfig::new("t").recursion_limit, DEFAULT_RECURSION_LIMIT);
    }

    #[test]
    fn null_input_is_none() {
        assert!(matches!(GraphInput::from(Value::Null), GraphInput::None));
        assert!(matches!(GraphInput::from(json!({"q": 1})), GraphInput::Values(_)));
    }
}
