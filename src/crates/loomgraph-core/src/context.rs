//! Explicit per-task context passed into node actions.
//!
//! There is no ambient/thread-local runtime state: everything a node body may
//! touch — the run configuration view, the cross-run store, the suspend
//! primitive — arrives through this context as an argument to
//! [`Action::invoke`].
//!
//! [`Action::invoke`]: crate::graph::Action

use crate::error::{GraphError, Result};
use crate::interrupt::InterruptScope;
use crate::store::Store;
use serde_json::Value;
use std::sync::Arc;

/// Context handed to a node action for one invocation.
#[derive(Clone)]
pub struct NodeContext {
    node: String,
    thread_id: Option<String>,
    step: i64,
    store: Option<Arc<dyn Store>>,
    scope: InterruptScope,
}

impl NodeContext {
    pub fn new(
        node: impl Into<String>,
        thread_id: Option<String>,
        step: i64,
        store: Option<Arc<dyn Store>>,
        scope: InterruptScope,
    ) -> Self {
        Self {
            node: node.into(),
            thread_id,
            step,
            store,
            scope,
        }
    }

    /// Name of the executing node.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Thread id of the current run, when one was configured.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Superstep number of the current step.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Cross-run key-value store, when one was attached to the graph.
    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    /// Suspend execution here, surfacing `value` to the caller.
    ///
    /// On the first run of a task this raises the interrupt control signal:
    /// the scheduler discards the task's writes, checkpoints, and pauses the
    /// run. When the run is resumed the node body is re-invoked from the
    /// same input, and this same call site returns the caller-supplied
    /// resume value instead of suspending. Multiple suspend calls in one
    /// body resolve by call order on replay.
    ///
    /// # Errors
    ///
    /// [`GraphError::Configuration`] when no checkpointer is configured —
    /// suspending without durable state would lose the run.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        if !self.scope.checkpointer_configured() {
            return Err(GraphError::Configuration(
                "interrupt() requires a configured checkpointer and thread_id; \
                 attach one with CompiledGraph::with_checkpointer and pass a thread_id"
                    .to_string(),
            ));
        }
        self.scope.next(value).map_err(GraphError::Interrupt)
    }

    /// Resume values consumed so far in this invocation.
    pub(crate) fn consumed_resume_values(&self) -> Vec<Value> {
        self.scope.consumed()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("thread_id", &self.thread_id)
            .field("step", &self.step)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
