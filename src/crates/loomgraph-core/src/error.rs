//! Error taxonomy for graph compilation and execution.
//!
//! The split mirrors how errors propagate: configuration and validation
//! problems surface at compile time and never mid-run; update conflicts and
//! task failures abort the current step without a partial commit, leaving the
//! previous checkpoint valid; [`GraphError::Interrupt`] is a control signal
//! rather than a failure — the scheduler catches it and turns it into a
//! paused, resumable run.

use crate::interrupt::Interrupt;
use loomgraph_checkpoint::CheckpointError;
use thiserror::Error;

/// Convenience result type using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// All errors produced by graph construction and execution.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph wiring is invalid; raised by `compile()`, never mid-run.
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// Run or engine configuration is invalid (missing checkpointer for
    /// interrupts, unknown interrupt node, missing thread id, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Concurrent writes could not be combined by a channel's update policy.
    /// The whole step was aborted; no channel was mutated.
    #[error("conflicting updates for channel '{channel}': {source}")]
    UpdateConflict {
        channel: String,
        #[source]
        source: CheckpointError,
    },

    /// A node's action failed after exhausting its retry budget.
    #[error("node '{node}' failed after {attempts} attempt(s): {error}")]
    NodeExecution {
        node: String,
        attempts: usize,
        error: String,
    },

    /// The run executed `limit` supersteps without reaching a stop
    /// condition. Raise the limit via `RunConfig::recursion_limit` if the
    /// graph legitimately needs more steps.
    #[error(
        "recursion limit of {limit} reached without hitting a stop condition; \
         if this is expected, pass a larger `recursion_limit` in the run config"
    )]
    RecursionLimit { limit: usize },

    /// A superstep exceeded the configured timeout. None of the step's
    /// writes were committed.
    #[error("superstep {step} timed out after {timeout_ms}ms; no writes were committed")]
    StepTimeout { step: usize, timeout_ms: u64 },

    /// Control signal raised by the suspend primitive inside a node body.
    /// Callers of the run entry points never observe this variant; the
    /// scheduler converts it into a paused run with pending interrupts.
    #[error("interrupt raised: {0:?}")]
    Interrupt(Interrupt),

    /// Channel or checkpoint layer error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Execution failure without a more specific classification.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl GraphError {
    /// Whether this error is the interrupt control signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, GraphError::Interrupt(_))
    }
}
