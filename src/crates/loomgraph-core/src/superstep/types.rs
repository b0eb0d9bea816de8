//! Task types for the superstep scheduler.

use serde_json::Value;
use std::fmt;

/// A segment of a task's path, used for deterministic ordering and for
/// identifying dynamically fanned-out tasks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Str(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Str(s) => write!(f, "{}", s),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Render a path for sorting and display.
pub fn path_key(path: &[PathSegment]) -> String {
    path.iter()
        .map(PathSegment::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

/// One scheduled instance of a node's execution within a superstep.
///
/// `key` is stable across replans of the same checkpoint: the node name for
/// trigger-matched tasks, `__push__:{node}:{idx}` for dynamically dispatched
/// ones (identified by their position in the send queue). Interrupt and
/// resume bookkeeping is keyed by it.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: String,
    pub name: String,
    /// Input snapshot the action is invoked with.
    pub input: Value,
    pub path: Vec<PathSegment>,
    /// Trigger channels that woke this task; empty for pushed tasks.
    pub triggers: Vec<String>,
    /// Replay list for suspend call sites, in call order.
    pub resume_values: Vec<Value>,
    /// Attempts consumed by earlier failed invocations (diagnostic only).
    pub attempt: usize,
}

impl Task {
    pub fn is_push(&self) -> bool {
        matches!(self.path.first(), Some(PathSegment::Str(s)) if s == "__push__")
    }
}

/// Committed writes of one task, fed to the write-application barrier.
#[derive(Debug, Clone)]
pub struct TaskWrites {
    pub path: Vec<PathSegment>,
    pub name: String,
    pub triggers: Vec<String>,
    pub writes: Vec<(String, Value)>,
}
