//! # loomgraph-core — superstep execution engine
//!
//! A stateful graph execution engine in the bulk-synchronous-parallel mold:
//! named nodes communicate only through reducer-governed channels, execute in
//! synchronized supersteps, and have their progress durably checkpointed so a
//! run can be paused, inspected, modified, and resumed — including by a
//! human — without losing state.
//!
//! ## Model
//!
//! - **Channels** hold all state; their kind decides how concurrent writes
//!   combine (see `loomgraph-checkpoint`).
//! - **Nodes** declare trigger/read/write channels and a single async
//!   [`Action`]; wiring is validated at compile time.
//! - The **scheduler** runs supersteps: plan from channel versions, execute
//!   tasks concurrently (each through its retry and cache policies), commit
//!   all writes atomically, checkpoint.
//! - **Interrupts** pause a run from inside a node body
//!   ([`NodeContext::interrupt`]); resuming re-enters the same node with the
//!   caller-supplied value.
//!
//! ## Example
//!
//! ```rust,no_run
//! use loomgraph_core::{ChannelSpec, GraphBuilder, Node, RunConfig, START};
//! use loomgraph_checkpoint::MemorySaver;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> loomgraph_core::Result<()> {
//! let graph = GraphBuilder::new()
//!     .add_channel("input", ChannelSpec::last_value())
//!     .add_channel("items", ChannelSpec::append().with_seed(json!([])))
//!     .add_node(
//!         Node::new("collect", |input, _ctx| async move {
//!             Ok(json!({ "items": [input] }))
//!         })
//!         .reads(["input"])
//!         .writes(["items"]),
//!     )
//!     .add_edge(START, "collect")
//!     .set_input_channels(["input"])
//!     .set_output_channels(["items"])
//!     .compile()?
//!     .with_checkpointer(Arc::new(MemorySaver::new()));
//!
//! let out = graph.invoke(json!("x"), RunConfig::new("thread-1")).await?;
//! assert_eq!(out, json!(["x"]));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod command;
pub mod compiled;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod retry;
pub mod state;
pub mod store;
pub mod stream;
pub mod superstep;

pub use cache::{CacheMetrics, CachePolicy, TaskCache};
pub use command::{Command, Goto, Send};
pub use compiled::{CompiledGraph, SnapshotStream};
pub use config::{Durability, GraphInput, RunConfig, DEFAULT_RECURSION_LIMIT};
pub use context::NodeContext;
pub use error::{GraphError, Result};
pub use graph::{Action, ActionFuture, ChannelSpec, GraphBuilder, GraphDef, Node, NodeSpec, END, START};
pub use interrupt::{Interrupt, ResumeValue};
pub use retry::{RetryOn, RetryPolicy};
pub use state::{StateSnapshot, TaskInfo};
pub use store::{InMemoryStore, Store};
pub use stream::{RunStream, StreamEvent, StreamMode};
pub use superstep::{RunOutcome, RunStatus};
