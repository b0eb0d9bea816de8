//! Run entry points over a compiled graph.
//!
//! A [`CompiledGraph`] is cheap to clone (the definition sits behind an
//! `Arc`); each entry point instantiates fresh channels for its run, so
//! concurrent runs never share mutable state. The task-result cache is the
//! one deliberately shared piece — memoized results apply across runs.

use crate::cache::TaskCache;
use crate::config::{Durability, GraphInput, RunConfig};
use crate::error::{GraphError, Result};
use crate::graph::{is_internal_channel, GraphDef};
use crate::interrupt::Interrupt;
use crate::state::{StateSnapshot, TaskInfo};
use crate::store::Store;
use crate::stream::{RunStream, StreamEmitter, StreamEvent, StreamMode};
use crate::superstep::algo::{apply_writes, next_task_names, sync_channel_values};
use crate::superstep::runner::{
    RunOutcome, RunStatus, SuperstepLoop, INTERRUPT_CHANNEL,
};
use crate::superstep::types::{PathSegment, TaskWrites};
use futures::stream::Stream;
use futures::StreamExt;
use loomgraph_checkpoint::{
    Channel, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    CheckpointTuple,
};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;

/// Lazy stream of state snapshots, newest first.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<StateSnapshot>> + Send + 'static>>;

/// An executable graph with its attached collaborators.
#[derive(Clone)]
pub struct CompiledGraph {
    def: Arc<GraphDef>,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    store: Option<Arc<dyn Store>>,
    cache: Arc<TaskCache>,
    durability: Durability,
}

impl CompiledGraph {
    pub(crate) fn new(def: GraphDef) -> Self {
        Self {
            def: Arc::new(def),
            checkpointer: None,
            store: None,
            cache: Arc::new(TaskCache::new()),
            durability: Durability::default(),
        }
    }

    /// The immutable graph definition.
    pub fn def(&self) -> &GraphDef {
        &self.def
    }

    /// Attach a checkpoint storage backend; required for interrupts, resume,
    /// and the state APIs.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Attach a cross-run key-value store exposed to node bodies.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Select when checkpoints are persisted during runs.
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Shared task-result cache (for inspection/invalidation).
    pub fn cache(&self) -> &Arc<TaskCache> {
        &self.cache
    }

    /// Run to completion or pause and return the rich outcome.
    pub async fn run(&self, input: impl Into<GraphInput>, config: RunConfig) -> Result<RunOutcome> {
        let mut run = SuperstepLoop::start(
            self.def.clone(),
            config,
            self.checkpointer.clone(),
            self.store.clone(),
            self.cache.clone(),
            None,
            self.durability,
            input.into(),
        )
        .await?;
        run.run().await
    }

    /// Run to completion and return the output-channel values.
    ///
    /// When the run pauses, the returned value carries the pending
    /// interrupts under the `__interrupt__` key; resolve them with
    /// [`GraphInput::resume`] on a subsequent call.
    pub async fn invoke(&self, input: impl Into<GraphInput>, config: RunConfig) -> Result<Value> {
        let outcome = self.run(input, config).await?;
        Ok(match outcome.status {
            RunStatus::Done => outcome.output,
            RunStatus::Interrupted => attach_interrupts(outcome.output, &outcome.interrupts),
        })
    }

    /// Run in the background, returning a finite stream of step events.
    ///
    /// The stream is lazily consumed and cannot be restarted once exhausted.
    pub async fn stream(
        &self,
        input: impl Into<GraphInput>,
        config: RunConfig,
        modes: Vec<StreamMode>,
    ) -> Result<RunStream> {
        let (emitter, stream) = StreamEmitter::channel(modes);
        let mut run = SuperstepLoop::start(
            self.def.clone(),
            config,
            self.checkpointer.clone(),
            self.store.clone(),
            self.cache.clone(),
            Some(emitter.clone()),
            self.durability,
            input.into(),
        )
        .await?;

        tokio::spawn(async move {
            if let Err(e) = run.run().await {
                tracing::error!(error = %e, "streamed run failed");
                emitter.emit(StreamEvent::Error { step: -1, message: e.to_string() });
            }
        });
        Ok(stream)
    }

    /// Snapshot of the thread's latest (or referenced) checkpoint.
    pub async fn get_state(&self, config: &RunConfig) -> Result<StateSnapshot> {
        let tuple = self.load_tuple(config).await?;
        Ok(snapshot_from_tuple(&self.def, tuple))
    }

    /// Lazy sequence of snapshots for the thread, newest first.
    pub async fn get_state_history(&self, config: &RunConfig) -> Result<SnapshotStream> {
        let saver = self.require_checkpointer()?;
        let thread_id = require_thread(config)?;
        let mut address = CheckpointConfig::new(thread_id);
        address.checkpoint_ns = config.checkpoint_ns.clone();

        let def = self.def.clone();
        let inner = saver.list(Some(&address), None, None, None).await?;
        let stream = inner.map(move |item| {
            item.map(|tuple| snapshot_from_tuple(&def, tuple))
                .map_err(GraphError::from)
        });
        Ok(Box::pin(stream))
    }

    /// Apply channel writes as if the named node produced them, persisting a
    /// new checkpoint whose parent is the addressed one.
    ///
    /// `values` is an object mapping channel names to update values.
    /// Addressing a historical checkpoint via `config.checkpoint_id` forks a
    /// new branch from it. Returns the new checkpoint's address.
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let saver = self.require_checkpointer()?;
        let thread_id = require_thread(config)?;

        let mut address = CheckpointConfig::new(thread_id);
        address.checkpoint_id = config.checkpoint_id.clone();
        address.checkpoint_ns = config.checkpoint_ns.clone();

        let mut channels = self.def.build_channels();
        let (mut checkpoint, parent_address, step) = match saver.get_tuple(&address).await? {
            Some(tuple) => {
                for (name, snapshot) in &tuple.checkpoint.channel_values {
                    if let Some(channel) = channels.get_mut(name) {
                        channel.restore(snapshot.clone())?;
                    }
                }
                let step = tuple.metadata.step.unwrap_or(-1) + 1;
                (tuple.checkpoint, tuple.config, step)
            }
            None if config.checkpoint_id.is_some() => {
                return Err(GraphError::Checkpoint(
                    loomgraph_checkpoint::CheckpointError::NotFound(
                        config.checkpoint_id.clone().unwrap_or_default(),
                    ),
                ));
            }
            None => (Checkpoint::new(), address.clone(), 0),
        };

        let Value::Object(entries) = values else {
            return Err(GraphError::Execution(
                "update_state values must be an object mapping channel names to values".to_string(),
            ));
        };
        let mut writes = Vec::new();
        for (channel, value) in entries {
            if !self.def.channels.contains_key(&channel) {
                return Err(GraphError::Validation(format!(
                    "update_state targets undeclared channel '{}'",
                    channel
                )));
            }
            writes.push((channel, value));
        }

        let name = as_node.unwrap_or("__update__").to_string();
        let triggers = self
            .def
            .nodes
            .get(&name)
            .map(|n| n.triggers.clone())
            .unwrap_or_default();

        checkpoint = checkpoint.next();
        apply_writes(
            &mut checkpoint,
            &mut channels,
            vec![TaskWrites {
                path: vec![PathSegment::Str(name.clone())],
                name,
                triggers,
                writes,
            }],
            &self.def.trigger_to_nodes,
            true,
        )?;
        sync_channel_values(&mut checkpoint, &channels)?;

        let versions = checkpoint.channel_versions.clone();
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Update)
            .with_step(step);
        let new_config = saver.put(&parent_address, checkpoint, metadata, versions).await?;
        Ok(new_config)
    }

    fn require_checkpointer(&self) -> Result<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref().ok_or_else(|| {
            GraphError::Configuration(
                "this operation requires a checkpointer; attach one with with_checkpointer"
                    .to_string(),
            )
        })
    }

    async fn load_tuple(&self, config: &RunConfig) -> Result<CheckpointTuple> {
        let saver = self.require_checkpointer()?;
        let thread_id = require_thread(config)?;
        let mut address = CheckpointConfig::new(thread_id);
        address.checkpoint_id = config.checkpoint_id.clone();
        address.checkpoint_ns = config.checkpoint_ns.clone();
        saver.get_tuple(&address).await?.ok_or_else(|| {
            GraphError::Checkpoint(loomgraph_checkpoint::CheckpointError::NotFound(format!(
                "no checkpoint for thread '{}'",
                config.thread_id.as_deref().unwrap_or_default()
            )))
        })
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.def.nodes.len())
            .field("channels", &self.def.channels.len())
            .field("checkpointer", &self.checkpointer.is_some())
            .field("store", &self.store.is_some())
            .field("durability", &self.durability)
            .finish()
    }
}

fn require_thread(config: &RunConfig) -> Result<String> {
    config.thread_id.clone().ok_or_else(|| {
        GraphError::Configuration("a thread_id is required for this operation".to_string())
    })
}

fn attach_interrupts(output: Value, interrupts: &[Interrupt]) -> Value {
    if interrupts.is_empty() {
        return output;
    }
    let ints = serde_json::to_value(interrupts).unwrap_or(Value::Null);
    match output {
        Value::Object(mut obj) => {
            obj.insert("__interrupt__".to_string(), ints);
            Value::Object(obj)
        }
        other => json!({ "value": other, "__interrupt__": ints }),
    }
}

fn snapshot_from_tuple(def: &GraphDef, tuple: CheckpointTuple) -> StateSnapshot {
    let mut values = serde_json::Map::new();
    for (name, value) in &tuple.checkpoint.channel_values {
        if !is_internal_channel(name) {
            values.insert(name.clone(), value.clone());
        }
    }

    // Rehydrate channels so the next-node computation can apply the same
    // data-availability gate the scheduler uses.
    let mut channels = def.build_channels();
    for (name, snapshot) in &tuple.checkpoint.channel_values {
        if let Some(channel) = channels.get_mut(name) {
            if let Err(e) = channel.restore(snapshot.clone()) {
                tracing::warn!(channel = %name, error = %e, "channel snapshot not restorable");
            }
        }
    }
    let next = next_task_names(&tuple.checkpoint, &def.nodes, |chan| {
        channels.get(chan).is_some_and(|c| c.is_available())
    });
    let mut interrupts = Vec::new();
    let mut tasks: Vec<TaskInfo> = next
        .iter()
        .map(|name| TaskInfo { id: name.clone(), name: name.clone() })
        .collect();

    for write in &tuple.pending_writes {
        if write.channel == INTERRUPT_CHANNEL {
            if let Some(value) = write.value.get("interrupt") {
                if let Ok(interrupt) = serde_json::from_value::<Interrupt>(value.clone()) {
                    interrupts.push(interrupt);
                }
            }
            let node = write
                .task_id
                .strip_prefix("__push__:")
                .and_then(|rest| rest.rsplit_once(':').map(|(node, _)| node))
                .unwrap_or(&write.task_id);
            if !tasks.iter().any(|t| t.id == write.task_id) {
                tasks.push(TaskInfo {
                    id: write.task_id.clone(),
                    name: node.to_string(),
                });
            }
        }
    }

    StateSnapshot {
        values: Value::Object(values),
        next,
        interrupts,
        tasks,
        config: tuple.config,
        parent_config: tuple.parent_config,
        metadata: tuple.metadata,
        created_at: tuple.checkpoint.ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attach_interrupts_merges_into_object() {
        let interrupts = vec![Interrupt::new("a:0", json!("approve?"))];
        let out = attach_interrupts(json!({"result": 1}), &interrupts);
        assert_eq!(out["result"], json!(1));
        assert_eq!(out["__interrupt__"][0]["value"], json!("approve?"));
    }

    #[test]
    fn attach_interrupts_wraps_non_object() {
        let interrupts = vec![Interrupt::new("a:0", json!(null))];
        let out = attach_interrupts(json!(42), &interrupts);
        assert_eq!(out["value"], json!(42));
        assert!(out["__interrupt__"].is_array());
    }

    #[test]
    fn attach_interrupts_noop_without_interrupts() {
        assert_eq!(attach_interrupts(json!(42), &[]), json!(42));
    }
}
