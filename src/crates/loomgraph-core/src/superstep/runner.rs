//! The superstep loop: PLANNING → RUNNING → COMMITTING, with interrupts,
//! retry/cache, timeouts, and checkpoint persistence.
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │ superstep N                                                │
//!  │   PLANNING    prepare_next_tasks (version-based triggers,  │
//!  │               queued sends)           — empty plan ⇒ DONE  │
//!  │   RUNNING     all tasks concurrently, each through the     │
//!  │               cache check and retry loop; a task may end   │
//!  │               in a value, a suspend signal, or a failure   │
//!  │   COMMITTING  apply_writes (atomic barrier), persist       │
//!  │               checkpoint      — suspend ⇒ INTERRUPTED      │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed task aborts the step before the barrier: nothing commits and the
//! previous checkpoint remains valid. A suspended task has its writes
//! discarded while the rest of the step commits; the persisted checkpoint
//! then re-plans exactly that task on resume.

use crate::cache::TaskCache;
use crate::command::{Command, Send as SendTo};
use crate::config::{Durability, GraphInput, RunConfig};
use crate::context::NodeContext;
use crate::error::{GraphError, Result};
use crate::graph::{GraphDef, NodeSpec, TASKS_CHANNEL};
use crate::interrupt::{Interrupt, InterruptScope, ResumeValue};
use crate::retry::select_policy;
use crate::store::Store;
use crate::stream::{StreamEmitter, StreamEvent};
use crate::superstep::algo::{
    apply_writes, prepare_next_tasks, sync_channel_values,
};
use crate::superstep::io::{map_input, read_output};
use crate::superstep::types::{PathSegment, Task, TaskWrites};
use loomgraph_checkpoint::{
    Channel, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Pending-write channel recording unresolved interrupts.
pub(crate) const INTERRUPT_CHANNEL: &str = "__interrupt__";
/// Pending-write channel recording resume replay lists.
pub(crate) const RESUME_CHANNEL: &str = "__resume__";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No node triggers and no interrupt is pending.
    Done,
    /// Paused: suspended node(s) or a static interrupt point.
    Interrupted,
}

/// Result of driving a run to completion or pause.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Values of the designated output channels.
    pub output: Value,
    /// Pending interrupts when paused by a suspend call.
    pub interrupts: Vec<Interrupt>,
}

/// Unresolved interrupt recorded against a checkpoint.
#[derive(Debug, Clone)]
pub(crate) struct InterruptEntry {
    pub task_key: String,
    pub interrupt: Interrupt,
    pub input: Value,
    pub push: bool,
}

impl InterruptEntry {
    fn to_value(&self) -> Value {
        json!({
            "interrupt": self.interrupt,
            "input": self.input,
            "push": self.push,
        })
    }

    fn from_value(task_key: &str, value: &Value) -> Option<Self> {
        Some(Self {
            task_key: task_key.to_string(),
            interrupt: serde_json::from_value(value.get("interrupt")?.clone()).ok()?,
            input: value.get("input").cloned().unwrap_or(Value::Null),
            push: value.get("push").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Mutable state of one run.
pub(crate) struct SuperstepLoop {
    def: Arc<GraphDef>,
    config: RunConfig,
    channels: HashMap<String, Box<dyn Channel>>,
    checkpoint: Checkpoint,
    /// Superstep counter; counts against the recursion limit.
    step: i64,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    /// Address of the latest persisted checkpoint (parent of the next put).
    checkpoint_config: Option<CheckpointConfig>,
    store: Option<Arc<dyn Store>>,
    cache: Arc<TaskCache>,
    emitter: Option<StreamEmitter>,
    durability: Durability,
    /// Replay lists keyed by task key.
    resume_map: HashMap<String, Vec<Value>>,
    /// Frozen input snapshots for suspended tasks.
    task_inputs: HashMap<String, Value>,
    /// Entries loaded from the checkpoint or recorded this run.
    pending_interrupts: Vec<InterruptEntry>,
    /// Skip static interrupt points on the first planning after a resume.
    resuming: bool,
    /// Exit-durability bookkeeping: commits since the last persist.
    dirty: bool,
}

impl SuperstepLoop {
    pub(crate) async fn start(
        def: Arc<GraphDef>,
        config: RunConfig,
        checkpointer: Option<Arc<dyn CheckpointSaver>>,
        store: Option<Arc<dyn Store>>,
        cache: Arc<TaskCache>,
        emitter: Option<StreamEmitter>,
        durability: Durability,
        input: GraphInput,
    ) -> Result<Self> {
        for node in config.interrupt_before.iter().chain(&config.interrupt_after) {
            if !def.nodes.contains_key(node) {
                return Err(GraphError::Configuration(format!(
                    "interrupt point '{}' is not a node in the graph",
                    node
                )));
            }
        }

        let mut channels = def.build_channels();
        let mut checkpoint = Checkpoint::new();
        let mut checkpoint_config = None;
        let mut step: i64 = 0;
        let mut resume_map: HashMap<String, Vec<Value>> = HashMap::new();
        let mut task_inputs: HashMap<String, Value> = HashMap::new();
        let mut pending: Vec<InterruptEntry> = Vec::new();

        if let (Some(saver), Some(thread_id)) = (&checkpointer, &config.thread_id) {
            let mut address = CheckpointConfig::new(thread_id.clone());
            address.checkpoint_id = config.checkpoint_id.clone();
            address.checkpoint_ns = config.checkpoint_ns.clone();

            match saver.get_tuple(&address).await? {
                Some(tuple) => {
                    for (name, snapshot) in &tuple.checkpoint.channel_values {
                        match channels.get_mut(name) {
                            Some(channel) => channel.restore(snapshot.clone())?,
                            None => tracing::warn!(
                                channel = %name,
                                "checkpoint value for a channel no longer in the graph"
                            ),
                        }
                    }
                    step = tuple.metadata.step.unwrap_or(-1) + 1;
                    for write in &tuple.pending_writes {
                        match write.channel.as_str() {
                            RESUME_CHANNEL => {
                                let values = write
                                    .value
                                    .as_array()
                                    .cloned()
                                    .unwrap_or_else(|| vec![write.value.clone()]);
                                resume_map.insert(write.task_id.clone(), values);
                            }
                            INTERRUPT_CHANNEL => {
                                if let Some(entry) =
                                    InterruptEntry::from_value(&write.task_id, &write.value)
                                {
                                    task_inputs.insert(entry.task_key.clone(), entry.input.clone());
                                    pending.push(entry);
                                }
                            }
                            _ => {}
                        }
                    }
                    checkpoint = tuple.checkpoint;
                    checkpoint_config = Some(tuple.config);
                }
                None if config.checkpoint_id.is_some() => {
                    return Err(GraphError::Checkpoint(
                        loomgraph_checkpoint::CheckpointError::NotFound(
                            config.checkpoint_id.clone().unwrap_or_default(),
                        ),
                    ));
                }
                None => {
                    checkpoint_config = Some(CheckpointConfig {
                        thread_id: Some(thread_id.clone()),
                        checkpoint_id: None,
                        checkpoint_ns: config.checkpoint_ns.clone(),
                        extra: HashMap::new(),
                    });
                }
            }
        }

        let mut run = Self {
            def,
            config,
            channels,
            checkpoint,
            step,
            checkpointer,
            checkpoint_config,
            store,
            cache,
            emitter,
            durability,
            resume_map,
            task_inputs,
            pending_interrupts: pending,
            resuming: false,
            dirty: false,
        };
        run.apply_input(input).await?;
        Ok(run)
    }

    async fn apply_input(&mut self, input: GraphInput) -> Result<()> {
        match input {
            GraphInput::Values(value) => {
                let writes = map_input(&value, &self.def.input_channels)?;
                self.checkpoint = self.checkpoint.next();
                apply_writes(
                    &mut self.checkpoint,
                    &mut self.channels,
                    vec![TaskWrites {
                        path: vec![PathSegment::Str("__input__".into())],
                        name: "__input__".into(),
                        triggers: vec![],
                        writes,
                    }],
                    &self.def.trigger_to_nodes,
                    true,
                )?;
                sync_channel_values(&mut self.checkpoint, &self.channels)?;
                self.persist(CheckpointSource::Input, self.step - 1, true).await?;
            }
            GraphInput::Resume(resume) => {
                if self.checkpointer.is_none() || self.config.thread_id.is_none() {
                    return Err(GraphError::Configuration(
                        "resuming requires a checkpointer and a thread_id".to_string(),
                    ));
                }
                if self.pending_interrupts.is_empty() {
                    return Err(GraphError::Configuration(
                        "nothing to resume: the thread has no pending interrupts".to_string(),
                    ));
                }
                match resume {
                    ResumeValue::Single(value) => {
                        if self.pending_interrupts.len() > 1 {
                            return Err(GraphError::Configuration(
                                "several interrupts are pending; supply a map keyed by interrupt id"
                                    .to_string(),
                            ));
                        }
                        let task_key = self.pending_interrupts[0].task_key.clone();
                        self.attach_resume(&task_key, value).await?;
                    }
                    ResumeValue::Keyed(map) => {
                        for (interrupt_id, value) in map {
                            let task_key = self
                                .pending_interrupts
                                .iter()
                                .find(|e| e.interrupt.id == interrupt_id)
                                .map(|e| e.task_key.clone())
                                .ok_or_else(|| {
                                    GraphError::Configuration(format!(
                                        "no pending interrupt with id '{}'",
                                        interrupt_id
                                    ))
                                })?;
                            self.attach_resume(&task_key, value).await?;
                        }
                    }
                }
                self.pending_interrupts.clear();
                self.resuming = true;
            }
            GraphInput::None => {
                self.pending_interrupts.clear();
                self.resuming = true;
            }
        }
        Ok(())
    }

    async fn attach_resume(&mut self, task_key: &str, value: Value) -> Result<()> {
        let list = self.resume_map.entry(task_key.to_string()).or_default();
        list.push(value);
        let list_value = json!(list.clone());
        if let (Some(saver), Some(address)) = (&self.checkpointer, &self.checkpoint_config) {
            saver
                .put_writes(
                    address,
                    vec![(RESUME_CHANNEL.to_string(), list_value)],
                    task_key.to_string(),
                )
                .await?;
        }
        Ok(())
    }

    /// Drive the run until DONE or INTERRUPTED.
    pub(crate) async fn run(&mut self) -> Result<RunOutcome> {
        loop {
            let updated: Option<HashSet<String>> = self
                .checkpoint
                .updated_channels
                .as_ref()
                .map(|list| list.iter().cloned().collect());

            let tasks = prepare_next_tasks(
                &self.checkpoint,
                &self.def.nodes,
                &mut self.channels,
                &self.def.input_channels,
                updated.as_ref(),
                &self.def.trigger_to_nodes,
                &self.resume_map,
                &self.task_inputs,
            )?;

            if tasks.is_empty() {
                if self.dirty {
                    self.persist(CheckpointSource::Loop, self.step - 1, true).await?;
                }
                return Ok(self.outcome(RunStatus::Done, Vec::new()));
            }

            if self.step >= self.config.recursion_limit as i64 {
                return Err(GraphError::RecursionLimit {
                    limit: self.config.recursion_limit,
                });
            }

            let skip_static = std::mem::take(&mut self.resuming);
            if !skip_static
                && tasks
                    .iter()
                    .any(|t| self.config.interrupt_before.contains(&t.name))
            {
                tracing::debug!(step = self.step, "pausing before interrupt_before node");
                if self.dirty {
                    self.persist(CheckpointSource::Loop, self.step - 1, true).await?;
                }
                self.emit(StreamEvent::Interrupted { step: self.step, interrupts: vec![] });
                return Ok(self.outcome(RunStatus::Interrupted, Vec::new()));
            }

            tracing::debug!(
                step = self.step,
                tasks = tasks.len(),
                "executing superstep"
            );
            let results = self.execute_tasks(&tasks).await?;
            if let Some(outcome) = self.commit_and_advance(results).await? {
                return Ok(outcome);
            }
        }
    }

    /// COMMITTING: collect writes, apply them atomically, persist, and
    /// handle suspensions. Returns `Some(outcome)` when the run pauses.
    async fn commit_and_advance(
        &mut self,
        results: Vec<(Task, TaskRun)>,
    ) -> Result<Option<RunOutcome>> {
        let mut successes: Vec<(Task, Value)> = Vec::new();
        let mut suspended: Vec<(Task, Interrupt, Vec<Value>)> = Vec::new();

        for (task, run) in results {
            match run {
                TaskRun::Success { output, cached } => {
                    self.emit(StreamEvent::TaskEnd {
                        step: self.step,
                        task: task.key.clone(),
                        node: task.name.clone(),
                    });
                    if cached {
                        tracing::debug!(node = %task.name, "committed cached result");
                    }
                    // The task ran to completion: any interrupt bookkeeping
                    // for it is settled.
                    self.task_inputs.remove(&task.key);
                    self.resume_map.remove(&task.key);
                    successes.push((task, output));
                }
                TaskRun::Suspended { interrupt, consumed } => {
                    tracing::info!(
                        node = %task.name,
                        interrupt_id = %interrupt.id,
                        "task suspended; its writes are discarded"
                    );
                    suspended.push((task, interrupt, consumed));
                }
                TaskRun::Failed(err) => {
                    self.emit(StreamEvent::TaskError {
                        step: self.step,
                        task: task.key.clone(),
                        node: task.name.clone(),
                        error: err.to_string(),
                    });
                    // Step aborted: nothing from this step commits, the
                    // previous checkpoint stays valid and resumable.
                    return Err(err);
                }
            }
        }

        let mut task_writes = Vec::new();
        let mut updates_events = Vec::new();
        for (task, output) in &successes {
            let spec = &self.def.nodes[&task.name];
            let mut writes = match Command::from_value(output) {
                Some(cmd) => {
                    let mut writes = match &cmd.update {
                        Some(update) => map_node_writes(spec, update)?,
                        None => Vec::new(),
                    };
                    if let Some(goto) = cmd.goto {
                        for send in goto.into_sends() {
                            writes.push((TASKS_CHANNEL.to_string(), serde_json::to_value(&send)?));
                        }
                    }
                    writes
                }
                None => map_node_writes(spec, output)?,
            };
            for chan in &spec.edge_writes {
                writes.push((chan.clone(), Value::Bool(true)));
            }
            updates_events.push((task.name.clone(), output.clone()));
            task_writes.push(TaskWrites {
                path: task.path.clone(),
                name: task.name.clone(),
                triggers: task.triggers.clone(),
                writes,
            });
        }

        // Suspended push tasks lost their queue slot when the sends were
        // drained at planning; re-enqueue them (at the queue tail — the
        // `~requeue` path sorts after every node name) so the resumed run
        // re-plans them.
        let requeue: Vec<&Task> = suspended
            .iter()
            .filter(|(task, _, _)| task.is_push())
            .map(|(task, _, _)| task)
            .collect();
        if !requeue.is_empty() {
            let mut writes = Vec::new();
            for task in &requeue {
                writes.push((
                    TASKS_CHANNEL.to_string(),
                    serde_json::to_value(SendTo::new(task.name.clone(), Value::Null))?,
                ));
            }
            task_writes.push(TaskWrites {
                path: vec![PathSegment::Str("~requeue".into())],
                name: "__requeue__".into(),
                triggers: vec![],
                writes,
            });
        }

        apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            task_writes,
            &self.def.trigger_to_nodes,
            suspended.is_empty(),
        )?;
        sync_channel_values(&mut self.checkpoint, &self.channels)?;
        self.checkpoint = self.checkpoint.next();
        self.dirty = true;

        for (node, update) in &updates_events {
            self.emit(StreamEvent::Updates {
                step: self.step,
                node: node.clone(),
                update: update.clone(),
            });
        }
        self.emit(StreamEvent::Values {
            step: self.step,
            state: read_output(&self.channels, &self.def.output_channels),
        });

        let has_suspensions = !suspended.is_empty();
        let hit_after = successes
            .iter()
            .any(|(task, _)| self.config.interrupt_after.contains(&task.name));

        match self.durability {
            Durability::Sync => self.persist(CheckpointSource::Loop, self.step, false).await?,
            Durability::Async => {
                self.persist(CheckpointSource::Loop, self.step, has_suspensions)
                    .await?
            }
            Durability::Exit => {
                if has_suspensions || hit_after {
                    self.persist(CheckpointSource::Loop, self.step, true).await?;
                }
            }
        }

        if has_suspensions {
            let entries = self.record_interrupts(suspended).await?;
            let interrupts: Vec<Interrupt> =
                entries.iter().map(|e| e.interrupt.clone()).collect();
            self.pending_interrupts = entries;
            self.emit(StreamEvent::Interrupted {
                step: self.step,
                interrupts: interrupts.clone(),
            });
            return Ok(Some(self.outcome(RunStatus::Interrupted, interrupts)));
        }

        if hit_after {
            tracing::debug!(step = self.step, "pausing after interrupt_after node");
            self.emit(StreamEvent::Interrupted { step: self.step, interrupts: vec![] });
            self.step += 1;
            return Ok(Some(self.outcome(RunStatus::Interrupted, Vec::new())));
        }

        self.step += 1;
        Ok(None)
    }

    /// Persist interrupt bookkeeping against the just-stored checkpoint:
    /// the pending interrupt, the task's frozen input snapshot, and the
    /// resume values it already consumed.
    async fn record_interrupts(
        &mut self,
        suspended: Vec<(Task, Interrupt, Vec<Value>)>,
    ) -> Result<Vec<InterruptEntry>> {
        // Re-enqueued sends occupy the queue tail; their future plan
        // positions are known now, which keys the bookkeeping.
        let queue_len = self
            .channels
            .get(TASKS_CHANNEL)
            .and_then(|c| c.get().ok())
            .and_then(|v| v.as_array().map(Vec::len))
            .unwrap_or(0);
        let push_count = suspended.iter().filter(|(t, _, _)| t.is_push()).count();
        let mut next_push_idx = queue_len.saturating_sub(push_count);

        let mut entries = Vec::new();
        for (task, interrupt, consumed) in suspended {
            let task_key = if task.is_push() {
                let key = format!("__push__:{}:{}", task.name, next_push_idx);
                next_push_idx += 1;
                key
            } else {
                task.key.clone()
            };

            let entry = InterruptEntry {
                task_key: task_key.clone(),
                interrupt,
                input: task.input.clone(),
                push: task.is_push(),
            };

            if let (Some(saver), Some(address)) = (&self.checkpointer, &self.checkpoint_config) {
                saver
                    .put_writes(
                        address,
                        vec![(INTERRUPT_CHANNEL.to_string(), entry.to_value())],
                        task_key.clone(),
                    )
                    .await?;
                if !consumed.is_empty() {
                    saver
                        .put_writes(
                            address,
                            vec![(RESUME_CHANNEL.to_string(), json!(consumed.clone()))],
                            task_key.clone(),
                        )
                        .await?;
                }
            }

            self.task_inputs.insert(task_key.clone(), task.input.clone());
            if !consumed.is_empty() {
                self.resume_map.insert(task_key.clone(), consumed);
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn execute_tasks(&self, tasks: &[Task]) -> Result<Vec<(Task, TaskRun)>> {
        let checkpointer_configured =
            self.checkpointer.is_some() && self.config.thread_id.is_some();

        let futures: Vec<_> = tasks
            .iter()
            .cloned()
            .map(|task| {
                let spec = self.def.nodes[&task.name].clone();
                let store = self.store.clone();
                let cache = self.cache.clone();
                let thread_id = self.config.thread_id.clone();
                let step = self.step;
                let emitter = self.emitter.clone();
                async move {
                    if let Some(emitter) = &emitter {
                        emitter.emit(StreamEvent::TaskStart {
                            step,
                            task: task.key.clone(),
                            node: task.name.clone(),
                        });
                    }
                    let run = run_task(
                        &spec,
                        &task,
                        store,
                        cache,
                        thread_id,
                        step,
                        checkpointer_configured,
                    )
                    .await;
                    (task, run)
                }
            })
            .collect();

        let joined = join_all(futures);
        match self.config.step_timeout {
            Some(timeout) => tokio::time::timeout(timeout, joined).await.map_err(|_| {
                GraphError::StepTimeout {
                    step: self.step as usize,
                    timeout_ms: timeout.as_millis() as u64,
                }
            }),
            None => Ok(joined.await),
        }
    }

    fn outcome(&self, status: RunStatus, interrupts: Vec<Interrupt>) -> RunOutcome {
        RunOutcome {
            status,
            output: read_output(&self.channels, &self.def.output_channels),
            interrupts,
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }

    async fn persist(
        &mut self,
        source: CheckpointSource,
        step: i64,
        force_sync: bool,
    ) -> Result<()> {
        let Some(saver) = self.checkpointer.clone() else {
            return Ok(());
        };
        let Some(address) = self.checkpoint_config.clone() else {
            return Ok(());
        };
        let metadata = CheckpointMetadata::new().with_source(source).with_step(step);
        let versions = self.checkpoint.channel_versions.clone();

        if force_sync || self.durability != Durability::Async {
            let new_config = saver
                .put(&address, self.checkpoint.clone(), metadata, versions)
                .await?;
            self.checkpoint_config = Some(new_config);
        } else {
            // Fire-and-forget: the new address is deterministic (the
            // checkpoint's own id), so bookkeeping can advance immediately.
            let checkpoint = self.checkpoint.clone();
            let spawn_address = address.clone();
            tokio::spawn(async move {
                if let Err(e) = saver.put(&spawn_address, checkpoint, metadata, versions).await {
                    tracing::error!(error = %e, "async checkpoint persistence failed");
                }
            });
            self.checkpoint_config = Some(CheckpointConfig {
                thread_id: address.thread_id,
                checkpoint_id: Some(self.checkpoint.id.clone()),
                checkpoint_ns: address.checkpoint_ns,
                extra: HashMap::new(),
            });
        }

        self.dirty = false;
        self.emit(StreamEvent::Checkpoint {
            step,
            checkpoint_id: self.checkpoint.id.clone(),
        });
        Ok(())
    }
}

/// Result of one task invocation chain (cache + retries).
enum TaskRun {
    Success { output: Value, cached: bool },
    Suspended { interrupt: Interrupt, consumed: Vec<Value> },
    Failed(GraphError),
}

async fn run_task(
    spec: &NodeSpec,
    task: &Task,
    store: Option<Arc<dyn Store>>,
    cache: Arc<TaskCache>,
    thread_id: Option<String>,
    step: i64,
    checkpointer_configured: bool,
) -> TaskRun {
    // Cache check precedes execution and consumes no retry budget.
    let cache_key = spec
        .cache_policy
        .as_ref()
        .map(|policy| (policy.key_func)(&task.input));
    if let Some(key) = &cache_key {
        if let Some(hit) = cache.get(&spec.name, key) {
            tracing::debug!(node = %spec.name, "cache hit, skipping action");
            return TaskRun::Success { output: hit, cached: true };
        }
    }

    let mut attempts = 0usize;
    loop {
        attempts += 1;
        let scope = InterruptScope::new(
            task.key.clone(),
            task.resume_values.clone(),
            checkpointer_configured,
        );
        let ctx = NodeContext::new(
            spec.name.clone(),
            thread_id.clone(),
            step,
            store.clone(),
            scope.clone(),
        );

        match spec.action.invoke(task.input.clone(), ctx).await {
            Ok(output) => {
                if attempts > 1 {
                    tracing::info!(node = %spec.name, attempts, "task succeeded after retry");
                }
                if let (Some(policy), Some(key)) = (&spec.cache_policy, &cache_key) {
                    cache.put(&spec.name, key, output.clone(), policy.ttl);
                }
                return TaskRun::Success { output, cached: false };
            }
            Err(GraphError::Interrupt(interrupt)) => {
                return TaskRun::Suspended {
                    interrupt,
                    consumed: scope.consumed(),
                };
            }
            // Suspending without a checkpointer is fatal, never retried.
            Err(err @ GraphError::Configuration(_)) => {
                return TaskRun::Failed(err);
            }
            Err(err) => match select_policy(&spec.retry_policies, &err) {
                Some(policy) if attempts < policy.max_attempts => {
                    let delay = policy.backoff_delay(attempts - 1);
                    tracing::warn!(
                        node = %spec.name,
                        attempt = attempts,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    tracing::error!(node = %spec.name, attempts, error = %err, "task failed");
                    return TaskRun::Failed(GraphError::NodeExecution {
                        node: spec.name.clone(),
                        attempts,
                        error: err.to_string(),
                    });
                }
            },
        }
    }
}

/// Map a node's output value into channel writes.
pub(crate) fn map_node_writes(spec: &NodeSpec, output: &Value) -> Result<Vec<(String, Value)>> {
    if let Some(mapper) = &spec.write_mapper {
        return Ok(mapper(output));
    }
    match output {
        Value::Null => Ok(vec![]),
        Value::Object(obj) => {
            let mut writes = Vec::new();
            let mut unmatched = Vec::new();
            for (key, value) in obj {
                if spec.writes.iter().any(|w| w == key) {
                    writes.push((key.clone(), value.clone()));
                } else {
                    unmatched.push(key.clone());
                }
            }
            if writes.is_empty() && !obj.is_empty() && spec.writes.len() == 1 {
                // Single declared channel and no key matched: the whole
                // object is the value.
                return Ok(vec![(spec.writes[0].clone(), output.clone())]);
            }
            if !unmatched.is_empty() {
                tracing::warn!(
                    node = %spec.name,
                    keys = ?unmatched,
                    "output keys without a declared write channel discarded"
                );
            }
            Ok(writes)
        }
        other => match spec.writes.len() {
            0 => Ok(vec![]),
            1 => Ok(vec![(spec.writes[0].clone(), other.clone())]),
            n => Err(GraphError::Execution(format!(
                "node '{}' returned a non-object output but declares {} write channels",
                spec.name, n
            ))),
        },
    }
}
