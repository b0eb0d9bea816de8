//! Core scheduling algorithms: planning and write application.
//!
//! Planning is version-based: a node runs when any of its trigger channels
//! carries a version newer than the one recorded for that node in
//! `versions_seen`. Write application is the superstep barrier: all of a
//! step's writes are grouped per channel and applied atomically — either
//! every channel accepts its batch or none is mutated.

use crate::error::{GraphError, Result};
use crate::graph::{is_internal_channel, NodeSpec, TASKS_CHANNEL};
use crate::superstep::io::read_node_input;
use crate::superstep::types::{path_key, PathSegment, Task, TaskWrites};
use loomgraph_checkpoint::{increment, Channel, Checkpoint, TopicChannel};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Apply one superstep's writes to the channels and update the checkpoint's
/// version bookkeeping.
///
/// Steps, in order:
/// 1. sort tasks by path for deterministic application;
/// 2. record `versions_seen` for each committed task;
/// 3. consume the trigger channels of committed tasks;
/// 4. group writes per channel and apply them atomically (clone, update,
///    install) — a failing update aborts with [`GraphError::UpdateConflict`]
///    and leaves every channel untouched;
/// 5. notify untouched channels of the step boundary (clears ephemerals);
/// 6. when `finalize` is set and no updated channel triggers any node, send
///    the finish signal (callers clear `finalize` while a suspended task is
///    still pending — the run is not over).
///
/// Returns the set of updated channel names.
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut HashMap<String, Box<dyn Channel>>,
    mut tasks: Vec<TaskWrites>,
    trigger_to_nodes: &HashMap<String, Vec<String>>,
    finalize: bool,
) -> Result<HashSet<String>> {
    tasks.sort_by_key(|t| path_key(&t.path));

    let bump_step = tasks.iter().any(|t| !t.triggers.is_empty());

    for task in &tasks {
        if task.name.starts_with("__") {
            continue;
        }
        let seen = checkpoint
            .versions_seen
            .entry(task.name.clone())
            .or_default();
        for trigger in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(trigger) {
                seen.insert(trigger.clone(), version.clone());
            }
        }
    }

    let next_version = increment(checkpoint.max_version());

    for task in &tasks {
        for trigger in &task.triggers {
            if let Some(channel) = channels.get_mut(trigger) {
                if channel.consume() {
                    checkpoint
                        .channel_versions
                        .insert(trigger.clone(), next_version.clone());
                }
            }
        }
    }

    // BTreeMap gives a deterministic application order across channels.
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for task in &tasks {
        for (channel, value) in &task.writes {
            if !channels.contains_key(channel) {
                tracing::warn!(channel = %channel, task = %task.name, "write to unknown channel discarded");
                continue;
            }
            grouped.entry(channel.clone()).or_default().push(value.clone());
        }
    }

    // Atomic commit: update clones first, install only if every batch is
    // accepted.
    let mut staged: Vec<(String, Box<dyn Channel>, bool)> = Vec::new();
    for (name, values) in grouped {
        let channel = channels
            .get(&name)
            .expect("grouped writes only reference existing channels");
        let mut clone = channel.clone_box();
        match clone.update(values) {
            Ok(changed) => staged.push((name, clone, changed)),
            Err(source) => {
                return Err(GraphError::UpdateConflict { channel: name, source });
            }
        }
    }

    let mut updated = HashSet::new();
    for (name, clone, changed) in staged {
        if changed {
            checkpoint
                .channel_versions
                .insert(name.clone(), next_version.clone());
            if clone.is_available() {
                updated.insert(name.clone());
            }
        }
        channels.insert(name, clone);
    }

    // Step boundary: untouched channels get an empty batch, which is how
    // ephemeral values expire.
    if bump_step {
        for (name, channel) in channels.iter_mut() {
            if updated.contains(name) {
                continue;
            }
            if channel.update(vec![]).unwrap_or(false) {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), next_version.clone());
                if channel.is_available() {
                    updated.insert(name.clone());
                }
            }
        }

        // Tentatively the last superstep: nothing updated triggers a node
        // and no dynamically dispatched sends are queued.
        let triggers_any = updated.iter().any(|chan| {
            chan == TASKS_CHANNEL
                || trigger_to_nodes.get(chan).is_some_and(|n| !n.is_empty())
        });
        if finalize && !triggers_any {
            for (name, channel) in channels.iter_mut() {
                if channel.finish() {
                    checkpoint
                        .channel_versions
                        .insert(name.clone(), next_version.clone());
                    if channel.is_available() {
                        updated.insert(name.clone());
                    }
                }
            }
        }
    }

    checkpoint.updated_channels = Some({
        let mut list: Vec<_> = updated.iter().cloned().collect();
        list.sort();
        list
    });

    Ok(updated)
}

/// Refresh `checkpoint.channel_values` from the live channels.
///
/// Channels that persist nothing (untracked, empty) are removed from the
/// snapshot.
pub fn sync_channel_values(
    checkpoint: &mut Checkpoint,
    channels: &HashMap<String, Box<dyn Channel>>,
) -> Result<()> {
    for (name, channel) in channels {
        match channel.checkpoint()? {
            Some(snapshot) => {
                checkpoint.channel_values.insert(name.clone(), snapshot);
            }
            None => {
                checkpoint.channel_values.remove(name);
            }
        }
    }
    Ok(())
}

/// Compute the tasks for the next superstep.
///
/// Trigger-matched tasks come from version comparison; pushed tasks are
/// drained from the send queue, one task per payload, identified by
/// `(node, position)`. Stored inputs (`task_inputs`, persisted when a task
/// suspends) take precedence over re-reading channels so a resumed task sees
/// exactly the snapshot it first ran with.
#[allow(clippy::too_many_arguments)]
pub fn prepare_next_tasks(
    checkpoint: &Checkpoint,
    nodes: &HashMap<String, NodeSpec>,
    channels: &mut HashMap<String, Box<dyn Channel>>,
    input_channels: &[String],
    updated_channels: Option<&HashSet<String>>,
    trigger_to_nodes: &HashMap<String, Vec<String>>,
    resume_map: &HashMap<String, Vec<Value>>,
    task_inputs: &HashMap<String, Value>,
) -> Result<Vec<Task>> {
    let null_version = checkpoint.null_version();
    let mut tasks = Vec::new();

    let mut candidates: Vec<String> = match updated_channels {
        Some(updated) if !trigger_to_nodes.is_empty() => {
            let mut set = HashSet::new();
            for chan in updated {
                if let Some(names) = trigger_to_nodes.get(chan) {
                    set.extend(names.iter().cloned());
                }
            }
            // Tasks with interrupt/resume bookkeeping must be re-planned
            // even when their trigger channel was not part of the last
            // step's updates (e.g. an ephemeral trigger cleared at the
            // boundary after the task suspended).
            for key in task_inputs.keys().chain(resume_map.keys()) {
                if !key.starts_with("__push__") {
                    set.insert(key.clone());
                }
            }
            set.into_iter().collect()
        }
        _ => nodes.keys().cloned().collect(),
    };
    candidates.sort();

    for name in candidates {
        let Some(spec) = nodes.get(&name) else {
            continue;
        };
        let seen = checkpoint.versions_seen.get(&name);
        let triggered = spec.triggers.iter().any(|chan| {
            let current = checkpoint.channel_versions.get(chan).unwrap_or(&null_version);
            let last_seen = seen
                .and_then(|s| s.get(chan))
                .unwrap_or(&null_version);
            current > last_seen
        });
        if !triggered {
            continue;
        }

        // A version bump caused by consumption or boundary clearing alone
        // must not re-run the node: a freshly triggered task needs data —
        // an available trigger channel or a frozen input snapshot.
        let has_data = task_inputs.contains_key(&name)
            || spec
                .triggers
                .iter()
                .any(|c| channels.get(c).is_some_and(|ch| ch.is_available()));
        if !has_data {
            continue;
        }

        let input = match task_inputs.get(&name) {
            Some(stored) => stored.clone(),
            None => read_node_input(channels, &effective_reads(spec, input_channels)),
        };

        tasks.push(Task {
            key: name.clone(),
            name: name.clone(),
            input,
            path: vec![PathSegment::Str(name.clone())],
            triggers: spec.triggers.clone(),
            resume_values: resume_map.get(&name).cloned().unwrap_or_default(),
            attempt: 0,
        });
    }

    // Drain dynamically dispatched sends. The queue is emptied first so the
    // channel map is free for input reads below; pending sends live on in
    // the previous checkpoint.
    let queued_sends: Vec<Value> = match channels.get_mut(TASKS_CHANNEL) {
        Some(queue) => match queue.get() {
            Ok(Value::Array(sends)) if !sends.is_empty() => {
                *queue = Box::new(TopicChannel::new());
                sends
            }
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    for (idx, send_value) in queued_sends.iter().enumerate() {
        let send: crate::command::Send =
            serde_json::from_value(send_value.clone()).map_err(|e| {
                GraphError::Execution(format!("malformed send in task queue: {}", e))
            })?;
        let Some(spec) = nodes.get(&send.node) else {
            return Err(GraphError::Execution(format!(
                "send targets unknown node '{}'",
                send.node
            )));
        };

        let key = format!("__push__:{}:{}", send.node, idx);
        let input = match task_inputs.get(&key) {
            Some(stored) => stored.clone(),
            None if send.arg.is_null() => {
                read_node_input(channels, &effective_reads(spec, input_channels))
            }
            None => send.arg.clone(),
        };

        tasks.push(Task {
            key: key.clone(),
            name: send.node.clone(),
            input,
            path: vec![
                PathSegment::Str("__push__".into()),
                PathSegment::Str(send.node.clone()),
                PathSegment::Index(idx),
            ],
            triggers: vec![],
            resume_values: resume_map.get(&key).cloned().unwrap_or_default(),
            attempt: 0,
        });
    }

    tasks.sort_by_key(|t| path_key(&t.path));
    Ok(tasks)
}

fn effective_reads(spec: &NodeSpec, input_channels: &[String]) -> Vec<String> {
    if !spec.reads.is_empty() {
        return spec.reads.clone();
    }
    let from_triggers: Vec<String> = spec
        .triggers
        .iter()
        .filter(|t| !is_internal_channel(t))
        .cloned()
        .collect();
    if !from_triggers.is_empty() {
        return from_triggers;
    }
    input_channels.to_vec()
}

/// Node names that would run next, computed from a checkpoint.
///
/// Used for state inspection; mirrors the trigger half of
/// [`prepare_next_tasks`] (version comparison plus the data-availability
/// gate, supplied as a predicate over channel names) plus queued sends.
pub fn next_task_names<F>(
    checkpoint: &Checkpoint,
    nodes: &HashMap<String, NodeSpec>,
    channel_available: F,
) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let null_version = checkpoint.null_version();
    let mut names: Vec<String> = nodes
        .iter()
        .filter(|(name, spec)| {
            let seen = checkpoint.versions_seen.get(*name);
            let triggered = spec.triggers.iter().any(|chan| {
                let current = checkpoint.channel_versions.get(chan).unwrap_or(&null_version);
                let last_seen = seen.and_then(|s| s.get(chan)).unwrap_or(&null_version);
                current > last_seen
            });
            triggered && spec.triggers.iter().any(|chan| channel_available(chan))
        })
        .map(|(name, _)| name.clone())
        .collect();

    if let Some(Value::Array(sends)) = checkpoint.channel_values.get(TASKS_CHANNEL) {
        for send_value in sends {
            if let Some(node) = send_value.get("node").and_then(Value::as_str) {
                names.push(node.to_string());
            }
        }
    }

    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomgraph_checkpoint::{ChannelVersion, LastValueChannel};
    use serde_json::json;

    struct NoopAction;

    impl crate::graph::Action for NoopAction {
        fn invoke(
            &self,
            _input: Value,
            _ctx: crate::context::NodeContext,
        ) -> crate::graph::ActionFuture<'_> {
            Box::pin(async { Ok(json!({})) })
        }
    }

    fn make_spec(name: &str, triggers: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            triggers: triggers.iter().map(|s| s.to_string()).collect(),
            reads: vec![],
            writes: vec![],
            action: std::sync::Arc::new(NoopAction),
            write_mapper: None,
            retry_policies: vec![],
            cache_policy: None,
            tags: vec![],
            edge_writes: vec![],
        }
    }

    fn last_value_channels(names: &[&str]) -> HashMap<String, Box<dyn Channel>> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Box::new(LastValueChannel::new()) as Box<dyn Channel>,
                )
            })
            .collect()
    }

    #[test]
    fn apply_writes_updates_channel_and_version() {
        let mut checkpoint = Checkpoint::new();
        let mut channels = last_value_channels(&["state"]);
        let writes = vec![TaskWrites {
            path: vec![PathSegment::Str("a".into())],
            name: "a".into(),
            triggers: vec![],
            writes: vec![("state".into(), json!(42))],
        }];

        let updated =
            apply_writes(&mut checkpoint, &mut channels, writes, &HashMap::new(), true).unwrap();
        assert!(updated.contains("state"));
        assert_eq!(channels["state"].get().unwrap(), json!(42));
        assert_eq!(
            checkpoint.channel_versions["state"],
            ChannelVersion::Int(1)
        );
    }

    #[test]
    fn conflicting_writes_abort_without_partial_commit() {
        let mut checkpoint = Checkpoint::new();
        // "aaa" sorts before "state": without atomic staging it would be
        // committed before the conflict on "state" is discovered.
        let mut channels = last_value_channels(&["aaa", "state"]);

        let writes = vec![
            TaskWrites {
                path: vec![PathSegment::Str("t1".into())],
                name: "t1".into(),
                triggers: vec![],
                writes: vec![("aaa".into(), json!(1)), ("state".into(), json!(5))],
            },
            TaskWrites {
                path: vec![PathSegment::Str("t2".into())],
                name: "t2".into(),
                triggers: vec![],
                writes: vec![("state".into(), json!(10))],
            },
        ];

        let err = apply_writes(&mut checkpoint, &mut channels, writes, &HashMap::new(), true)
            .unwrap_err();
        match err {
            GraphError::UpdateConflict { channel, .. } => assert_eq!(channel, "state"),
            other => panic!("expected UpdateConflict, got {}", other),
        }
        // Nothing was applied anywhere.
        assert!(!channels["aaa"].is_available());
        assert!(!channels["state"].is_available());
        assert!(checkpoint.channel_versions.is_empty());
    }

    #[test]
    fn single_writer_to_last_value_succeeds() {
        let mut checkpoint = Checkpoint::new();
        let mut channels = last_value_channels(&["state"]);
        let writes = vec![TaskWrites {
            path: vec![PathSegment::Str("t".into())],
            name: "t".into(),
            triggers: vec![],
            writes: vec![("state".into(), json!(10))],
        }];
        apply_writes(&mut checkpoint, &mut channels, writes, &HashMap::new(), true).unwrap();
        assert_eq!(channels["state"].get().unwrap(), json!(10));
    }

    #[test]
    fn versions_seen_recorded_for_committed_tasks() {
        let mut checkpoint = Checkpoint::new();
        checkpoint
            .channel_versions
            .insert("input".into(), ChannelVersion::Int(3));
        let mut channels = last_value_channels(&["input", "out"]);

        let writes = vec![TaskWrites {
            path: vec![PathSegment::Str("a".into())],
            name: "a".into(),
            triggers: vec!["input".into()],
            writes: vec![("out".into(), json!(1))],
        }];
        apply_writes(&mut checkpoint, &mut channels, writes, &HashMap::new(), true).unwrap();

        assert_eq!(
            checkpoint.versions_seen["a"]["input"],
            ChannelVersion::Int(3)
        );
    }

    #[test]
    fn planning_triggers_on_newer_version_only() {
        let mut checkpoint = Checkpoint::new();
        checkpoint
            .channel_versions
            .insert("input".into(), ChannelVersion::Int(1));

        let mut channels = last_value_channels(&["input"]);
        channels
            .get_mut("input")
            .unwrap()
            .update(vec![json!("data")])
            .unwrap();

        let mut nodes = HashMap::new();
        nodes.insert("proc".to_string(), make_spec("proc", &["input"]));

        let tasks = prepare_next_tasks(
            &checkpoint,
            &nodes,
            &mut channels,
            &["input".to_string()],
            None,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "proc");
        assert_eq!(tasks[0].input, json!("data"));

        // Mark the version as seen: no longer triggers.
        checkpoint.versions_seen.insert(
            "proc".into(),
            [("input".to_string(), ChannelVersion::Int(1))].into_iter().collect(),
        );
        let tasks = prepare_next_tasks(
            &checkpoint,
            &nodes,
            &mut channels,
            &["input".to_string()],
            None,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn stored_task_input_wins_over_channel_read() {
        let mut checkpoint = Checkpoint::new();
        checkpoint
            .channel_versions
            .insert("input".into(), ChannelVersion::Int(1));
        let mut channels = last_value_channels(&["input"]);
        channels
            .get_mut("input")
            .unwrap()
            .update(vec![json!("current")])
            .unwrap();

        let mut nodes = HashMap::new();
        nodes.insert("proc".to_string(), make_spec("proc", &["input"]));

        let mut task_inputs = HashMap::new();
        task_inputs.insert("proc".to_string(), json!("frozen"));

        let tasks = prepare_next_tasks(
            &checkpoint,
            &nodes,
            &mut channels,
            &["input".to_string()],
            None,
            &HashMap::new(),
            &HashMap::new(),
            &task_inputs,
        )
        .unwrap();
        assert_eq!(tasks[0].input, json!("frozen"));
    }

    #[test]
    fn sends_drain_into_push_tasks() {
        let checkpoint = Checkpoint::new();
        let mut channels: HashMap<String, Box<dyn Channel>> = HashMap::new();
        let mut queue = TopicChannel::new();
        queue
            .update(vec![
                serde_json::to_value(crate::command::Send::new("worker", json!({"i": 0}))).unwrap(),
                serde_json::to_value(crate::command::Send::new("worker", json!({"i": 1}))).unwrap(),
            ])
            .unwrap();
        channels.insert(TASKS_CHANNEL.to_string(), Box::new(queue));

        let mut nodes = HashMap::new();
        nodes.insert("worker".to_string(), make_spec("worker", &["input"]));

        let tasks = prepare_next_tasks(
            &checkpoint,
            &nodes,
            &mut channels,
            &[],
            None,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.is_push()));
        assert_eq!(tasks[0].key, "__push__:worker:0");
        assert_eq!(tasks[0].input, json!({"i": 0}));
        assert_eq!(tasks[1].input, json!({"i": 1}));

        // Queue drained.
        assert_eq!(
            channels[TASKS_CHANNEL].get().unwrap(),
            json!([])
        );
    }

    #[test]
    fn send_to_unknown_node_fails() {
        let checkpoint = Checkpoint::new();
        let mut channels: HashMap<String, Box<dyn Channel>> = HashMap::new();
        let mut queue = TopicChannel::new();
        queue
            .update(vec![serde_json::to_value(crate::command::Send::new("ghost", json!(1))).unwrap()])
            .unwrap();
        channels.insert(TASKS_CHANNEL.to_string(), Box::new(queue));

        let err = prepare_next_tasks(
            &checkpoint,
            &HashMap::new(),
            &mut channels,
            &[],
            None,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn next_task_names_from_checkpoint() {
        let mut checkpoint = Checkpoint::new();
        checkpoint
            .channel_versions
            .insert("input".into(), ChannelVersion::Int(2));
        let mut nodes = HashMap::new();
        nodes.insert("a".to_string(), make_spec("a", &["input"]));
        nodes.insert("b".to_string(), make_spec("b", &["other"]));

        assert_eq!(
            next_task_names(&checkpoint, &nodes, |_| true),
            vec!["a".to_string()]
        );
        // Gated when the trigger channel holds no data.
        assert!(next_task_names(&checkpoint, &nodes, |_| false).is_empty());
    }
}
