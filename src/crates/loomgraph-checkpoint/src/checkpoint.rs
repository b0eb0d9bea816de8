//! Checkpoint data model: versions, snapshots, metadata, and identity.
//!
//! A checkpoint is an immutable snapshot of every persistable channel plus
//! the version bookkeeping the scheduler needs to decide which nodes run
//! next. Checkpoints within a thread form a tree: each one records its
//! parent, and forking from a historical checkpoint starts a new branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint identifier, lexically and temporally orderable within a thread.
pub type CheckpointId = String;

/// Version of a single channel.
///
/// Versions only ever increase. Comparison across variants is by variant
/// rank (Int < Float < String) so a mixed map still has a total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

impl ChannelVersion {
    fn rank(&self) -> u8 {
        match self {
            ChannelVersion::Int(_) => 0,
            ChannelVersion::Float(_) => 1,
            ChannelVersion::String(_) => 2,
        }
    }
}

impl PartialEq for ChannelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChannelVersion {}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::Float(a), ChannelVersion::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (ChannelVersion::String(a), ChannelVersion::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Default for ChannelVersion {
    fn default() -> Self {
        ChannelVersion::Int(0)
    }
}

/// Increment a version by one unit; `None` yields the first version.
pub fn increment(current: Option<&ChannelVersion>) -> ChannelVersion {
    match current {
        Some(ChannelVersion::Int(v)) => ChannelVersion::Int(v + 1),
        Some(ChannelVersion::Float(v)) => ChannelVersion::Float(v + 1.0),
        Some(ChannelVersion::String(v)) => match v.parse::<i64>() {
            Ok(n) => ChannelVersion::String((n + 1).to_string()),
            Err(_) => ChannelVersion::String(format!("{}.1", v)),
        },
        None => ChannelVersion::Int(1),
    }
}

/// Mapping of channel name to version.
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written when a run's input is first applied
    Input,
    /// Written at the end of a superstep
    Loop,
    /// Written by an external state update
    Update,
    /// Written as a copy of another checkpoint
    Fork,
}

/// Metadata stored alongside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// Origin of this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Superstep number; -1 for the input checkpoint, 0 for the first loop
    /// checkpoint, and so on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Parent checkpoint ids by namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, CheckpointId>>,

    /// Additional caller-supplied metadata, flattened into the record
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_parents(mut self, parents: HashMap<String, CheckpointId>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Snapshot of all persistable channel state at one superstep boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version
    pub v: i32,

    /// Unique, sortable identifier
    pub id: CheckpointId,

    /// Creation timestamp
    pub ts: DateTime<Utc>,

    /// Channel name → serialized channel snapshot. Channels whose kind is
    /// excluded from persistence never appear here.
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Channel name → current version
    pub channel_versions: ChannelVersions,

    /// Node name → channel name → version that node last processed. A node
    /// runs when any of its trigger channels is newer than what it has seen.
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Channels updated by the step that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    pub const FORMAT_VERSION: i32 = 1;

    /// Create an empty checkpoint with a fresh sortable id.
    pub fn new() -> Self {
        Self {
            v: Self::FORMAT_VERSION,
            id: sortable_id(),
            ts: Utc::now(),
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            updated_channels: None,
        }
    }

    /// Copy this checkpoint under a fresh id and timestamp, keeping all
    /// channel state and version bookkeeping.
    pub fn next(&self) -> Self {
        Self {
            v: self.v,
            id: sortable_id(),
            ts: Utc::now(),
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            updated_channels: self.updated_channels.clone(),
        }
    }

    /// The zero version matching the variant in use by this checkpoint.
    pub fn null_version(&self) -> ChannelVersion {
        match self.channel_versions.values().next() {
            Some(ChannelVersion::Float(_)) => ChannelVersion::Float(0.0),
            Some(ChannelVersion::String(_)) => ChannelVersion::String(String::new()),
            _ => ChannelVersion::Int(0),
        }
    }

    /// Highest version currently assigned to any channel.
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions.values().max()
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a checkpoint id that sorts lexically in creation order.
///
/// The zero-padded microsecond prefix carries the ordering across processes;
/// a process-local sequence keeps ids created within the same microsecond in
/// creation order; the uuid suffix makes ids globally unique.
pub fn sortable_id() -> CheckpointId {
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let micros = Utc::now().timestamp_micros().max(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % 1_000_000;
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{:020}-{:06}-{}", micros, seq, &suffix[..8])
}

/// A buffered task write not yet committed to its channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// Task that produced the write
    pub task_id: String,
    /// Destination channel
    pub channel: String,
    /// Value to combine via the channel's update policy
    pub value: serde_json::Value,
}

impl PendingWrite {
    pub fn new(task_id: impl Into<String>, channel: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Addresses a checkpoint (or the latest one) within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Default::default()
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(ns.into());
        self
    }
}

/// A checkpoint together with its address, metadata, lineage, and any
/// uncommitted writes recorded against it.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    pub fn new(config: CheckpointConfig, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    pub fn with_parent_config(mut self, parent: CheckpointConfig) -> Self {
        self.parent_config = Some(parent);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(ChannelVersion::Int(1) < ChannelVersion::Int(2));
        assert!(ChannelVersion::Float(1.5) < ChannelVersion::Float(2.0));
        assert!(ChannelVersion::String("a".into()) < ChannelVersion::String("b".into()));
        // Cross-variant comparison falls back to variant rank.
        assert!(ChannelVersion::Int(99) < ChannelVersion::Float(0.0));
    }

    #[test]
    fn version_increment() {
        assert_eq!(increment(None), ChannelVersion::Int(1));
        assert_eq!(increment(Some(&ChannelVersion::Int(5))), ChannelVersion::Int(6));
        assert_eq!(
            increment(Some(&ChannelVersion::Float(1.5))),
            ChannelVersion::Float(2.5)
        );
        assert_eq!(
            increment(Some(&ChannelVersion::String("7".into()))),
            ChannelVersion::String("8".into())
        );
    }

    #[test]
    fn sortable_ids_are_ordered() {
        let a = sortable_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = sortable_id();
        assert!(a < b, "{} should sort before {}", a, b);
    }

    #[test]
    fn checkpoint_next_keeps_state_fresh_id() {
        let mut cp = Checkpoint::new();
        cp.channel_versions
            .insert("state".into(), ChannelVersion::Int(3));
        cp.channel_values
            .insert("state".into(), serde_json::json!({"k": 1}));

        let next = cp.next();
        assert_ne!(next.id, cp.id);
        assert_eq!(next.channel_versions, cp.channel_versions);
        assert_eq!(next.channel_values, cp.channel_values);
    }

    #[test]
    fn metadata_builder() {
        let meta = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_step(-1)
            .with_extra("run", serde_json::json!("r1"));
        assert_eq!(meta.source, Some(CheckpointSource::Input));
        assert_eq!(meta.step, Some(-1));
        assert_eq!(meta.extra["run"], serde_json::json!("r1"));
    }

    #[test]
    fn checkpoint_serde_round_trip() {
        let mut cp = Checkpoint::new();
        cp.channel_values
            .insert("items".into(), serde_json::json!(["x", "y"]));
        cp.channel_versions
            .insert("items".into(), ChannelVersion::Int(2));

        let json = serde_json::to_string(&cp).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, cp.id);
        assert_eq!(restored.channel_values, cp.channel_values);
        assert_eq!(restored.channel_versions, cp.channel_versions);
    }
}
