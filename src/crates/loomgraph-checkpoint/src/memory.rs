//! In-memory checkpoint storage for development and tests.
//!
//! Reference implementation of [`CheckpointSaver`]: every checkpoint lives in
//! a `HashMap` behind a tokio `RwLock`, entries appended per thread in
//! creation order. Nothing survives a process restart — use
//! [`FileSaver`](crate::file::FileSaver) or a custom backend for durability.

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    PendingWrite,
};
use crate::error::{CheckpointError, Result};
use crate::traits::{CheckpointSaver, CheckpointStream};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

impl Entry {
    fn to_tuple(&self) -> CheckpointTuple {
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
            pending_writes: self.writes.clone(),
        }
    }
}

/// Thread-safe in-memory checkpoint saver.
#[derive(Debug, Clone, Default)]
pub struct MemorySaver {
    storage: Arc<RwLock<HashMap<String, Vec<Entry>>>>,
}

impl MemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one checkpoint.
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total checkpoints across all threads.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    /// Drop everything; handy between tests.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

fn require_thread_id(config: &CheckpointConfig) -> Result<&str> {
    config
        .thread_id
        .as_deref()
        .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
}

fn metadata_matches(metadata: &CheckpointMetadata, filter: &HashMap<String, serde_json::Value>) -> bool {
    filter.iter().all(|(key, expected)| match key.as_str() {
        "step" => metadata.step.map(serde_json::Value::from).as_ref() == Some(expected),
        "source" => {
            metadata.source.and_then(|s| serde_json::to_value(s).ok()).as_ref() == Some(expected)
        }
        _ => metadata.extra.get(key) == Some(expected),
    })
}

#[async_trait]
impl CheckpointSaver for MemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let storage = self.storage.read().await;
        let thread_id = require_thread_id(config)?;

        let Some(entries) = storage.get(thread_id) else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(id) => entries.iter().find(|e| &e.checkpoint.id == id),
            None => entries.last(),
        };
        Ok(entry.map(Entry::to_tuple))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let mut thread_ids: Vec<String> = match config.and_then(|c| c.thread_id.clone()) {
            Some(thread_id) => vec![thread_id],
            None => storage.keys().cloned().collect(),
        };
        thread_ids.sort();

        let before_id = before.and_then(|c| c.checkpoint_id.clone());
        let mut results = Vec::new();

        'outer: for thread_id in thread_ids {
            let Some(entries) = storage.get(&thread_id) else {
                continue;
            };
            for entry in entries.iter().rev() {
                if let Some(before_id) = &before_id {
                    if entry.checkpoint.id >= *before_id {
                        continue;
                    }
                }
                if let Some(filter) = &filter {
                    if !metadata_matches(&entry.metadata, filter) {
                        continue;
                    }
                }
                results.push(Ok(entry.to_tuple()));
                if limit.is_some_and(|lim| results.len() >= lim) {
                    break 'outer;
                }
            }
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = require_thread_id(config)?.to_string();
        let mut storage = self.storage.write().await;
        let entries = storage.entry(thread_id.clone()).or_default();

        let stored_config = CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: HashMap::new(),
        };

        // A checkpoint_id on the incoming config names the parent.
        let parent_config = config.checkpoint_id.as_ref().map(|_| config.clone());

        entries.push(Entry {
            checkpoint,
            metadata,
            config: stored_config.clone(),
            parent_config,
            writes: Vec::new(),
        });

        Ok(stored_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = require_thread_id(config)?.to_string();
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&thread_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.checkpoint.id == checkpoint_id))
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        for (channel, value) in writes {
            // Same (task, channel) replaces: interrupt/resume cycles rewrite
            // their bookkeeping instead of accumulating stale copies.
            match entry
                .writes
                .iter_mut()
                .find(|w| w.task_id == task_id && w.channel == channel)
            {
                Some(existing) => existing.value = value,
                None => entry
                    .writes
                    .push(PendingWrite::new(task_id.clone(), channel, value)),
            }
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}
