//! Durable file-backed checkpoint storage.
//!
//! One JSON file per checkpoint at `<root>/<thread_id>/<checkpoint_id>.json`,
//! with pending writes in a `<checkpoint_id>.writes.json` sidecar. Because
//! checkpoint ids sort lexically in creation order, directory listings give
//! history ordering for free. Suitable for single-process deployments that
//! must survive restarts; heavier backends implement
//! [`CheckpointSaver`] against their own store.

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    PendingWrite,
};
use crate::error::{CheckpointError, Result};
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::traits::{CheckpointSaver, CheckpointStream};
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const CHECKPOINT_EXT: &str = "json";
const WRITES_SUFFIX: &str = ".writes.json";

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_checkpoint_id: Option<String>,
    checkpoint_ns: Option<String>,
}

/// Checkpoint saver persisting to a directory tree.
pub struct FileSaver {
    root: PathBuf,
    serializer: JsonSerializer,
    // Serializes writers per process; cross-file consistency within a thread
    // directory is all this backend promises.
    write_lock: Mutex<()>,
}

impl FileSaver {
    /// Create a saver rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            serializer: JsonSerializer::new(),
            write_lock: Mutex::new(()),
        })
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(thread_id)
    }

    fn checkpoint_path(&self, thread_id: &str, checkpoint_id: &str) -> PathBuf {
        self.thread_dir(thread_id)
            .join(format!("{}.{}", checkpoint_id, CHECKPOINT_EXT))
    }

    fn writes_path(&self, thread_id: &str, checkpoint_id: &str) -> PathBuf {
        self.thread_dir(thread_id)
            .join(format!("{}{}", checkpoint_id, WRITES_SUFFIX))
    }

    async fn read_record(&self, path: &Path) -> Result<Record> {
        let bytes = fs::read(path).await?;
        self.serializer.loads(&bytes)
    }

    async fn read_writes(&self, thread_id: &str, checkpoint_id: &str) -> Result<Vec<PendingWrite>> {
        let path = self.writes_path(thread_id, checkpoint_id);
        match fs::read(&path).await {
            Ok(bytes) => self.serializer.loads(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_tuple(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<CheckpointTuple>> {
        let path = self.checkpoint_path(thread_id, checkpoint_id);
        let record = match self.read_record(&path).await {
            Ok(record) => record,
            Err(CheckpointError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let pending_writes = self.read_writes(thread_id, checkpoint_id).await?;
        Ok(Some(record_to_tuple(thread_id, record, pending_writes)))
    }

    /// Checkpoint ids for a thread, ascending.
    async fn checkpoint_ids(&self, thread_id: &str) -> Result<Vec<String>> {
        let dir = self.thread_dir(thread_id);
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(WRITES_SUFFIX) {
                continue;
            }
            if let Some(id) = name.strip_suffix(&format!(".{}", CHECKPOINT_EXT)) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn thread_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl std::fmt::Debug for FileSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSaver").field("root", &self.root).finish()
    }
}

fn record_to_tuple(thread_id: &str, record: Record, pending_writes: Vec<PendingWrite>) -> CheckpointTuple {
    let config = CheckpointConfig {
        thread_id: Some(thread_id.to_string()),
        checkpoint_id: Some(record.checkpoint.id.clone()),
        checkpoint_ns: record.checkpoint_ns.clone(),
        extra: HashMap::new(),
    };
    let parent_config = record.parent_checkpoint_id.map(|id| CheckpointConfig {
        thread_id: Some(thread_id.to_string()),
        checkpoint_id: Some(id),
        checkpoint_ns: record.checkpoint_ns.clone(),
        extra: HashMap::new(),
    });
    CheckpointTuple {
        config,
        checkpoint: record.checkpoint,
        metadata: record.metadata,
        parent_config,
        pending_writes,
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
impl CheckpointSaver for FileSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = require_thread_id(config)?;
        match &config.checkpoint_id {
            Some(id) => self.load_tuple(thread_id, id).await,
            None => {
                let ids = self.checkpoint_ids(thread_id).await?;
                match ids.last() {
                    Some(latest) => self.load_tuple(thread_id, latest).await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let thread_ids = match config.and_then(|c| c.thread_id.clone()) {
            Some(thread_id) => vec![thread_id],
            None => self.thread_ids().await?,
        };
        let before_id = before.and_then(|c| c.checkpoint_id.clone());

        let mut results = Vec::new();
        'outer: for thread_id in thread_ids {
            let mut ids = self.checkpoint_ids(&thread_id).await?;
            ids.reverse();
            for id in ids {
                if let Some(before_id) = &before_id {
                    if id >= *before_id {
                        continue;
                    }
                }
                let Some(tuple) = self.load_tuple(&thread_id, &id).await? else {
                    continue;
                };
                if let Some(filter) = &filter {
                    if !metadata_matches(&tuple.metadata, filter) {
                        continue;
                    }
                }
                results.push(Ok(tuple));
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
        let checkpoint_id = checkpoint.id.clone();

        let record = Record {
            checkpoint,
            metadata,
            parent_checkpoint_id: config.checkpoint_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
        };
        let bytes = self.serializer.dumps(&record)?;

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.thread_dir(&thread_id)).await?;
        fs::write(self.checkpoint_path(&thread_id, &checkpoint_id), bytes).await?;

        Ok(CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint_id),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: HashMap::new(),
        })
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

        let _guard = self.write_lock.lock().await;
        if !fs::try_exists(self.checkpoint_path(&thread_id, &checkpoint_id)).await? {
            return Err(CheckpointError::NotFound(checkpoint_id));
        }

        let mut existing = self.read_writes(&thread_id, &checkpoint_id).await?;
        for (channel, value) in writes {
            match existing
                .iter_mut()
                .find(|w| w.task_id == task_id && w.channel == channel)
            {
                Some(write) => write.value = value,
                None => existing.push(PendingWrite::new(task_id.clone(), channel, value)),
            }
        }
        let bytes = self.serializer.dumps(&existing)?;
        fs::write(self.writes_path(&thread_id, &checkpoint_id), bytes).await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let dir = self.thread_dir(thread_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn saver() -> (tempfile::TempDir, FileSaver) {
        let dir = tempfile::tempdir().unwrap();
        let saver = FileSaver::new(dir.path()).await.unwrap();
        (dir, saver)
    }

    #[tokio::test]
    async fn round_trip_survives_reopen() {
        let (dir, saver) = saver().await;
        let config = CheckpointConfig::new("t1");

        let mut checkpoint = Checkpoint::new();
        checkpoint
            .channel_values
            .insert("items".into(), serde_json::json!(["x"]));
        let id = checkpoint.id.clone();

        saver
            .put(
                &config,
                checkpoint,
                CheckpointMetadata::new().with_step(0),
                HashMap::new(),
            )
            .await
            .unwrap();
        drop(saver);

        // A new saver over the same directory sees the data.
        let reopened = FileSaver::new(dir.path()).await.unwrap();
        let tuple = reopened.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, id);
        assert_eq!(
            tuple.checkpoint.channel_values["items"],
            serde_json::json!(["x"])
        );
    }

    #[tokio::test]
    async fn latest_and_list_order() {
        let (_dir, saver) = saver().await;
        let config = CheckpointConfig::new("t1");
        let mut last_id = String::new();
        for step in 0..3 {
            let cp = Checkpoint::new();
            last_id = cp.id.clone();
            saver
                .put(
                    &config,
                    cp,
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let latest = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, last_id);

        let stream = saver.list(Some(&config), None, None, Some(2)).await.unwrap();
        let tuples: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].metadata.step, Some(2));
        assert_eq!(tuples[1].metadata.step, Some(1));
    }

    #[tokio::test]
    async fn parent_linkage() {
        let (_dir, saver) = saver().await;
        let config = CheckpointConfig::new("t1");
        let first = saver
            .put(&config, Checkpoint::new(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        let second = saver
            .put(&first, Checkpoint::new(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let tuple = saver.get_tuple(&second).await.unwrap().unwrap();
        assert_eq!(
            tuple.parent_config.unwrap().checkpoint_id,
            first.checkpoint_id
        );
    }

    #[tokio::test]
    async fn pending_writes_round_trip() {
        let (_dir, saver) = saver().await;
        let config = CheckpointConfig::new("t1");
        let saved = saver
            .put(&config, Checkpoint::new(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        saver
            .put_writes(
                &saved,
                vec![("__interrupt__".into(), serde_json::json!({"v": 1}))],
                "task-1".into(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].channel, "__interrupt__");
    }

    #[tokio::test]
    async fn delete_thread_removes_files() {
        let (_dir, saver) = saver().await;
        let config = CheckpointConfig::new("t1");
        saver
            .put(&config, Checkpoint::new(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        saver.delete_thread("t1").await.unwrap();
        assert!(saver.get_tuple(&config).await.unwrap().is_none());
    }
}
