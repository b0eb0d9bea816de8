//! The [`CheckpointSaver`] trait — the pluggable durable-storage boundary.
//!
//! The engine persists one checkpoint row per `(thread_id, checkpoint_id)`
//! and never mutates a stored checkpoint. Backends must serialize concurrent
//! append/read for the same thread id; different threads are independent
//! histories. Two adapters ship with this crate ([`MemorySaver`] and
//! [`FileSaver`]); anything else — SQL, Redis, object storage — implements
//! this trait downstream.
//!
//! ```text
//!  scheduler ──put()──────────────▶ ┌──────────────────┐
//!            ──put_writes()──────▶ │ CheckpointSaver   │──▶ backing store
//!            ◀─get_tuple()/list()─ └──────────────────┘
//! ```
//!
//! [`MemorySaver`]: crate::memory::MemorySaver
//! [`FileSaver`]: crate::file::FileSaver

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Async stream of checkpoint tuples, newest first.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Storage backend for checkpoints and their pending writes.
///
/// Implementations must be `Send + Sync` and safe under concurrent use; the
/// engine may persist asynchronously while a reader lists history.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint addressed by `config`.
    ///
    /// Defaults to delegating to [`get_tuple`](Self::get_tuple).
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }

    /// Fetch the checkpoint addressed by `config` together with its
    /// metadata, parent linkage, and pending writes.
    ///
    /// With no `checkpoint_id` in the config, returns the latest checkpoint
    /// for the thread. Returns `Ok(None)` (not an error) when nothing
    /// matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Stream checkpoints newest-first.
    ///
    /// `config` restricts to one thread when it carries a `thread_id`;
    /// `filter` matches against metadata's extra fields; `before` excludes
    /// checkpoints at or after the referenced id; `limit` caps the result
    /// count.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Persist a checkpoint.
    ///
    /// A `checkpoint_id` already present in `config` names the *parent* of
    /// the stored checkpoint; the returned config carries the new
    /// checkpoint's id and addresses it for later `get_tuple`/`put_writes`
    /// calls.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Record uncommitted writes against the checkpoint addressed by
    /// `config` (which must carry a `checkpoint_id`).
    ///
    /// A write with the same `(task_id, channel)` as an existing one
    /// replaces it, so repeated interrupt/resume cycles stay idempotent.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Remove every checkpoint and write belonging to a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }
}
