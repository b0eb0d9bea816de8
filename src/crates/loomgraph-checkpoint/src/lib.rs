//! # loomgraph-checkpoint — channels and state persistence
//!
//! State primitives for the loomgraph execution engine: the [`Channel`]
//! update-policy abstraction with its eight implementations, the checkpoint
//! data model, and the [`CheckpointSaver`] storage boundary with in-memory
//! and file-backed adapters.
//!
//! ## Channels
//!
//! A channel is a named, typed state cell. Its kind decides how concurrent
//! writes within one superstep combine:
//!
//! - [`LastValueChannel`] — latest value, at most one writer per step
//! - [`AnyValueChannel`] — latest value, multiple writers tolerated
//! - [`TopicChannel`] — append-only accumulation
//! - [`BinaryOperatorChannel`] — reducer-governed aggregate
//! - [`EphemeralValueChannel`] — cleared at each superstep boundary
//! - [`UntrackedValueChannel`] — readable/writable but never persisted
//! - [`NamedBarrierValueChannel`] — withheld until all named sources write
//! - [`NamedBarrierValueAfterFinishChannel`] — barrier gated on run finish
//!
//! ## Checkpoints
//!
//! A [`Checkpoint`] snapshots every persistable channel plus the version
//! bookkeeping that drives scheduling; [`CheckpointSaver`] persists one
//! immutable row per `(thread_id, checkpoint_id)` with ids that sort in
//! creation order. [`MemorySaver`] backs tests and development,
//! [`FileSaver`] is the durable adapter.
//!
//! ```rust,no_run
//! use loomgraph_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, MemorySaver,
//! };
//! use std::collections::HashMap;
//!
//! # async fn demo() -> loomgraph_checkpoint::Result<()> {
//! let saver = MemorySaver::new();
//! let config = CheckpointConfig::new("thread-1");
//! let saved = saver
//!     .put(&config, Checkpoint::new(), CheckpointMetadata::new(), HashMap::new())
//!     .await?;
//! let tuple = saver.get_tuple(&saved).await?;
//! assert!(tuple.is_some());
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod channels_ext;
pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use channels::{
    AnyValueChannel, BinaryOperatorChannel, Channel, LastValueChannel, Reducer, TopicChannel,
};
pub use channels_ext::{
    EphemeralValueChannel, NamedBarrierValueAfterFinishChannel, NamedBarrierValueChannel,
    UntrackedValueChannel,
};
pub use checkpoint::{
    increment, sortable_id, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use file::FileSaver;
pub use memory::MemorySaver;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
