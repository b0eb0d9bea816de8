//! Step-event streaming for runs.
//!
//! `stream()` returns a finite, lazily consumed sequence of events emitted as
//! the run progresses; once exhausted it cannot be restarted. Modes select
//! which events are emitted.

use crate::interrupt::Interrupt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event categories a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Complete output-channel state after each committed superstep.
    Values,
    /// Per-node output after each committed superstep.
    Updates,
    /// Task lifecycle and checkpoint events.
    Debug,
}

/// An event observed during a run.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Emitted after a superstep commits (mode `Values`).
    Values { step: i64, state: Value },
    /// A node's committed output (mode `Updates`).
    Updates { step: i64, node: String, update: Value },
    /// A task began executing (mode `Debug`).
    TaskStart { step: i64, task: String, node: String },
    /// A task finished successfully (mode `Debug`).
    TaskEnd { step: i64, task: String, node: String },
    /// A task failed (mode `Debug`).
    TaskError {
        step: i64,
        task: String,
        node: String,
        error: String,
    },
    /// A checkpoint was persisted (mode `Debug`).
    Checkpoint { step: i64, checkpoint_id: String },
    /// The run paused with pending interrupts (all modes).
    Interrupted { step: i64, interrupts: Vec<Interrupt> },
    /// The run failed; terminal (all modes).
    Error { step: i64, message: String },
}

impl StreamEvent {
    fn mode(&self) -> Option<StreamMode> {
        match self {
            StreamEvent::Values { .. } => Some(StreamMode::Values),
            StreamEvent::Updates { .. } => Some(StreamMode::Updates),
            StreamEvent::TaskStart { .. }
            | StreamEvent::TaskEnd { .. }
            | StreamEvent::TaskError { .. }
            | StreamEvent::Checkpoint { .. } => Some(StreamMode::Debug),
            // Interrupts and failures are surfaced regardless of mode
            // selection.
            StreamEvent::Interrupted { .. } | StreamEvent::Error { .. } => None,
        }
    }
}

/// Finite stream of run events.
pub type RunStream = UnboundedReceiverStream<StreamEvent>;

/// Mode-filtered event sender used by the scheduler.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    modes: Vec<StreamMode>,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEmitter {
    /// Create an emitter and the stream it feeds.
    pub fn channel(modes: Vec<StreamMode>) -> (Self, RunStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { modes, tx }, UnboundedReceiverStream::new(rx))
    }

    pub fn enabled(&self, mode: StreamMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Send an event if its mode is enabled; drops silently once the
    /// receiver is gone.
    pub fn emit(&self, event: StreamEvent) {
        let wanted = match event.mode() {
            Some(mode) => self.enabled(mode),
            None => true,
        };
        if wanted {
            let _ = self.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn emits_only_enabled_modes() {
        let (emitter, stream) = StreamEmitter::channel(vec![StreamMode::Values]);
        emitter.emit(StreamEvent::Values { step: 0, state: json!({}) });
        emitter.emit(StreamEvent::Updates {
            step: 0,
            node: "a".into(),
            update: json!({}),
        });
        drop(emitter);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Values { .. }));
    }

    #[tokio::test]
    async fn interrupted_bypasses_mode_filter() {
        let (emitter, stream) = StreamEmitter::channel(vec![]);
        emitter.emit(StreamEvent::Interrupted { step: 1, interrupts: vec![] });
        drop(emitter);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn stream_is_finite() {
        let (emitter, stream) = StreamEmitter::channel(vec![StreamMode::Debug]);
        emitter.emit(StreamEvent::Checkpoint { step: 0, checkpoint_id: "c1".into() });
        drop(emitter);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }
}
