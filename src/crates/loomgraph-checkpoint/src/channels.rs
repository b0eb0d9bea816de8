//! Core channel kinds: last-value, any-value, topic, and reducer channels.
//!
//! Channels are the only state cells in a loomgraph graph. Nodes never share
//! memory; everything a node produces is routed through a channel whose update
//! policy decides how concurrent writes within one superstep combine. The
//! scheduler applies all of a step's writes in a single batch per channel, so
//! `update` receives the full set of values that reached the channel this
//! step, in no particular order.

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// A typed state cell with an update policy.
///
/// The scheduler calls `update` exactly once per superstep per written
/// channel, with every value that reached the channel in that step. The batch
/// is unordered: an implementation must either be insensitive to ordering
/// (reducers must be commutative/associative) or reject batches it cannot
/// combine deterministically with [`CheckpointError::InvalidUpdate`].
pub trait Channel: Send + Sync + Debug {
    /// Current value of the channel.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::EmptyChannel`] if no value is available.
    fn get(&self) -> Result<serde_json::Value>;

    /// Apply a batch of values written in one superstep.
    ///
    /// Returns `true` if the channel changed. An empty batch signals a step
    /// boundary with no writes to this channel; most kinds treat it as a
    /// no-op, ephemeral kinds clear.
    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool>;

    /// Serializable snapshot of the channel state.
    ///
    /// `Ok(None)` means the channel has nothing to persist — either it is
    /// empty or its kind is excluded from persistence entirely.
    fn checkpoint(&self) -> Result<Option<serde_json::Value>>;

    /// Restore state from a snapshot previously produced by [`checkpoint`].
    ///
    /// `restore(checkpoint(c))` must reproduce `c` exactly for every kind
    /// that persists at all.
    ///
    /// [`checkpoint`]: Channel::checkpoint
    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()>;

    /// Whether `get` would currently succeed.
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a subscribed task consumed it this step.
    ///
    /// Returns `true` if the channel changed.
    fn consume(&mut self) -> bool {
        false
    }

    /// Notify the channel that the run is finishing.
    ///
    /// Returns `true` if the channel changed.
    fn finish(&mut self) -> bool {
        false
    }

    /// Clone into a boxed trait object.
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Stores the latest value, allowing at most one writer per step.
///
/// Two or more values in a single batch is a conflict the caller must resolve
/// explicitly (use [`AnyValueChannel`] or a reducer kind for multi-writer
/// channels); the channel never picks a winner based on iteration order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LastValueChannel {
    value: Option<serde_json::Value>,
}

impl LastValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }

    pub fn with_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        match values.len() {
            0 => Ok(false),
            1 => {
                self.value = values.into_iter().next();
                Ok(true)
            }
            n => Err(CheckpointError::InvalidUpdate(format!(
                "last_value channel received {} values in one step; \
                 at most one concurrent writer is allowed",
                n
            ))),
        }
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.value.clone())
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Like [`LastValueChannel`] but tolerant of multiple writers per step.
///
/// This is the explicit ordering override: when several values arrive in one
/// batch the last one wins without error.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnyValueChannel {
    value: Option<serde_json::Value>,
}

impl AnyValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }
}

impl Channel for AnyValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("any_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.value = values.into_iter().last();
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.value.clone())
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Append-only accumulation of every value written, exposed as a JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicChannel {
    values: Vec<serde_json::Value>,
}

impl TopicChannel {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn values(&self) -> &[serde_json::Value] {
        &self.values
    }

    /// Drain all accumulated values.
    pub fn take(&mut self) -> Vec<serde_json::Value> {
        std::mem::take(&mut self.values)
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.values.extend(values);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(Some(serde_json::Value::Array(self.values.clone())))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        match snapshot {
            serde_json::Value::Array(arr) => {
                self.values = arr;
                Ok(())
            }
            other => Err(CheckpointError::Invalid(format!(
                "topic channel snapshot must be an array, got {}",
                other
            ))),
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function combining two values into one.
pub type Reducer = Arc<dyn Fn(serde_json::Value, serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Reducer-governed aggregate channel.
///
/// Concurrent writes within a step are folded pairwise with the reducer, then
/// combined with the existing value. The reducer must be associative (and
/// commutative if write order across tasks matters), otherwise the result
/// depends on batch order and the determinism guarantee is void.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<serde_json::Value>,
    reducer: Reducer,
}

impl BinaryOperatorChannel {
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(serde_json::Value, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            reducer: Arc::new(reducer),
        }
    }

    /// Seed the channel with an initial value.
    pub fn with_seed(mut self, seed: serde_json::Value) -> Self {
        self.value = Some(seed);
        self
    }

    /// Numeric addition reducer.
    pub fn sum() -> Self {
        Self::new(|a, b| {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            serde_json::json!(a + b)
        })
    }

    /// List concatenation reducer. Non-array operands are treated as
    /// single-element lists.
    pub fn append() -> Self {
        Self::new(|a, b| {
            let mut out = match a {
                serde_json::Value::Array(arr) => arr,
                other => vec![other],
            };
            match b {
                serde_json::Value::Array(arr) => out.extend(arr),
                other => out.push(other),
            }
            serde_json::Value::Array(out)
        })
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("reducer", &"<fn>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        let Some(batch) = values.into_iter().reduce(|acc, v| (self.reducer)(acc, v)) else {
            return Ok(false);
        };
        self.value = Some(match self.value.take() {
            Some(current) => (self.reducer)(current, batch),
            None => batch,
        });
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.value.clone())
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_value_stores_latest() {
        let mut chan = LastValueChannel::new();
        assert!(!chan.is_available());
        assert!(chan.update(vec![json!(42)]).unwrap());
        assert_eq!(chan.get().unwrap(), json!(42));
        chan.update(vec![json!(100)]).unwrap();
        assert_eq!(chan.get().unwrap(), json!(100));
    }

    #[test]
    fn last_value_rejects_concurrent_writers() {
        let mut chan = LastValueChannel::new();
        let err = chan.update(vec![json!(5), json!(10)]).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidUpdate(_)));
        // Identical values are still a conflict; dedup would make behavior
        // depend on JSON equality of arbitrary payloads.
        assert!(chan.update(vec![json!(1), json!(1)]).is_err());
    }

    #[test]
    fn last_value_empty_batch_is_noop() {
        let mut chan = LastValueChannel::new();
        assert!(!chan.update(vec![]).unwrap());
        assert!(!chan.is_available());
    }

    #[test]
    fn last_value_empty_get_is_typed() {
        let chan = LastValueChannel::new();
        assert!(matches!(
            chan.get().unwrap_err(),
            CheckpointError::EmptyChannel(_)
        ));
    }

    #[test]
    fn any_value_last_wins() {
        let mut chan = AnyValueChannel::new();
        chan.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        assert_eq!(chan.get().unwrap(), json!(3));
    }

    #[test]
    fn topic_accumulates_across_steps() {
        let mut chan = TopicChannel::new();
        chan.update(vec![json!(1), json!(2)]).unwrap();
        chan.update(vec![json!(3)]).unwrap();
        assert_eq!(chan.get().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn binary_operator_sum() {
        let mut chan = BinaryOperatorChannel::sum();
        chan.update(vec![json!(1.0), json!(2.0), json!(3.0)]).unwrap();
        assert_eq!(chan.get().unwrap(), json!(6.0));
        chan.update(vec![json!(4.0)]).unwrap();
        assert_eq!(chan.get().unwrap(), json!(10.0));
    }

    #[test]
    fn binary_operator_append_with_seed() {
        let mut chan = BinaryOperatorChannel::append().with_seed(json!([]));
        chan.update(vec![json!(["x"])]).unwrap();
        chan.update(vec![json!(["y"])]).unwrap();
        assert_eq!(chan.get().unwrap(), json!(["x", "y"]));
    }

    #[test]
    fn binary_operator_update_is_associative() {
        // [a, b] then [c] must equal [a] then [b, c] for an associative reducer.
        let mut left = BinaryOperatorChannel::append();
        left.update(vec![json!([1]), json!([2])]).unwrap();
        left.update(vec![json!([3])]).unwrap();

        let mut right = BinaryOperatorChannel::append();
        right.update(vec![json!([1])]).unwrap();
        right.update(vec![json!([2]), json!([3])]).unwrap();

        assert_eq!(left.get().unwrap(), right.get().unwrap());
    }

    #[test]
    fn binary_operator_is_cloneable() {
        let mut chan = BinaryOperatorChannel::sum();
        chan.update(vec![json!(5.0)]).unwrap();
        let cloned = chan.clone_box();
        assert_eq!(cloned.get().unwrap(), json!(5.0));
    }

    #[test]
    fn checkpoint_restore_round_trip() {
        let mut chan = LastValueChannel::new();
        chan.update(vec![json!({"nested": [1, 2, 3], "s": "héllo"})])
            .unwrap();
        let snap = chan.checkpoint().unwrap().unwrap();

        let mut restored = LastValueChannel::new();
        restored.restore(snap).unwrap();
        assert_eq!(restored.get().unwrap(), chan.get().unwrap());
    }

    #[test]
    fn empty_checkpoint_is_none() {
        let chan = LastValueChannel::new();
        assert!(chan.checkpoint().unwrap().is_none());
    }

    #[test]
    fn topic_round_trip_preserves_order() {
        let mut chan = TopicChannel::new();
        chan.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        let snap = chan.checkpoint().unwrap().unwrap();

        let mut restored = TopicChannel::new();
        restored.restore(snap).unwrap();
        assert_eq!(restored.get().unwrap(), json!([1, 2, 3]));
    }
}
