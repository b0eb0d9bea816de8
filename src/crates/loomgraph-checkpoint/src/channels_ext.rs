//! Extended channel kinds: ephemeral, untracked, and barrier channels.

use crate::channels::Channel;
use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Value that lives for exactly one superstep.
///
/// The scheduler notifies every channel of each step boundary via an empty
/// update batch; an ephemeral channel clears on that signal, so a value
/// written in step N is visible to step N+1 and gone by step N+2. With
/// `guard` set (the default) the channel also rejects more than one writer
/// per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralValueChannel {
    value: Option<serde_json::Value>,
    guard: bool,
}

impl EphemeralValueChannel {
    pub fn new() -> Self {
        Self { value: None, guard: true }
    }

    pub fn with_guard(guard: bool) -> Self {
        Self { value: None, guard }
    }
}

impl Default for EphemeralValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            // Step boundary with no writes: the value expires.
            let had_value = self.value.take().is_some();
            return Ok(had_value);
        }
        if values.len() > 1 && self.guard {
            return Err(CheckpointError::InvalidUpdate(format!(
                "ephemeral_value channel (guarded) received {} values in one step",
                values.len()
            )));
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

    fn consume(&mut self) -> bool {
        self.value.take().is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Value held in memory but excluded from persistence.
///
/// Reads and writes behave like [`LastValueChannel`], but `checkpoint()`
/// yields nothing and a restored instance starts empty. Use for derived or
/// oversized data that can be regenerated after a resume.
///
/// [`LastValueChannel`]: crate::channels::LastValueChannel
#[derive(Debug, Clone, Default)]
pub struct UntrackedValueChannel {
    value: Option<serde_json::Value>,
}

impl UntrackedValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }
}

impl Channel for UntrackedValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("untracked_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        match values.len() {
            0 => Ok(false),
            1 => {
                self.value = values.into_iter().next();
                Ok(true)
            }
            n => Err(CheckpointError::InvalidUpdate(format!(
                "untracked_value channel received {} values in one step",
                n
            ))),
        }
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn restore(&mut self, _snapshot: serde_json::Value) -> Result<()> {
        // Untracked state is never persisted, so there is nothing to restore.
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Barrier that withholds its value until every required source has written.
///
/// Sources identify themselves by writing their own name (a JSON string) to
/// the channel; unknown names are ignored and duplicates count once. Once
/// every required name has arrived the channel becomes available and `get`
/// returns the received names in sorted order. `consume` resets the barrier
/// for the next round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBarrierValueChannel {
    names: BTreeSet<String>,
    received: BTreeSet<String>,
}

impl NamedBarrierValueChannel {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
            received: BTreeSet::new(),
        }
    }

    pub fn required_sources(&self) -> &BTreeSet<String> {
        &self.names
    }

    fn satisfied(&self) -> bool {
        self.received.len() >= self.names.len()
    }

    fn accept(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        let mut updated = false;
        for value in values {
            let serde_json::Value::String(name) = value else {
                return Err(CheckpointError::InvalidUpdate(format!(
                    "barrier channel expects source-name strings, got {}",
                    value
                )));
            };
            if self.names.contains(&name) && self.received.insert(name) {
                updated = true;
            }
        }
        Ok(updated)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "names": self.names.iter().cloned().collect::<Vec<_>>(),
            "received": self.received.iter().cloned().collect::<Vec<_>>(),
        })
    }

    /// Restore the received set, validating the snapshot against the
    /// configured source set. A snapshot taken with a source that has since
    /// been removed from the graph is a configuration error, not something
    /// to guess around.
    fn restore_into(&mut self, snapshot: serde_json::Value) -> Result<()> {
        let names: BTreeSet<String> = snapshot
            .get("names")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if names != self.names {
            return Err(CheckpointError::Invalid(format!(
                "barrier source set changed since checkpoint: snapshot requires {:?}, graph requires {:?}",
                names, self.names
            )));
        }
        self.received = snapshot
            .get("received")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(())
    }
}

impl Channel for NamedBarrierValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        if !self.satisfied() {
            return Err(CheckpointError::EmptyChannel(format!(
                "barrier waiting on {:?}",
                self.names.difference(&self.received).collect::<Vec<_>>()
            )));
        }
        Ok(serde_json::Value::Array(
            self.received
                .iter()
                .map(|s| serde_json::Value::String(s.clone()))
                .collect(),
        ))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        self.accept(values)
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(Some(self.snapshot()))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.restore_into(snapshot)
    }

    fn is_available(&self) -> bool {
        self.satisfied()
    }

    fn consume(&mut self) -> bool {
        if self.received.is_empty() {
            return false;
        }
        self.received.clear();
        true
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Barrier variant that additionally waits for the run-finish signal.
///
/// Becomes available only once all sources have written *and* the scheduler
/// has signalled that no further superstep will run. Useful for final fan-in
/// values that must not leak into intermediate steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBarrierValueAfterFinishChannel {
    inner: NamedBarrierValueChannel,
    finished: bool,
}

impl NamedBarrierValueAfterFinishChannel {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: NamedBarrierValueChannel::new(names),
            finished: false,
        }
    }
}

impl Channel for NamedBarrierValueAfterFinishChannel {
    fn get(&self) -> Result<serde_json::Value> {
        if !self.finished {
            return Err(CheckpointError::EmptyChannel(
                "barrier_after_finish: run not finished".to_string(),
            ));
        }
        self.inner.get()
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        let updated = self.inner.accept(values)?;
        if updated {
            self.finished = false;
        }
        Ok(updated)
    }

    fn checkpoint(&self) -> Result<Option<serde_json::Value>> {
        let mut snap = self.inner.snapshot();
        snap["finished"] = serde_json::Value::Bool(self.finished);
        Ok(Some(snap))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.finished = snapshot
            .get("finished")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.inner.restore_into(snapshot)
    }

    fn is_available(&self) -> bool {
        self.finished && self.inner.satisfied()
    }

    fn consume(&mut self) -> bool {
        if self.finished {
            self.finished = false;
            self.inner.consume();
            true
        } else {
            false
        }
    }

    fn finish(&mut self) -> bool {
        if !self.finished && self.inner.satisfied() {
            self.finished = true;
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
