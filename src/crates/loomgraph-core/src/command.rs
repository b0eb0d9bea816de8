//! Command results: atomic state-update plus routing from inside a node.
//!
//! A node normally returns a plain state update. Returning a [`Command`]
//! instead lets it combine, for the current step only, an update with
//! explicit routing to downstream nodes — bypassing static wiring. Routing is
//! expressed as [`Send`] payloads: dynamically dispatched tasks targeting a
//! named node, the building block for parallel fan-out (one task per
//! payload).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key marking a JSON value as a serialized [`Command`].
///
/// Detection is by this explicit tag; plain object updates are never
/// reinterpreted as commands.
pub const COMMAND_TAG: &str = "__command__";

/// A dynamically dispatched task: run `node` with `arg` as its input in the
/// next superstep, bypassing trigger matching.
///
/// Fanned-out tasks are identified by `(node, arg)` rather than static
/// trigger membership; several sends to the same node produce several tasks.
/// A `Null` arg means "build the input from the node's read channels as
/// usual".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Send {
    pub node: String,
    pub arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self { node: node.into(), arg }
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.node, self.arg)
    }
}

/// Routing requested by a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Goto {
    /// Route to one node, input built from its read channels.
    Node(String),
    /// Route to several nodes.
    Nodes(Vec<String>),
    /// Explicit payloads, one task per send.
    Sends(Vec<Send>),
}

impl From<&str> for Goto {
    fn from(node: &str) -> Self {
        Goto::Node(node.to_string())
    }
}

impl From<Send> for Goto {
    fn from(send: Send) -> Self {
        Goto::Sends(vec![send])
    }
}

impl From<Vec<Send>> for Goto {
    fn from(sends: Vec<Send>) -> Self {
        Goto::Sends(sends)
    }
}

impl Goto {
    /// Expand into concrete sends.
    pub fn into_sends(self) -> Vec<Send> {
        match self {
            Goto::Node(node) => vec![Send::new(node, Value::Null)],
            Goto::Nodes(nodes) => nodes
                .into_iter()
                .map(|node| Send::new(node, Value::Null))
                .collect(),
            Goto::Sends(sends) => sends,
        }
    }
}

/// A node result combining a state update with routing, applied atomically
/// for the step in which it is returned.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Command {
    /// State update, mapped to channel writes like a plain node output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    /// Routing for the next superstep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<Goto>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_goto(mut self, goto: impl Into<Goto>) -> Self {
        self.goto = Some(goto.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.goto.is_none()
    }

    /// Serialize into the tagged value a node action returns.
    pub fn into_value(self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(COMMAND_TAG.to_string(), Value::Bool(true));
        if let Some(update) = self.update {
            obj.insert("update".to_string(), update);
        }
        if let Some(goto) = self.goto {
            // Goto is untagged; serialization of the variants cannot fail.
            obj.insert(
                "goto".to_string(),
                serde_json::to_value(goto).unwrap_or(Value::Null),
            );
        }
        Value::Object(obj)
    }

    /// Parse a node output. Returns `None` for anything not carrying the
    /// command tag.
    pub fn from_value(value: &Value) -> Option<Command> {
        let obj = value.as_object()?;
        if !obj.get(COMMAND_TAG).and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let update = obj.get("update").cloned();
        let goto = obj
            .get("goto")
            .and_then(|g| serde_json::from_value(g.clone()).ok());
        Some(Command { update, goto })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_through_value() {
        let cmd = Command::new()
            .with_update(json!({"count": 1}))
            .with_goto(vec![Send::new("worker", json!({"shard": 0}))]);

        let value = cmd.clone().into_value();
        let parsed = Command::from_value(&value).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn plain_updates_are_not_commands() {
        // An ordinary state update must never be reinterpreted as a command,
        // even when it happens to contain "update" or "goto" keys.
        let value = json!({"update": "profile", "goto": "checkout"});
        assert!(Command::from_value(&value).is_none());
    }

    #[test]
    fn goto_node_expands_to_null_arg_send() {
        let sends = Goto::from("worker").into_sends();
        assert_eq!(sends, vec![Send::new("worker", Value::Null)]);
    }

    #[test]
    fn goto_sends_preserved() {
        let sends = vec![
            Send::new("worker", json!({"i": 0})),
            Send::new("worker", json!({"i": 1})),
        ];
        assert_eq!(Goto::Sends(sends.clone()).into_sends(), sends);
    }

    #[test]
    fn send_serde_round_trip() {
        let send = Send::new("mapper", json!({"item": "x"}));
        let value = serde_json::to_value(&send).unwrap();
        let back: Send = serde_json::from_value(value).unwrap();
        assert_eq!(back, send);
    }
}
