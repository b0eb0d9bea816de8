//! Mapping between caller values, channel reads, and channel writes.

use crate::error::{GraphError, Result};
use crate::graph::START_CHANNEL;
use loomgraph_checkpoint::Channel;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Turn a run input into channel writes.
///
/// A single input channel accepts the value as-is. With several input
/// channels the value must be an object whose keys name them. Every input
/// additionally pulses the kickoff channel so entry nodes wired from `START`
/// wake up.
pub fn map_input(input: &Value, input_channels: &[String]) -> Result<Vec<(String, Value)>> {
    let mut writes = Vec::new();
    if !input.is_null() {
        if input_channels.len() == 1 {
            writes.push((input_channels[0].clone(), input.clone()));
        } else {
            let Value::Object(map) = input else {
                return Err(GraphError::Execution(format!(
                    "input for multiple input channels must be an object, got {}",
                    input
                )));
            };
            for key in input_channels {
                if let Some(value) = map.get(key) {
                    writes.push((key.clone(), value.clone()));
                }
            }
            if writes.is_empty() {
                return Err(GraphError::Execution(
                    "input object matched none of the designated input channels".to_string(),
                ));
            }
        }
    }
    writes.push((START_CHANNEL.to_string(), Value::Bool(true)));
    Ok(writes)
}

/// Read one channel, `None` when absent or empty.
pub fn read_channel(channels: &HashMap<String, Box<dyn Channel>>, name: &str) -> Option<Value> {
    channels.get(name).and_then(|c| c.get().ok())
}

/// Build a node's input snapshot from its read channels.
///
/// One read channel yields the bare value (`Null` when empty); several yield
/// an object keyed by channel name, with unavailable channels omitted.
pub fn read_node_input(channels: &HashMap<String, Box<dyn Channel>>, reads: &[String]) -> Value {
    if reads.len() == 1 {
        return read_channel(channels, &reads[0]).unwrap_or(Value::Null);
    }
    let mut out = Map::new();
    for name in reads {
        if let Some(value) = read_channel(channels, name) {
            out.insert(name.clone(), value);
        }
    }
    Value::Object(out)
}

/// Read the designated output channels at the end of a run.
pub fn read_output(
    channels: &HashMap<String, Box<dyn Channel>>,
    output_channels: &[String],
) -> Value {
    read_node_input(channels, output_channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomgraph_checkpoint::LastValueChannel;
    use serde_json::json;

    fn chans(pairs: &[(&str, Value)]) -> HashMap<String, Box<dyn Channel>> {
        let mut map: HashMap<String, Box<dyn Channel>> = HashMap::new();
        for (name, value) in pairs {
            map.insert(
                name.to_string(),
                Box::new(LastValueChannel::with_value(value.clone())),
            );
        }
        map
    }

    #[test]
    fn single_input_channel_takes_value_directly() {
        let writes = map_input(&json!({"q": "hi"}), &["input".to_string()]).unwrap();
        assert_eq!(writes[0], ("input".to_string(), json!({"q": "hi"})));
        assert_eq!(writes[1].0, START_CHANNEL);
    }

    #[test]
    fn multi_input_requires_object() {
        let channels = vec!["a".to_string(), "b".to_string()];
        assert!(map_input(&json!(5), &channels).is_err());

        let writes = map_input(&json!({"a": 1, "b": 2}), &channels).unwrap();
        assert!(writes.contains(&("a".to_string(), json!(1))));
        assert!(writes.contains(&("b".to_string(), json!(2))));
    }

    #[test]
    fn null_input_still_pulses_start() {
        let writes = map_input(&Value::Null, &["input".to_string()]).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, START_CHANNEL);
    }

    #[test]
    fn single_read_is_bare_value() {
        let channels = chans(&[("state", json!(42))]);
        assert_eq!(read_node_input(&channels, &["state".to_string()]), json!(42));
    }

    #[test]
    fn single_read_empty_is_null() {
        let channels: HashMap<String, Box<dyn Channel>> = HashMap::new();
        assert_eq!(read_node_input(&channels, &["state".to_string()]), Value::Null);
    }

    #[test]
    fn multi_read_keyed_by_channel_name() {
        let channels = chans(&[("a", json!(1)), ("b", json!(2))]);
        let input = read_node_input(&channels, &["a".to_string(), "b".to_string(), "missing".to_string()]);
        assert_eq!(input, json!({"a": 1, "b": 2}));
    }
}
