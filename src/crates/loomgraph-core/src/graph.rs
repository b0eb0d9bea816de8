//! Graph definition input: channel specs, node specs, and the builder.
//!
//! The engine consumes a mapping of node name → node spec, channel name →
//! channel spec, and designated input/output channels. [`GraphBuilder`]
//! accumulates that mapping, validates it, and compiles it into a
//! [`CompiledGraph`]. All wiring problems are configuration errors raised
//! here, never mid-run.
//!
//! Nodes are wired by channels: a node *triggers on* a set of channels, has
//! its input snapshot built from the channels it *reads*, and maps its output
//! into the channels it *writes*. `add_edge` is sugar over the same model —
//! it materializes an ephemeral `branch:` channel pulsed after the source
//! node commits.
//!
//! [`CompiledGraph`]: crate::compiled::CompiledGraph

use crate::cache::CachePolicy;
use crate::compiled::CompiledGraph;
use crate::context::NodeContext;
use crate::error::{GraphError, Result};
use crate::retry::RetryPolicy;
use loomgraph_checkpoint::{
    AnyValueChannel, BinaryOperatorChannel, Channel, EphemeralValueChannel, LastValueChannel,
    NamedBarrierValueAfterFinishChannel, NamedBarrierValueChannel, Reducer, TopicChannel,
    UntrackedValueChannel,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Virtual source node for [`GraphBuilder::add_edge`].
pub const START: &str = "__start__";
/// Virtual sink node for [`GraphBuilder::add_edge`].
pub const END: &str = "__end__";

/// Channel carrying the run kickoff pulse.
pub(crate) const START_CHANNEL: &str = "__start__";
/// Channel queueing dynamically dispatched [`Send`](crate::command::Send)s.
pub(crate) const TASKS_CHANNEL: &str = "__tasks__";

/// Whether a channel name is engine-internal (hidden from outputs and state
/// inspection).
pub(crate) fn is_internal_channel(name: &str) -> bool {
    name.starts_with("__") || name.starts_with("branch:")
}

/// Declarative factory for one channel.
#[derive(Clone)]
pub enum ChannelSpec {
    /// Latest value, at most one writer per step.
    LastValue,
    /// Latest value, multiple writers tolerated (explicit override).
    AnyValue,
    /// Append-only accumulation.
    Topic,
    /// Reducer-governed aggregate with optional seed.
    Reducer { reducer: Reducer, seed: Option<Value> },
    /// Cleared at every superstep boundary.
    Ephemeral { guard: bool },
    /// Never persisted in checkpoints.
    Untracked,
    /// Withheld until all named sources have written.
    Barrier { sources: Vec<String> },
    /// Barrier additionally gated on run finish.
    BarrierAfterFinish { sources: Vec<String> },
}

impl ChannelSpec {
    pub fn last_value() -> Self {
        ChannelSpec::LastValue
    }

    pub fn any_value() -> Self {
        ChannelSpec::AnyValue
    }

    pub fn topic() -> Self {
        ChannelSpec::Topic
    }

    pub fn reducer<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        ChannelSpec::Reducer {
            reducer: Arc::new(reducer),
            seed: None,
        }
    }

    /// Numeric addition aggregate.
    pub fn sum() -> Self {
        ChannelSpec::Reducer {
            reducer: sum_reducer(),
            seed: None,
        }
    }

    /// List concatenation aggregate.
    pub fn append() -> Self {
        ChannelSpec::Reducer {
            reducer: append_reducer(),
            seed: None,
        }
    }

    pub fn with_seed(self, seed: Value) -> Self {
        match self {
            ChannelSpec::Reducer { reducer, .. } => ChannelSpec::Reducer {
                reducer,
                seed: Some(seed),
            },
            other => other,
        }
    }

    pub fn ephemeral() -> Self {
        ChannelSpec::Ephemeral { guard: true }
    }

    pub fn untracked() -> Self {
        ChannelSpec::Untracked
    }

    pub fn barrier(sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ChannelSpec::Barrier {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn barrier_after_finish(sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ChannelSpec::BarrierAfterFinish {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    /// Instantiate a fresh channel for a run.
    pub fn build(&self) -> Box<dyn Channel> {
        match self {
            ChannelSpec::LastValue => Box::new(LastValueChannel::new()),
            ChannelSpec::AnyValue => Box::new(AnyValueChannel::new()),
            ChannelSpec::Topic => Box::new(TopicChannel::new()),
            ChannelSpec::Reducer { reducer, seed } => {
                let r = reducer.clone();
                let chan =
                    BinaryOperatorChannel::new(move |a, b| r(a, b));
                Box::new(match seed {
                    Some(seed) => chan.with_seed(seed.clone()),
                    None => chan,
                })
            }
            ChannelSpec::Ephemeral { guard } => Box::new(EphemeralValueChannel::with_guard(*guard)),
            ChannelSpec::Untracked => Box::new(UntrackedValueChannel::new()),
            ChannelSpec::Barrier { sources } => {
                Box::new(NamedBarrierValueChannel::new(sources.clone()))
            }
            ChannelSpec::BarrierAfterFinish { sources } => {
                Box::new(NamedBarrierValueAfterFinishChannel::new(sources.clone()))
            }
        }
    }
}

fn sum_reducer() -> Reducer {
    Arc::new(|a, b| {
        let a = a.as_f64().unwrap_or(0.0);
        let b = b.as_f64().unwrap_or(0.0);
        serde_json::json!(a + b)
    })
}

fn append_reducer() -> Reducer {
    Arc::new(|a, b| {
        let mut out = match a {
            Value::Array(arr) => arr,
            other => vec![other],
        };
        match b {
            Value::Array(arr) => out.extend(arr),
            other => out.push(other),
        }
        Value::Array(out)
    })
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSpec::LastValue => write!(f, "LastValue"),
            ChannelSpec::AnyValue => write!(f, "AnyValue"),
            ChannelSpec::Topic => write!(f, "Topic"),
            ChannelSpec::Reducer { seed, .. } => write!(f, "Reducer {{ seed: {:?} }}", seed),
            ChannelSpec::Ephemeral { guard } => write!(f, "Ephemeral {{ guard: {} }}", guard),
            ChannelSpec::Untracked => write!(f, "Untracked"),
            ChannelSpec::Barrier { sources } => write!(f, "Barrier {{ sources: {:?} }}", sources),
            ChannelSpec::BarrierAfterFinish { sources } => {
                write!(f, "BarrierAfterFinish {{ sources: {:?} }}", sources)
            }
        }
    }
}

/// Future returned by a node action.
pub type ActionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Value>> + std::marker::Send + 'a>>;

/// The single polymorphic node-body capability.
///
/// Plain async closures are wrapped behind this interface at build time
/// (via [`Node::new`]); the engine never branches on callable shape at call
/// time.
pub trait Action: std::marker::Send + Sync {
    fn invoke(&self, input: Value, ctx: NodeContext) -> ActionFuture<'_>;
}

struct ActionFn<F>(F);

impl<F> Action for ActionFn<F>
where
    F: Fn(Value, NodeContext) -> ActionFuture<'static> + std::marker::Send + Sync,
{
    fn invoke(&self, input: Value, ctx: NodeContext) -> ActionFuture<'_> {
        (self.0)(input, ctx)
    }
}

/// Maps a node's output value into channel writes.
pub type WriteMapper = Arc<dyn Fn(&Value) -> Vec<(String, Value)> + std::marker::Send + Sync>;

/// Immutable specification of one node.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Channels whose update wakes this node.
    pub triggers: Vec<String>,
    /// Channels read to build the input snapshot; defaults to the
    /// non-internal triggers when empty.
    pub reads: Vec<String>,
    /// Channels this node's output may be mapped into.
    pub writes: Vec<String>,
    pub action: Arc<dyn Action>,
    /// Custom output → writes mapping; the default maps object keys onto
    /// declared write channels.
    pub write_mapper: Option<WriteMapper>,
    /// Tried in order on failure; the first whose predicate matches governs.
    pub retry_policies: Vec<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub tags: Vec<String>,
    /// Branch channels pulsed after this node commits (edge sugar).
    pub(crate) edge_writes: Vec<String>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("retry_policies", &self.retry_policies.len())
            .field("cache_policy", &self.cache_policy.is_some())
            .field("tags", &self.tags)
            .finish()
    }
}

/// Builder for one node.
pub struct Node {
    spec: NodeSpec,
}

impl Node {
    /// Node from an async closure `(input, ctx) -> Result<Value>`.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Value, NodeContext) -> Fut + std::marker::Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + std::marker::Send + 'static,
    {
        let boxed = move |input: Value, ctx: NodeContext| -> ActionFuture<'static> {
            Box::pin(action(input, ctx))
        };
        Self::with_action(name, Arc::new(ActionFn(boxed)))
    }

    /// Node from a prebuilt action object.
    pub fn with_action(name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            spec: NodeSpec {
                name: name.into(),
                triggers: Vec::new(),
                reads: Vec::new(),
                writes: Vec::new(),
                action,
                write_mapper: None,
                retry_policies: Vec::new(),
                cache_policy: None,
                tags: Vec::new(),
                edge_writes: Vec::new(),
            },
        }
    }

    pub fn triggers(mut self, channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.triggers.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn reads(mut self, channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.reads.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn writes(mut self, channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.writes.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry_policies.push(policy);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.spec.cache_policy = Some(policy);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.spec.tags.push(tag.into());
        self
    }

    pub fn map_writes<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Value) -> Vec<(String, Value)> + std::marker::Send + Sync + 'static,
    {
        self.spec.write_mapper = Some(Arc::new(mapper));
        self
    }

    fn into_spec(self) -> NodeSpec {
        self.spec
    }
}

/// Compiled, immutable graph definition shared by all runs.
#[derive(Debug)]
pub struct GraphDef {
    pub nodes: HashMap<String, NodeSpec>,
    pub channels: HashMap<String, ChannelSpec>,
    pub input_channels: Vec<String>,
    pub output_channels: Vec<String>,
    /// Channel name → nodes it triggers.
    pub trigger_to_nodes: HashMap<String, Vec<String>>,
}

impl GraphDef {
    /// Instantiate fresh channels for a run.
    pub fn build_channels(&self) -> HashMap<String, Box<dyn Channel>> {
        self.channels
            .iter()
            .map(|(name, spec)| (name.clone(), spec.build()))
            .collect()
    }
}

/// Accumulates channels, nodes, and wiring; `compile()` validates and
/// produces a [`CompiledGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    channels: HashMap<String, ChannelSpec>,
    nodes: Vec<NodeSpec>,
    edges: Vec<(String, String)>,
    input_channels: Vec<String>,
    output_channels: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(mut self, name: impl Into<String>, spec: ChannelSpec) -> Self {
        self.channels.insert(name.into(), spec);
        self
    }

    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.push(node.into_spec());
        self
    }

    /// Static edge: after `from` commits, wake `to`. `START` as source makes
    /// `to` an entry node; `END` as target is a no-op (a run ends when no
    /// node triggers).
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn set_input_channels(
        mut self,
        channels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.input_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_output_channels(
        mut self,
        channels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.output_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the wiring and produce a runnable graph.
    pub fn compile(self) -> Result<CompiledGraph> {
        let GraphBuilder {
            mut channels,
            nodes,
            edges,
            input_channels,
            output_channels,
        } = self;

        if nodes.is_empty() {
            return Err(GraphError::Validation("graph has no nodes".to_string()));
        }

        let mut node_map: HashMap<String, NodeSpec> = HashMap::new();
        for spec in nodes {
            if spec.name.starts_with("__") {
                return Err(GraphError::Validation(format!(
                    "node name '{}' uses the reserved '__' prefix",
                    spec.name
                )));
            }
            if node_map.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(GraphError::Validation(format!(
                    "duplicate node name '{}'",
                    spec.name
                )));
            }
        }

        // Reserved channels always exist.
        channels
            .entry(START_CHANNEL.to_string())
            .or_insert(ChannelSpec::Ephemeral { guard: false });
        channels
            .entry(TASKS_CHANNEL.to_string())
            .or_insert(ChannelSpec::Topic);

        // Edge sugar: START edges wake the target on the kickoff pulse;
        // node-to-node edges go through a dedicated branch channel.
        for (from, to) in edges {
            if to == END {
                continue;
            }
            let target = node_map.get_mut(&to).ok_or_else(|| {
                GraphError::Validation(format!("edge target '{}' is not a node", to))
            })?;
            if from == START {
                target.triggers.push(START_CHANNEL.to_string());
                continue;
            }
            let branch = format!("branch:{}->{}", from, to);
            target.triggers.push(branch.clone());
            channels.insert(branch.clone(), ChannelSpec::Ephemeral { guard: false });
            let source = node_map.get_mut(&from).ok_or_else(|| {
                GraphError::Validation(format!("edge source '{}' is not a node", from))
            })?;
            source.edge_writes.push(branch);
        }

        // Every referenced channel must be declared.
        for spec in node_map.values() {
            for (role, names) in [
                ("trigger", &spec.triggers),
                ("read", &spec.reads),
                ("write", &spec.writes),
            ] {
                for name in names {
                    if !channels.contains_key(name) {
                        return Err(GraphError::Validation(format!(
                            "node '{}' references undeclared {} channel '{}'",
                            spec.name, role, name
                        )));
                    }
                }
            }
            if spec.triggers.is_empty() {
                // Legal: reachable only through dynamic dispatch (Send/goto).
                tracing::debug!(node = %spec.name, "node has no triggers; reachable via send only");
            }
        }

        for name in input_channels.iter().chain(output_channels.iter()) {
            if !channels.contains_key(name) {
                return Err(GraphError::Validation(format!(
                    "designated input/output channel '{}' is not declared",
                    name
                )));
            }
        }
        if input_channels.is_empty() {
            return Err(GraphError::Validation(
                "no input channels designated".to_string(),
            ));
        }

        // Barrier sources must name nodes that actually write the barrier.
        for (chan_name, spec) in &channels {
            let sources = match spec {
                ChannelSpec::Barrier { sources } => sources,
                ChannelSpec::BarrierAfterFinish { sources } => sources,
                _ => continue,
            };
            for source in sources {
                let writes_barrier = node_map
                    .get(source)
                    .is_some_and(|n| n.writes.iter().any(|w| w == chan_name));
                if !writes_barrier {
                    return Err(GraphError::Validation(format!(
                        "barrier channel '{}' requires source '{}', which is not a node writing it",
                        chan_name, source
                    )));
                }
            }
        }

        let mut trigger_to_nodes: HashMap<String, Vec<String>> = HashMap::new();
        for spec in node_map.values() {
            for trigger in &spec.triggers {
                trigger_to_nodes
                    .entry(trigger.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }
        for nodes in trigger_to_nodes.values_mut() {
            nodes.sort();
        }

        Ok(CompiledGraph::new(GraphDef {
            nodes: node_map,
            channels,
            input_channels,
            output_channels,
            trigger_to_nodes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> Node {
        Node::new(name, |_input, _ctx| async move { Ok(json!({})) })
    }

    #[test]
    fn compile_minimal_graph() {
        let compiled = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a").triggers(["input"]).writes(["input"]))
            .set_input_channels(["input"])
            .set_output_channels(["input"])
            .compile();
        assert!(compiled.is_ok());
    }

    #[test]
    fn undeclared_channel_is_validation_error() {
        let err = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a").triggers(["missing"]))
            .set_input_channels(["input"])
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn duplicate_node_rejected() {
        let err = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a").triggers(["input"]))
            .add_node(noop("a").triggers(["input"]))
            .set_input_channels(["input"])
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn node_without_triggers_is_send_only() {
        // Reachable only via Send/goto dispatch; compiles fine.
        let compiled = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a"))
            .set_input_channels(["input"])
            .compile()
            .unwrap();
        assert!(compiled.def().nodes["a"].triggers.is_empty());
    }

    #[test]
    fn edge_sugar_wires_branch_channel() {
        let compiled = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a").triggers(["input"]))
            .add_node(noop("b"))
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_input_channels(["input"])
            .compile()
            .unwrap();

        let def = compiled.def();
        assert!(def.channels.contains_key("branch:a->b"));
        assert_eq!(def.nodes["b"].triggers, vec!["branch:a->b"]);
        assert_eq!(def.nodes["a"].edge_writes, vec!["branch:a->b"]);
    }

    #[test]
    fn start_edge_triggers_on_kickoff() {
        let compiled = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("a"))
            .add_edge(START, "a")
            .set_input_channels(["input"])
            .compile()
            .unwrap();
        assert_eq!(compiled.def().nodes["a"].triggers, vec![START_CHANNEL]);
    }

    #[test]
    fn barrier_source_must_write_barrier() {
        let err = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_channel("gate", ChannelSpec::barrier(["a"]))
            // "a" triggers but does not write the barrier.
            .add_node(noop("a").triggers(["input"]))
            .set_input_channels(["input"])
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("barrier"));
    }

    #[test]
    fn reserved_node_prefix_rejected() {
        let err = GraphBuilder::new()
            .add_channel("input", ChannelSpec::last_value())
            .add_node(noop("__secret").triggers(["input"]))
            .set_input_channels(["input"])
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn channel_spec_builds_expected_kinds() {
        assert!(ChannelSpec::last_value().build().update(vec![json!(1)]).unwrap());
        let mut seeded = ChannelSpec::append().with_seed(json!([])).build();
        seeded.update(vec![json!(["x"])]).unwrap();
        assert_eq!(seeded.get().unwrap(), json!(["x"]));
    }
}
