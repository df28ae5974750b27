// src/flow.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::node::FlowNode;

/// Wire format of a flow definition as fetched from the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creation_date: Option<String>,
    #[serde(default)]
    pub md5_out: Option<String>,
    /// node-id key → node definition
    #[serde(default)]
    pub flow: HashMap<String, NodeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: i64,
    /// Open mapping; `type` and `node` name the behavior, the rest is free-form.
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub inputs: HashMap<String, PortDefinition>,
    #[serde(default)]
    pub outputs: HashMap<String, PortDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortDefinition {
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// A single connection entry. Some backends serialize the node id as a
/// string, so it is coerced on access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub node: Value,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

impl Connection {
    pub fn node_id(&self) -> Option<i64> {
        match &self.node {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow definition is empty")]
    EmptyDefinition,
    #[error("invalid flow definition: {0}")]
    InvalidDefinition(String),
}

/// Port labels carried on a graph edge, parent output → child input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgePorts {
    pub parent_output: String,
    pub child_input: String,
}

/// A built flow: identity, content hash and the node graph. Immutable once
/// built; `FlowEngine` replaces it wholesale.
pub struct Flow {
    pub id: Option<String>,
    pub name: Option<String>,
    pub creation_date: Option<String>,
    md5: Option<String>,
    graph: StableDiGraph<Arc<FlowNode>, EdgePorts>,
    index_of: HashMap<i64, NodeIndex>,
}

impl Flow {
    pub fn empty() -> Self {
        Self {
            id: None,
            name: None,
            creation_date: None,
            md5: None,
            graph: StableDiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    /// Parse a definition into a graph. Fails without side effects, so the
    /// caller can keep the previous flow on error.
    pub fn build(def: &FlowDefinition) -> Result<Self, FlowError> {
        if def.flow.is_empty() {
            return Err(FlowError::EmptyDefinition);
        }

        // First pass: collect the nodes and the declared edges. Both the
        // inputs and outputs sections declare the same edge, so they are
        // deduplicated on (parent, port, child, port).
        let mut declared: Vec<(i64, String, String, Map<String, Value>)> = Vec::new();
        let mut ids = HashSet::new();
        let mut edges: HashSet<(i64, String, i64, String)> = HashSet::new();

        for node_def in def.flow.values() {
            if !ids.insert(node_def.id) {
                return Err(FlowError::InvalidDefinition(format!(
                    "duplicate node id {}",
                    node_def.id
                )));
            }
            let node_type = node_def
                .data
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("undefined")
                .to_string();
            let node_name = node_def
                .data
                .get("node")
                .and_then(Value::as_str)
                .unwrap_or("undefined")
                .to_string();
            declared.push((node_def.id, node_type, node_name, node_def.data.clone()));

            for (port, port_def) in &node_def.outputs {
                for conn in &port_def.connections {
                    match conn.node_id() {
                        Some(child) => {
                            let child_input = conn.output.clone().unwrap_or_default();
                            edges.insert((node_def.id, port.clone(), child, child_input));
                        }
                        None => warn!(
                            parent = node_def.id,
                            "output connection without a valid node id, skipping"
                        ),
                    }
                }
            }
            for (port, port_def) in &node_def.inputs {
                for conn in &port_def.connections {
                    match conn.node_id() {
                        Some(parent) => {
                            let parent_output = conn.input.clone().unwrap_or_default();
                            edges.insert((parent, parent_output, node_def.id, port.clone()));
                        }
                        None => warn!(
                            child = node_def.id,
                            "input connection without a valid node id, skipping"
                        ),
                    }
                }
            }
        }

        // Drop edges that reference unknown nodes instead of failing the
        // whole build; the rest of the graph stays usable.
        let edges: Vec<_> = edges
            .into_iter()
            .filter(|(parent, _, child, _)| {
                let ok = ids.contains(parent) && ids.contains(child);
                if !ok {
                    warn!(%parent, %child, "dangling edge in flow definition, skipping");
                }
                ok
            })
            .collect();

        let mut inbound: HashMap<i64, usize> = HashMap::new();
        let mut outbound: HashMap<i64, usize> = HashMap::new();
        for (parent, _, child, _) in &edges {
            *outbound.entry(*parent).or_default() += 1;
            *inbound.entry(*child).or_default() += 1;
        }

        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        for (id, node_type, node_name, data) in declared {
            let is_root = inbound.get(&id).copied().unwrap_or(0) == 0;
            let is_leaf = outbound.get(&id).copied().unwrap_or(0) == 0;
            let ix = graph.add_node(Arc::new(FlowNode::new(
                id, node_type, node_name, data, is_root, is_leaf,
            )));
            index_of.insert(id, ix);
        }
        for (parent, parent_output, child, child_input) in edges {
            graph.add_edge(
                index_of[&parent],
                index_of[&child],
                EdgePorts {
                    parent_output,
                    child_input,
                },
            );
        }

        Ok(Self {
            id: def.id.clone(),
            name: def.name.clone(),
            creation_date: def.creation_date.clone(),
            md5: def.md5_out.clone(),
            graph,
            index_of,
        })
    }

    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_by_id(&self, node_id: i64) -> Option<&Arc<FlowNode>> {
        self.index_of
            .get(&node_id)
            .and_then(|ix| self.graph.node_weight(*ix))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<FlowNode>> {
        self.graph.node_weights()
    }

    fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|ix| self.graph.neighbors_directed(*ix, Incoming).next().is_none())
            .collect()
    }
}

/// Owns the current flow and replaces it wholesale under a lock, so
/// in-flight traversals always see a fully old or fully new graph.
pub struct FlowEngine {
    current: RwLock<Flow>,
}

impl FlowEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Flow::empty()),
        })
    }

    /// Apply a definition fetched from the backend. Returns `Ok(true)` when
    /// the graph was rebuilt, `Ok(false)` when the content hash is unchanged
    /// (all accumulated node state is preserved).
    pub async fn set_flow(&self, def: &FlowDefinition) -> Result<bool, FlowError> {
        if def.flow.is_empty() {
            return Err(FlowError::EmptyDefinition);
        }
        let built = Flow::build(def)?;

        let mut current = self.current.write().await;
        let incoming = def.md5_out.as_deref();
        if incoming.is_some() && incoming == current.md5() {
            debug!("flow hash unchanged, skipping update");
            return Ok(false);
        }
        *current = built;
        info!(
            id = current.id.as_deref().unwrap_or("-"),
            name = current.name.as_deref().unwrap_or("-"),
            nodes = current.len(),
            "flow updated"
        );
        Ok(true)
    }

    /// Traverse the whole graph, starting from every root node.
    pub async fn execute_flow(&self) {
        let flow = self.current.read().await;
        for root in flow.roots() {
            walk(&flow, root).await;
        }
        debug!("flow executed");
    }

    /// Event entry point: merge decoded device data into the node bound to
    /// `device_id` and re-execute the graph from that node only.
    pub async fn receive_device_data(&self, device_id: &str, data: &Map<String, Value>) {
        let flow = self.current.read().await;
        let mut start = None;
        for ix in flow.graph.node_indices() {
            if flow.graph[ix].device_id().await.as_deref() == Some(device_id) {
                start = Some(ix);
                break;
            }
        }
        let Some(ix) = start else {
            debug!(%device_id, "no flow node references this device, ignoring data");
            return;
        };
        flow.graph[ix].merge_data(data).await;
        walk(&flow, ix).await;
    }

    /// Run `f` over a clone of every node handle, e.g. for behavior binding.
    pub async fn nodes(&self) -> Vec<Arc<FlowNode>> {
        self.current.read().await.nodes().cloned().collect()
    }

    pub async fn describe(&self) {
        let flow = self.current.read().await;
        info!(
            id = flow.id.as_deref().unwrap_or("-"),
            name = flow.name.as_deref().unwrap_or("-"),
            created = flow.creation_date.as_deref().unwrap_or("-"),
            hash = flow.md5().unwrap_or("-"),
            "current flow"
        );
        for node in flow.nodes() {
            info!(
                node_id = node.node_id,
                node_type = %node.node_type,
                node_name = %node.node_name,
                is_root = node.is_root,
                is_leaf = node.is_leaf,
                "  node"
            );
        }
    }
}

/// Depth-first walk over an explicit work-list. Each node executes at most
/// once per trigger; a node reachable through several parents is not
/// re-executed (diamond shapes are deduplicated).
async fn walk(flow: &Flow, start: NodeIndex) {
    let mut stack = vec![start];
    let mut visited: HashSet<NodeIndex> = HashSet::new();

    while let Some(ix) = stack.pop() {
        if !visited.insert(ix) {
            continue;
        }
        let Some(node) = flow.graph.node_weight(ix) else {
            warn!("traversal reached a missing node, skipping");
            continue;
        };

        let proceed = match node.behavior() {
            None => {
                debug!(node_id = node.node_id, node_name = %node.node_name, "no behavior bound, passing through");
                true
            }
            Some(behavior) => {
                let mut data = node.data().await;
                match behavior.invoke(&mut data).await {
                    Ok(gate) => gate,
                    Err(err) => {
                        warn!(node_id = node.node_id, %err, "node behavior failed, halting this branch");
                        false
                    }
                }
            }
        };
        if !proceed {
            debug!(node_id = node.node_id, "behavior gated traversal");
            continue;
        }

        let snapshot = node.snapshot().await;
        let children: Vec<NodeIndex> = flow.graph.neighbors_directed(ix, Outgoing).collect();
        for child_ix in children {
            if visited.contains(&child_ix) {
                continue;
            }
            match flow.graph.node_weight(child_ix) {
                Some(child) => {
                    child.merge_data(&snapshot).await;
                    stack.push(child_ix);
                }
                None => warn!(parent = node.node_id, "dangling edge, skipping child"),
            }
        }
    }
}
