use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use maestro_core::config::GraphConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::Invocable;
use maestro_core::types::NodeId;

use super::condition::Condition;
use super::edge::Edge;
use super::executor::Graph;
use crate::node::{Node, NodeOptions};

/// Fluent builder for [`Graph`]. Nothing is checked until [`build`](Self::build).
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry_points: Vec<NodeId>,
    max_node_executions: Option<u32>,
    config: GraphConfig,
    event_bus: Option<Arc<EventBus>>,
    /// Errors from declarations that could not be recorded (bad condition syntax).
    deferred: Vec<String>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            name: "graph".to_string(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_points: Vec::new(),
            max_node_executions: None,
            config: GraphConfig::default(),
            event_bus: None,
            deferred: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_node(self, id: impl Into<NodeId>, unit: Arc<dyn Invocable>) -> Self {
        self.add_node_with(id, unit, NodeOptions::default())
    }

    pub fn add_node_with(
        mut self,
        id: impl Into<NodeId>,
        unit: Arc<dyn Invocable>,
        options: NodeOptions,
    ) -> Self {
        self.nodes.push(Node::new(id, unit).with_options(options));
        self
    }

    /// Add a prebuilt node.
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::always(from, to));
        self
    }

    pub fn add_edge_when(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        condition: Condition,
    ) -> Self {
        self.edges.push(Edge::when(from, to, condition));
        self
    }

    /// Add an edge guarded by a textual expression. Syntax errors surface from `build`.
    pub fn add_conditional_edge(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        expr: &str,
    ) -> Self {
        match Edge::conditional(from, to, expr) {
            Ok(edge) => self.edges.push(edge),
            Err(MaestroError::Validation(msg)) => self.deferred.push(msg),
            Err(e) => self.deferred.push(e.to_string()),
        }
        self
    }

    /// Mark `id` as an entry point. May be called more than once.
    pub fn set_entry_point(mut self, id: impl Into<NodeId>) -> Self {
        let id = id.into();
        if !self.entry_points.contains(&id) {
            self.entry_points.push(id);
        }
        self
    }

    pub fn set_max_node_executions(mut self, max: u32) -> Self {
        self.max_node_executions = Some(max);
        self
    }

    /// Pool size and timeouts. An explicit `set_max_node_executions` wins over the config.
    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validate the topology and freeze it.
    pub fn build(self) -> Result<Graph> {
        if let Some(first) = self.deferred.first() {
            return Err(MaestroError::Validation(first.clone()));
        }
        if self.nodes.is_empty() {
            return Err(invalid("graph has no nodes"));
        }

        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
        }

        if self.entry_points.is_empty() {
            return Err(invalid("graph has no entry point"));
        }
        let mut entry_points = Vec::with_capacity(self.entry_points.len());
        for id in &self.entry_points {
            let &i = index
                .get(id)
                .ok_or_else(|| invalid(format!("entry point '{}' is not a node", id)))?;
            entry_points.push(i);
        }

        let mut links = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let from = *index.get(&edge.from).ok_or_else(|| {
                invalid(format!(
                    "edge {} -> {} starts at an unknown node",
                    edge.from, edge.to
                ))
            })?;
            let to = *index.get(&edge.to).ok_or_else(|| {
                invalid(format!(
                    "edge {} -> {} ends at an unknown node",
                    edge.from, edge.to
                ))
            })?;
            if let Some(condition) = &edge.condition {
                for node in condition.referenced_nodes() {
                    if !index.contains_key(node) {
                        return Err(invalid(format!(
                            "condition on edge {} -> {} reads unknown node '{}'",
                            edge.from, edge.to, node
                        )));
                    }
                }
            }
            links.push((from, to));
        }

        let mut config = self.config;
        if self.max_node_executions.is_some() {
            config.max_node_executions = self.max_node_executions;
        }
        if config.max_node_executions == Some(0) {
            return Err(invalid("max_node_executions must be > 0"));
        }
        if config.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be > 0"));
        }

        let n = self.nodes.len();
        let mut incoming = vec![Vec::new(); n];
        let mut outgoing = vec![Vec::new(); n];
        for (e, &(from, to)) in links.iter().enumerate() {
            outgoing[from].push(e);
            incoming[to].push(e);
        }

        let back_edges = find_back_edges(n, &entry_points, &outgoing, &links);
        let cyclic = !back_edges.is_empty();
        if cyclic && config.max_node_executions.is_none() {
            let mut closing: Vec<usize> = back_edges.iter().copied().collect();
            closing.sort_unstable();
            let edge = &self.edges[closing[0]];
            return Err(invalid(format!(
                "cycle through {} -> {} needs max_node_executions",
                edge.from, edge.to
            )));
        }

        let reachable = reachable_from(n, &entry_points, &outgoing, &links);
        let downstream = if cyclic {
            forward_descendants(n, &outgoing, &links, &back_edges)
        } else {
            vec![Vec::new(); n]
        };
        for (i, node) in self.nodes.iter().enumerate() {
            if !reachable[i] {
                warn!(graph = %self.name, node_id = %node.id, "Node is unreachable from every entry point");
            }
        }

        let mut is_entry = vec![false; n];
        for &i in &entry_points {
            is_entry[i] = true;
        }

        debug!(
            graph = %self.name,
            nodes = n,
            edges = self.edges.len(),
            cyclic,
            "Graph built"
        );

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            index,
            edges: self.edges,
            links,
            incoming,
            outgoing,
            back_edges,
            downstream,
            entry_points,
            is_entry,
            cyclic,
            config,
            event_bus: self.event_bus,
        })
    }
}

fn invalid(msg: impl Into<String>) -> MaestroError {
    MaestroError::Validation(msg.into())
}

/// Depth-first search from the entry points (then any remaining node), returning the edges
/// that point back at a node still on the stack.
fn find_back_edges(
    n: usize,
    roots: &[usize],
    outgoing: &[Vec<usize>],
    links: &[(usize, usize)],
) -> HashSet<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut mark = vec![Mark::Unvisited; n];
    let mut back = HashSet::new();

    for root in roots.iter().copied().chain(0..n) {
        if mark[root] != Mark::Unvisited {
            continue;
        }
        mark[root] = Mark::OnStack;
        let mut stack = vec![(root, 0usize)];
        while let Some(frame) = stack.last_mut() {
            let (node, pos) = *frame;
            if pos < outgoing[node].len() {
                frame.1 += 1;
                let e = outgoing[node][pos];
                let target = links[e].1;
                match mark[target] {
                    Mark::Unvisited => {
                        mark[target] = Mark::OnStack;
                        stack.push((target, 0));
                    }
                    Mark::OnStack => {
                        back.insert(e);
                    }
                    Mark::Done => {}
                }
            } else {
                mark[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    back
}

fn reachable_from(
    n: usize,
    roots: &[usize],
    outgoing: &[Vec<usize>],
    links: &[(usize, usize)],
) -> Vec<bool> {
    let mut seen = vec![false; n];
    let mut stack: Vec<usize> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        for &e in &outgoing[node] {
            stack.push(links[e].1);
        }
    }
    seen
}

/// For each node, every node reachable from it without crossing a back edge.
fn forward_descendants(
    n: usize,
    outgoing: &[Vec<usize>],
    links: &[(usize, usize)],
    back_edges: &HashSet<usize>,
) -> Vec<Vec<usize>> {
    (0..n)
        .map(|root| {
            let mut seen = vec![false; n];
            let mut stack = vec![root];
            let mut found = Vec::new();
            while let Some(node) = stack.pop() {
                for &e in &outgoing[node] {
                    let target = links[e].1;
                    if back_edges.contains(&e) || target == root || seen[target] {
                        continue;
                    }
                    seen[target] = true;
                    found.push(target);
                    stack.push(target);
                }
            }
            found
        })
        .collect()
}
