//! TOML topology files.
//!
//! A topology declares one graph, swarm or workflow whose nodes are built-in units. A node's
//! unit may itself be a nested topology, so composite systems fit in one file:
//!
//! ```toml
//! kind = "graph"
//! name = "review"
//! entry_points = ["draft"]
//! max_node_executions = 3
//!
//! [[nodes]]
//! id = "draft"
//! unit = { type = "echo", prefix = "draft:" }
//!
//! [[nodes]]
//! id = "review"
//! unit = { type = "script", steps = [{ type = "output", value = "revise" }, { type = "output", value = "approved" }] }
//!
//! [[edges]]
//! from = "draft"
//! to = "review"
//!
//! [[edges]]
//! from = "review"
//! to = "draft"
//! when = "review contains 'revise'"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use maestro_core::config::{expand_env_vars, GraphConfig, MaestroConfig, SwarmConfig};
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::Invocable;
use maestro_core::types::{NodeId, UnitKind};

use crate::graph::GraphBuilder;
use crate::node::{JoinPolicy, Node, NodeOptions};
use crate::swarm::{SentinelParser, Swarm};
use crate::units::{EchoUnit, FailingUnit, ScriptStep, ScriptedUnit, StaticUnit};
use crate::workflow::{TaskSpec, Workflow};

/// A parsed topology file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    Graph(GraphSpec),
    Swarm(SwarmSpec),
    Workflow(WorkflowSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entry_points: Vec<NodeId>,
    #[serde(default)]
    pub max_node_executions: Option<u32>,
    /// Replaces the `[graph]` defaults from the config file.
    #[serde(default)]
    pub limits: Option<GraphConfig>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwarmSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to the first node.
    #[serde(default)]
    pub entry_point: Option<NodeId>,
    #[serde(default)]
    pub parser: ParserKind,
    /// Regex with a named group `target`, for the sentinel parser.
    #[serde(default)]
    pub sentinel_pattern: Option<String>,
    /// Replaces the `[swarm]` defaults from the config file.
    #[serde(default)]
    pub limits: Option<SwarmConfig>,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub limits: Option<GraphConfig>,
    pub tasks: Vec<TaskEntry>,
}

/// One workflow task plus the unit that performs it.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub task_id: NodeId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub unit: UnitSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub unit: UnitSpec,
    #[serde(default)]
    pub join: JoinPolicy,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeSpec {
    pub from: NodeId,
    pub to: NodeId,
    /// Condition expression; absent means the edge always fires.
    #[serde(default)]
    pub when: Option<String>,
}

/// How swarm outputs are read as handoff signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    #[default]
    Structured,
    Sentinel,
}

/// A built-in unit, or a nested topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitSpec {
    Static {
        #[serde(default)]
        output: Value,
    },
    Echo {
        #[serde(default)]
        prefix: Option<String>,
    },
    Script {
        steps: Vec<ScriptStep>,
    },
    Fail {
        #[serde(default = "default_fail_message")]
        message: String,
    },
    Nested {
        topology: Box<Topology>,
    },
}

fn default_fail_message() -> String {
    "scripted failure".to_string()
}

/// Shared inputs for building a topology tree.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub config: MaestroConfig,
    pub event_bus: Option<Arc<EventBus>>,
}

impl BuildContext {
    pub fn new(config: MaestroConfig) -> Self {
        Self {
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }
}

impl Topology {
    /// Load a topology from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| MaestroError::Config(e.to_string()))
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Graph(_) | Self::Workflow(_) => UnitKind::Graph,
            Self::Swarm(_) => UnitKind::Swarm,
        }
    }

    pub fn name(&self) -> &str {
        let name = match self {
            Self::Graph(g) => g.name.as_deref(),
            Self::Swarm(s) => s.name.as_deref(),
            Self::Workflow(w) => w.name.as_deref(),
        };
        name.unwrap_or(match self {
            Self::Graph(_) => "graph",
            Self::Swarm(_) => "swarm",
            Self::Workflow(_) => "workflow",
        })
    }

    /// Number of top-level nodes or tasks.
    pub fn node_count(&self) -> usize {
        match self {
            Self::Graph(g) => g.nodes.len(),
            Self::Swarm(s) => s.nodes.len(),
            Self::Workflow(w) => w.tasks.len(),
        }
    }

    /// Validate the whole tree and assemble it into one Invocable.
    pub fn build(&self, ctx: &BuildContext) -> Result<Arc<dyn Invocable>> {
        debug!(kind = %self.kind(), name = %self.name(), "Building topology");
        match self {
            Self::Graph(spec) => build_graph(spec, self.name(), ctx),
            Self::Swarm(spec) => build_swarm(spec, self.name(), ctx),
            Self::Workflow(spec) => build_workflow(spec, self.name(), ctx),
        }
    }
}

impl NodeSpec {
    fn options(&self) -> NodeOptions {
        NodeOptions {
            join: self.join,
            priority: self.priority,
            timeout_ms: self.timeout_ms,
            description: self.description.clone(),
        }
    }
}

impl UnitSpec {
    fn build(&self, name: &str, ctx: &BuildContext) -> Result<Arc<dyn Invocable>> {
        let unit: Arc<dyn Invocable> = match self {
            Self::Static { output } => Arc::new(StaticUnit::new(name, output.clone())),
            Self::Echo { prefix } => {
                let echo = EchoUnit::new(name);
                match prefix {
                    Some(p) => Arc::new(echo.with_prefix(p.clone())),
                    None => Arc::new(echo),
                }
            }
            Self::Script { steps } => {
                if steps.is_empty() {
                    return Err(MaestroError::Validation(format!(
                        "script for '{}' has no steps",
                        name
                    )));
                }
                Arc::new(ScriptedUnit::new(name, steps.clone()))
            }
            Self::Fail { message } => Arc::new(FailingUnit::new(name, message.clone())),
            Self::Nested { topology } => topology.build(ctx)?,
        };
        Ok(unit)
    }
}

fn build_graph(spec: &GraphSpec, name: &str, ctx: &BuildContext) -> Result<Arc<dyn Invocable>> {
    let config = spec.limits.clone().unwrap_or_else(|| ctx.config.graph.clone());
    let mut builder = GraphBuilder::new().with_name(name).with_config(config);
    if let Some(bus) = &ctx.event_bus {
        builder = builder.with_event_bus(bus.clone());
    }
    for node in &spec.nodes {
        let unit = node.unit.build(node.id.as_str(), ctx)?;
        builder = builder.add_node_with(node.id.clone(), unit, node.options());
    }
    for edge in &spec.edges {
        builder = match &edge.when {
            Some(expr) => builder.add_conditional_edge(edge.from.clone(), edge.to.clone(), expr),
            None => builder.add_edge(edge.from.clone(), edge.to.clone()),
        };
    }
    for entry in &spec.entry_points {
        builder = builder.set_entry_point(entry.clone());
    }
    if let Some(max) = spec.max_node_executions {
        builder = builder.set_max_node_executions(max);
    }
    Ok(Arc::new(builder.build()?))
}

fn build_swarm(spec: &SwarmSpec, name: &str, ctx: &BuildContext) -> Result<Arc<dyn Invocable>> {
    let config = spec.limits.clone().unwrap_or_else(|| ctx.config.swarm.clone());
    let mut nodes = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        let unit = node.unit.build(node.id.as_str(), ctx)?;
        nodes.push(Node::new(node.id.clone(), unit).with_options(node.options()));
    }
    let entry = match &spec.entry_point {
        Some(id) => id.clone(),
        None => nodes
            .first()
            .map(|n| n.id.clone())
            .ok_or_else(|| MaestroError::Validation("swarm has no nodes".into()))?,
    };

    let mut swarm = Swarm::new(nodes, entry, config)?.with_name(name);
    match (spec.parser, &spec.sentinel_pattern) {
        (ParserKind::Sentinel, Some(pattern)) => {
            swarm = swarm.with_parser(Arc::new(SentinelParser::new(pattern)?));
        }
        (ParserKind::Sentinel, None) => {
            swarm = swarm.with_parser(Arc::new(SentinelParser::default()));
        }
        (ParserKind::Structured, Some(_)) => {
            return Err(MaestroError::Validation(
                "sentinel_pattern requires parser = \"sentinel\"".into(),
            ));
        }
        (ParserKind::Structured, None) => {}
    }
    if let Some(bus) = &ctx.event_bus {
        swarm = swarm.with_event_bus(bus.clone());
    }
    Ok(Arc::new(swarm))
}

fn build_workflow(spec: &WorkflowSpec, name: &str, ctx: &BuildContext) -> Result<Arc<dyn Invocable>> {
    let mut units: HashMap<NodeId, Arc<dyn Invocable>> = HashMap::with_capacity(spec.tasks.len());
    let mut tasks = Vec::with_capacity(spec.tasks.len());
    for entry in &spec.tasks {
        units.insert(
            entry.task_id.clone(),
            entry.unit.build(entry.task_id.as_str(), ctx)?,
        );
        let mut task = TaskSpec::new(entry.task_id.clone(), entry.description.clone())
            .depends_on(entry.dependencies.iter().cloned())
            .with_priority(entry.priority);
        task.timeout_ms = entry.timeout_ms;
        tasks.push(task);
    }

    let config = spec.limits.clone().unwrap_or_else(|| ctx.config.graph.clone());
    let mut workflow = Workflow::new(name, tasks)?.with_config(config);
    if let Some(bus) = &ctx.event_bus {
        workflow = workflow.with_event_bus(bus.clone());
    }
    let graph = workflow.compile(|task| {
        units.get(&task.task_id).cloned().unwrap_or_else(|| {
            Arc::new(FailingUnit::new(task.task_id.as_str(), "no unit for task"))
        })
    })?;
    Ok(Arc::new(graph))
}
