use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use maestro_core::traits::Invocable;
use maestro_core::types::NodeId;

/// How a graph node with several incoming edges decides it is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait until every incoming edge is resolved, then run if at least one is active.
    #[default]
    All,
    /// Run as soon as any incoming edge is active.
    Any,
}

/// Whether an unconditioned edge out of a failed node counts as active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedUpstream {
    #[default]
    Inactive,
    Active,
}

/// Per-node join policy. Conditioned edges out of a failed node are always inactive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPolicy {
    #[serde(default)]
    pub mode: JoinMode,
    #[serde(default)]
    pub failed_upstream: FailedUpstream,
}

impl JoinPolicy {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn any() -> Self {
        Self {
            mode: JoinMode::Any,
            ..Self::default()
        }
    }

    /// Let unconditioned edges from failed predecessors trigger this node.
    pub fn tolerate_failures(mut self) -> Self {
        self.failed_upstream = FailedUpstream::Active;
        self
    }
}

/// Scheduling options attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOptions {
    #[serde(default)]
    pub join: JoinPolicy,
    /// Higher runs first when more nodes are ready than the pool admits.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NodeOptions {
    pub fn with_join(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A scheduled unit: an id plus the Invocable it runs.
///
/// Nodes carry no execution-local state, so one node can take part in any number of
/// concurrent runs of the topology that owns it.
#[derive(Clone)]
pub struct Node {
    pub id: NodeId,
    pub unit: Arc<dyn Invocable>,
    pub options: NodeOptions,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, unit: Arc<dyn Invocable>) -> Self {
        Self {
            id: id.into(),
            unit,
            options: NodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_join(mut self, join: JoinPolicy) -> Self {
        self.options.join = join;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("unit", &self.unit.name())
            .field("kind", &self.unit.kind())
            .field("options", &self.options)
            .finish()
    }
}
