use maestro_core::types::NodeId;

use super::condition::Condition;

/// A directed dependency between two graph nodes.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source node id.
    pub from: NodeId,
    /// Target node id.
    pub to: NodeId,
    /// Guard evaluated once the source has succeeded. `None` always passes.
    pub condition: Option<Condition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create an edge guarded by `condition`.
    pub fn when(from: impl Into<NodeId>, to: impl Into<NodeId>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }

    /// Create an edge guarded by a textual expression.
    pub fn conditional(
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        expr: &str,
    ) -> maestro_core::Result<Self> {
        Ok(Self::when(from, to, Condition::expr(expr)?))
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}
