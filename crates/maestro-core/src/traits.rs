use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::state::ExecutionState;
use crate::types::{Invocation, NodeId, UnitKind, UnitOutcome};

/// The one contract shared by leaf units, Graphs and Swarms.
///
/// Returning `Err` means the unit failed. Orchestrators return `Ok` with a non-success
/// `status` when they terminate gracefully (limits, cancellation, partial failure) and attach
/// their trace to the outcome.
pub trait Invocable: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Shape of this unit.
    fn kind(&self) -> UnitKind {
        UnitKind::Leaf
    }

    /// Run the unit once.
    fn execute(&self, invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>>;
}

/// Context passed to a unit for one execution.
#[derive(Clone)]
pub struct UnitContext {
    /// Id of the node this unit is scheduled as.
    pub node_id: NodeId,
    pub execution_index: u32,
    /// Snapshot of the enclosing run's state when the unit was dispatched.
    pub state: Arc<ExecutionState>,
    /// Fires when the enclosing run is cancelled.
    pub cancel: CancellationToken,
}

impl UnitContext {
    pub fn new(
        node_id: NodeId,
        execution_index: u32,
        state: Arc<ExecutionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            execution_index,
            state,
            cancel,
        }
    }

    /// Context for a unit invoked directly, outside any orchestrator.
    pub fn root(node_id: impl Into<NodeId>, invocation: &Invocation) -> Self {
        Self {
            node_id: node_id.into(),
            execution_index: 0,
            state: Arc::new(ExecutionState::new(invocation.task.clone())),
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitContext")
            .field("node_id", &self.node_id)
            .field("execution_index", &self.execution_index)
            .field("run_id", self.state.run_id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
