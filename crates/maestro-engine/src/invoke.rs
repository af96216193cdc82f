use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use maestro_core::error::MaestroError;
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{Invocation, NodeResult};

/// Run one unit and fold whatever happens into a `NodeResult`.
///
/// Errors never escape: a unit error, a timeout and a nested orchestrator that ended
/// FAILED / INCOMPLETE / CANCELLED all become a `Failed` result. The nested trace is kept
/// either way.
pub async fn invoke_unit(
    unit: Arc<dyn Invocable>,
    invocation: Invocation,
    ctx: UnitContext,
    timeout: Option<Duration>,
) -> NodeResult {
    let node_id = ctx.node_id.clone();
    let execution_index = ctx.execution_index;
    let start = Instant::now();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, unit.execute(invocation, ctx)).await {
            Ok(res) => res,
            Err(_) => Err(MaestroError::NodeTimeout {
                node: node_id.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        },
        None => unit.execute(invocation, ctx).await,
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let mut result = match outcome {
        Ok(outcome) if outcome.status.is_usable() => {
            let mut result = NodeResult::success(node_id.clone(), execution_index, outcome.output);
            result.trace = outcome.trace.map(Box::new);
            result
        }
        Ok(outcome) => {
            warn!(
                node_id = %node_id,
                unit = unit.name(),
                status = %outcome.status,
                "Nested run did not succeed"
            );
            let mut result = NodeResult::failed(
                node_id.clone(),
                execution_index,
                format!("nested {} run ended {}", unit.kind(), outcome.status),
            );
            result.output = outcome.output;
            result.trace = outcome.trace.map(Box::new);
            result
        }
        Err(e) => {
            error!(node_id = %node_id, unit = unit.name(), error = %e, "Unit failed");
            NodeResult::failed(node_id.clone(), execution_index, e.to_string())
        }
    };
    result.elapsed_ms = elapsed_ms;

    debug!(
        node_id = %node_id,
        execution_index,
        status = %result.status,
        elapsed_ms,
        "Unit returned"
    );
    result
}
