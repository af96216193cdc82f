use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::config::GraphConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::{EventBus, OrchestrationEvent};
use maestro_core::state::ExecutionState;
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{
    GraphTrace, Invocation, NodeId, NodeResult, NodeStatus, RunId, RunStatus, Trace, UnitKind,
    UnitOutcome,
};

use super::condition::ConditionMemo;
use super::edge::Edge;
use crate::invoke::invoke_unit;
use crate::node::{FailedUpstream, JoinMode, Node};

/// A validated, immutable graph topology. Built with [`GraphBuilder`](super::GraphBuilder).
///
/// One `Graph` may be run any number of times, concurrently; every run gets its own
/// `ExecutionState`.
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: HashMap<NodeId, usize>,
    pub(crate) edges: Vec<Edge>,
    /// (source, target) node indices, parallel to `edges`.
    pub(crate) links: Vec<(usize, usize)>,
    /// Edge indices into and out of each node.
    pub(crate) incoming: Vec<Vec<usize>>,
    pub(crate) outgoing: Vec<Vec<usize>>,
    /// Edges that close a cycle.
    pub(crate) back_edges: HashSet<usize>,
    /// Nodes reachable from each node without crossing a back edge. Empty for acyclic graphs.
    pub(crate) downstream: Vec<Vec<usize>>,
    pub(crate) entry_points: Vec<usize>,
    pub(crate) is_entry: Vec<bool>,
    pub(crate) cyclic: bool,
    pub(crate) config: GraphConfig,
    pub(crate) event_bus: Option<Arc<EventBus>>,
}

/// Outcome of one graph run.
#[derive(Debug, Clone)]
pub struct GraphResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// One successful sink: its output. Several: a map keyed by node id. None: null.
    pub output: Value,
    /// Executed nodes with no active outgoing edge, in declaration order.
    pub sinks: Vec<NodeId>,
    pub trace: GraphTrace,
    pub elapsed_ms: u64,
}

impl GraphResult {
    /// Latest result of `node` (skipped nodes included).
    pub fn node(&self, node: &str) -> Option<&NodeResult> {
        self.trace.results.get(node)
    }

    /// Convert into the aggregated output, mapping unusable statuses to errors.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            RunStatus::Success | RunStatus::PartialFailure => Ok(self.output),
            RunStatus::Failed => {
                let failed = self
                    .trace
                    .executions
                    .iter()
                    .find(|r| r.status == NodeStatus::Failed);
                Err(match failed {
                    Some(r) => MaestroError::execution(
                        r.node_id.as_str(),
                        r.error.clone().unwrap_or_default(),
                    ),
                    None => MaestroError::execution("graph", "no node produced a result"),
                })
            }
            RunStatus::Incomplete => Err(MaestroError::LimitExceeded(
                "graph execution timeout reached".into(),
            )),
            RunStatus::Cancelled => Err(MaestroError::Cancelled),
        }
    }
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn entry_points(&self) -> Vec<&NodeId> {
        self.entry_points.iter().map(|&i| &self.nodes[i].id).collect()
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// How many times any single node may run in one invocation.
    pub fn execution_limit(&self) -> u32 {
        if self.cyclic {
            self.config.max_node_executions.unwrap_or(1)
        } else {
            1
        }
    }

    /// Run the graph on `task`.
    pub async fn run(&self, task: impl Into<Value>) -> Result<GraphResult> {
        self.run_with_cancel(task.into(), CancellationToken::new())
            .await
    }

    /// Run the graph on `task`, stopping with `CANCELLED` once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        task: Value,
        cancel: CancellationToken,
    ) -> Result<GraphResult> {
        let start = Instant::now();
        let deadline = self.config.execution_timeout().map(|t| start + t);
        let mut run = GraphRun::new(self, task);
        let run_id = run.state.run_id().clone();

        info!(
            graph = %self.name,
            run_id = %run_id,
            nodes = self.nodes.len(),
            limit = run.limit,
            "Graph run started"
        );
        self.emit(OrchestrationEvent::RunStarted {
            run_id: run_id.clone(),
            kind: UnitKind::Graph,
            name: self.name.clone(),
        });

        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = false;
        let mut timed_out = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if !timed_out {
                let ready = run.collect_ready();
                if !ready.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(
                        graph = %self.name,
                        run_id = %run_id,
                        waiting = ready.len(),
                        "Graph execution timeout reached, draining in-flight nodes"
                    );
                    timed_out = true;
                } else {
                    let slots = self.config.max_concurrency.saturating_sub(in_flight.len());
                    let batch: Vec<usize> = ready.into_iter().take(slots).collect();
                    if !batch.is_empty() {
                        let started: Vec<(usize, u32, Invocation)> = batch
                            .into_iter()
                            .map(|idx| {
                                let (execution_index, invocation) = run.start(idx);
                                (idx, execution_index, invocation)
                            })
                            .collect();
                        let snapshot = Arc::new(run.state.clone());

                        for (idx, execution_index, invocation) in started {
                            let node = &self.nodes[idx];
                            info!(
                                graph = %self.name,
                                node_id = %node.id,
                                execution_index,
                                "Executing graph node"
                            );
                            self.emit(OrchestrationEvent::NodeStarted {
                                run_id: run_id.clone(),
                                node_id: node.id.clone(),
                                execution_index,
                            });
                            let ctx = UnitContext::new(
                                node.id.clone(),
                                execution_index,
                                snapshot.clone(),
                                cancel.child_token(),
                            );
                            let unit = node.unit.clone();
                            let timeout = node
                                .options
                                .timeout()
                                .or_else(|| self.config.node_timeout());
                            in_flight.push(async move {
                                (idx, invoke_unit(unit, invocation, ctx, timeout).await)
                            });
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(done) = in_flight.next() => done,
            };
            let mut completed = vec![first];
            while let Some(Some(done)) = in_flight.next().now_or_never() {
                completed.push(done);
            }

            for (idx, result) in &completed {
                run.complete(*idx, result.clone())?;
                self.emit(OrchestrationEvent::NodeFinished {
                    run_id: run_id.clone(),
                    node_id: result.node_id.clone(),
                    execution_index: result.execution_index,
                    status: result.status,
                    elapsed_ms: result.elapsed_ms,
                });
            }
            for (idx, _) in &completed {
                if let Err(e) = run.resolve_outgoing(*idx) {
                    error!(graph = %self.name, run_id = %run_id, error = %e, "Edge resolution failed");
                    self.emit(OrchestrationEvent::RunFinished {
                        run_id: run_id.clone(),
                        status: RunStatus::Failed,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                    return Err(e);
                }
            }
        }

        if cancelled {
            warn!(
                graph = %self.name,
                run_id = %run_id,
                abandoned = in_flight.len(),
                "Graph run cancelled"
            );
        }
        drop(in_flight);

        let result = run.finish(cancelled, timed_out, start.elapsed().as_millis() as u64);
        info!(
            graph = %self.name,
            run_id = %run_id,
            status = %result.status,
            executions = result.trace.executions.len(),
            elapsed_ms = result.elapsed_ms,
            "Graph run finished"
        );
        self.emit(OrchestrationEvent::RunFinished {
            run_id,
            status: result.status,
            elapsed_ms: result.elapsed_ms,
        });
        Ok(result)
    }

    fn emit(&self, event: OrchestrationEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

impl Invocable for Graph {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Graph
    }

    fn execute(&self, invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            let result = self
                .run_with_cancel(invocation.as_task(), ctx.cancel.child_token())
                .await?;
            Ok(UnitOutcome::success(result.output)
                .with_status(result.status)
                .with_trace(Trace::Graph(result.trace)))
        })
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("entry_points", &self.entry_points())
            .field("cyclic", &self.cyclic)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    /// Source is running or has yet to run.
    Pending,
    /// Source was skipped, or the edge closes a cycle whose source has not run.
    Dormant,
    Resolved { active: bool, source_index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Finished,
    Skipped,
}

enum Readiness {
    Ready,
    Wait,
    Skip,
    /// A node left behind by a new loop pass keeps its last result and releases its edges.
    Settle,
}

/// Per-invocation scheduler state. The run loop is its only owner.
struct GraphRun<'g> {
    graph: &'g Graph,
    task: Value,
    state: ExecutionState,
    edges: Vec<EdgeState>,
    /// Set once the target has started on this resolution of the edge.
    consumed: Vec<bool>,
    /// Resolved in an earlier loop pass whose source is due to run again. Read as pending.
    stale: Vec<bool>,
    phases: Vec<Phase>,
    memo: ConditionMemo,
    limit: u32,
}

impl<'g> GraphRun<'g> {
    fn new(graph: &'g Graph, task: Value) -> Self {
        let edges = (0..graph.edges.len())
            .map(|e| {
                if graph.back_edges.contains(&e) {
                    EdgeState::Dormant
                } else {
                    EdgeState::Pending
                }
            })
            .collect();
        Self {
            graph,
            state: ExecutionState::new(task.clone()),
            task,
            edges,
            consumed: vec![false; graph.edges.len()],
            stale: vec![false; graph.edges.len()],
            phases: vec![Phase::Waiting; graph.nodes.len()],
            memo: ConditionMemo::new(),
            limit: graph.execution_limit(),
        }
    }

    fn readiness(&self, idx: usize) -> Readiness {
        let node = &self.graph.nodes[idx];
        let count = self.state.execution_count(node.id.as_str());
        let holds_stale = self.graph.outgoing[idx].iter().any(|&e| self.stale[e]);
        if count >= self.limit {
            return if holds_stale {
                Readiness::Settle
            } else {
                Readiness::Wait
            };
        }
        if count == 0 && self.graph.is_entry[idx] {
            return Readiness::Ready;
        }

        let mut fresh = false;
        let mut pending = false;
        for &e in &self.graph.incoming[idx] {
            if self.stale[e] {
                pending = true;
                continue;
            }
            match self.edges[e] {
                EdgeState::Pending => pending = true,
                EdgeState::Resolved { active: true, .. } if !self.consumed[e] => fresh = true,
                _ => {}
            }
        }

        match node.options.join.mode {
            JoinMode::Any if fresh => Readiness::Ready,
            JoinMode::All if fresh && !pending => Readiness::Ready,
            _ if !fresh && !pending && holds_stale => Readiness::Settle,
            _ if count == 0 && !fresh && !pending && self.phases[idx] == Phase::Waiting => {
                Readiness::Skip
            }
            _ => Readiness::Wait,
        }
    }

    /// Skip every node no active path can reach any more, then return the ready nodes,
    /// highest priority first.
    fn collect_ready(&mut self) -> Vec<usize> {
        loop {
            let mut ready = Vec::new();
            let mut skipped_any = false;
            for idx in 0..self.graph.nodes.len() {
                if self.phases[idx] == Phase::Running {
                    continue;
                }
                match self.readiness(idx) {
                    Readiness::Ready => ready.push(idx),
                    Readiness::Skip => {
                        self.skip(idx);
                        skipped_any = true;
                    }
                    Readiness::Settle => {
                        self.settle(idx);
                        skipped_any = true;
                    }
                    Readiness::Wait => {}
                }
            }
            if !skipped_any {
                let nodes = &self.graph.nodes;
                ready.sort_by(|&a, &b| {
                    nodes[b]
                        .options
                        .priority
                        .cmp(&nodes[a].options.priority)
                        .then(a.cmp(&b))
                });
                return ready;
            }
        }
    }

    /// Provisional in a cyclic graph: a later active edge into `idx` makes it ready again.
    fn skip(&mut self, idx: usize) {
        let node_id = &self.graph.nodes[idx].id;
        debug!(graph = %self.graph.name, node_id = %node_id, "No active path reaches node, skipping");
        self.phases[idx] = Phase::Skipped;
        self.state.mark_skipped(node_id);
        for &e in &self.graph.outgoing[idx] {
            self.edges[e] = EdgeState::Dormant;
            self.consumed[e] = false;
            self.stale[e] = false;
        }
        self.graph.emit(OrchestrationEvent::NodeSkipped {
            run_id: self.state.run_id().clone(),
            node_id: node_id.clone(),
        });
    }

    /// No new pass reached `idx`: its outgoing edges keep what its last execution resolved.
    fn settle(&mut self, idx: usize) {
        debug!(
            graph = %self.graph.name,
            node_id = %self.graph.nodes[idx].id,
            "Node not reached on this pass, keeping its last result"
        );
        for &e in &self.graph.outgoing[idx] {
            self.stale[e] = false;
        }
    }

    /// Mark `idx` running: consume its active incoming edges, reopen its outgoing ones and
    /// mark what its forward descendants resolved on the previous pass as stale.
    fn start(&mut self, idx: usize) -> (u32, Invocation) {
        let node_id = &self.graph.nodes[idx].id;
        let execution_index = self.state.begin_execution(node_id);

        let mut upstream = BTreeMap::new();
        for &e in &self.graph.incoming[idx] {
            if let EdgeState::Resolved { active: true, .. } = self.edges[e] {
                if !self.consumed[e] {
                    self.consumed[e] = true;
                    let source = &self.graph.nodes[self.graph.links[e].0].id;
                    match self.state.latest(source.as_str()) {
                        Some(r) if r.succeeded() => {
                            upstream.insert(source.clone(), r.output.clone());
                        }
                        _ => {}
                    }
                }
            }
        }
        for &e in &self.graph.outgoing[idx] {
            self.edges[e] = EdgeState::Pending;
            self.consumed[e] = false;
            self.stale[e] = false;
        }
        for &d in &self.graph.downstream[idx] {
            if self.phases[d] == Phase::Running {
                continue;
            }
            for &e in &self.graph.outgoing[d] {
                if self.graph.back_edges.contains(&e) {
                    continue;
                }
                let fresh = matches!(self.edges[e], EdgeState::Resolved { active: true, .. })
                    && !self.consumed[e];
                if !fresh && self.edges[e] != EdgeState::Pending {
                    self.stale[e] = true;
                }
            }
        }
        self.phases[idx] = Phase::Running;

        let invocation = Invocation::new(self.task.clone()).with_upstream(upstream);
        (execution_index, invocation)
    }

    fn complete(&mut self, idx: usize, result: NodeResult) -> Result<()> {
        self.phases[idx] = Phase::Finished;
        self.state.record_result(result)
    }

    /// Resolve every outgoing edge of a node that just finished.
    fn resolve_outgoing(&mut self, idx: usize) -> Result<()> {
        let node_id = &self.graph.nodes[idx].id;
        let (succeeded, source_index) = match self.state.latest(node_id.as_str()) {
            Some(r) => (r.succeeded(), r.execution_index),
            None => return Ok(()),
        };

        for &e in &self.graph.outgoing[idx] {
            let edge = &self.graph.edges[e];
            let target = self.graph.links[e].1;
            let target_node = &self.graph.nodes[target];

            let mut active = if succeeded {
                match &edge.condition {
                    None => true,
                    Some(condition) => self.memo.evaluate(e, condition, &self.state)?,
                }
            } else {
                edge.condition.is_none()
                    && target_node.options.join.failed_upstream == FailedUpstream::Active
            };

            if active && self.state.execution_count(target_node.id.as_str()) >= self.limit {
                debug!(
                    graph = %self.graph.name,
                    from = %node_id,
                    to = %target_node.id,
                    limit = self.limit,
                    "Target reached its execution limit, edge forced inactive"
                );
                active = false;
            }

            debug!(
                graph = %self.graph.name,
                from = %node_id,
                to = %target_node.id,
                active,
                "Edge resolved"
            );
            self.edges[e] = EdgeState::Resolved {
                active,
                source_index,
            };
            self.consumed[e] = false;
            self.stale[e] = false;
        }
        Ok(())
    }

    /// Executed nodes whose latest execution activated no outgoing edge.
    fn sinks(&self) -> Vec<usize> {
        (0..self.graph.nodes.len())
            .filter(|&idx| {
                let Some(latest) = self.state.latest(self.graph.nodes[idx].id.as_str()) else {
                    return false;
                };
                !self.graph.outgoing[idx].iter().any(|&e| {
                    matches!(
                        self.edges[e],
                        EdgeState::Resolved { active: true, source_index }
                            if source_index == latest.execution_index
                    )
                })
            })
            .collect()
    }

    fn finish(self, cancelled: bool, timed_out: bool, elapsed_ms: u64) -> GraphResult {
        let nodes = &self.graph.nodes;
        let sinks = self.sinks();

        let successful: Vec<&NodeResult> = sinks
            .iter()
            .filter_map(|&idx| self.state.latest(nodes[idx].id.as_str()))
            .filter(|r| r.succeeded())
            .collect();
        let output = match successful.as_slice() {
            [] => Value::Null,
            [only] => only.output.clone(),
            many => Value::Object(
                many.iter()
                    .map(|r| (r.node_id.to_string(), r.output.clone()))
                    .collect(),
            ),
        };

        let executions: Vec<NodeResult> =
            self.state.results_in_order().into_iter().cloned().collect();
        let any_failed = executions.iter().any(|r| r.status == NodeStatus::Failed);
        let entry_failed = self.graph.entry_points.iter().any(|&idx| {
            self.state
                .result_at(nodes[idx].id.as_str(), 0)
                .is_some_and(|r| r.status == NodeStatus::Failed)
        });

        let status = if cancelled {
            RunStatus::Cancelled
        } else if timed_out {
            RunStatus::Incomplete
        } else if entry_failed || (any_failed && successful.is_empty()) {
            RunStatus::Failed
        } else if any_failed {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };

        let mut results = BTreeMap::new();
        for node in nodes {
            if let Some(latest) = self.state.latest(node.id.as_str()) {
                results.insert(node.id.clone(), latest.clone());
            } else if self.state.is_skipped(node.id.as_str()) {
                results.insert(node.id.clone(), NodeResult::skipped(node.id.clone()));
            }
        }

        GraphResult {
            run_id: self.state.run_id().clone(),
            status,
            output,
            sinks: sinks.iter().map(|&idx| nodes[idx].id.clone()).collect(),
            trace: GraphTrace {
                results,
                executions,
            },
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Condition, GraphBuilder};
    use crate::node::{JoinPolicy, NodeOptions};
    use crate::units::{EchoUnit, FailingUnit, FnUnit, ScriptStep, ScriptedUnit, StaticUnit};
    use serde_json::json;
    use std::time::Duration;

    fn fixed(name: &str, output: &str) -> Arc<dyn Invocable> {
        Arc::new(StaticUnit::new(name, output))
    }

    #[tokio::test]
    async fn test_linear_chain() {
        let graph = GraphBuilder::new()
            .add_node("research", Arc::new(EchoUnit::new("r").with_prefix("notes on ")))
            .add_node("write", Arc::new(EchoUnit::new("w")))
            .add_edge("research", "write")
            .set_entry_point("research")
            .build()
            .unwrap();

        let result = graph.run("rust").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.sinks, vec![NodeId::from("write")]);
        assert_eq!(result.output, json!("rust\n[research] notes on rust"));
        assert_eq!(result.trace.execution_order(), vec!["research", "write"]);
    }

    #[tokio::test]
    async fn test_branch_skips_inactive_side() {
        let graph = GraphBuilder::new()
            .add_node("classifier", fixed("c", "technical"))
            .add_node("tech", fixed("t", "tech answer"))
            .add_node("business", fixed("b", "business answer"))
            .add_node("summary", Arc::new(EchoUnit::new("s")))
            .add_conditional_edge("classifier", "tech", r#"classifier == "technical""#)
            .add_conditional_edge("classifier", "business", r#"classifier == "business""#)
            .add_edge("tech", "summary")
            .add_edge("business", "summary")
            .set_entry_point("classifier")
            .build()
            .unwrap();

        let result = graph.run("q").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.trace.status_of("business"), Some(NodeStatus::Skipped));
        assert_eq!(result.trace.execution_count("summary"), 1);
        assert_eq!(result.output, json!("q\n[tech] tech answer"));
    }

    #[tokio::test]
    async fn test_multiple_sinks_yield_map() {
        let graph = GraphBuilder::new()
            .add_node("root", fixed("r", "x"))
            .add_node("left", fixed("l", "L"))
            .add_node("right", fixed("rr", "R"))
            .add_edge("root", "left")
            .add_edge("root", "right")
            .set_entry_point("root")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.output, json!({"left": "L", "right": "R"}));
    }

    #[tokio::test]
    async fn test_bounded_review_loop() {
        let graph = GraphBuilder::new()
            .add_node("code", Arc::new(EchoUnit::new("coder")))
            .add_node(
                "review",
                Arc::new(ScriptedUnit::new(
                    "reviewer",
                    vec![
                        ScriptStep::output("revise"),
                        ScriptStep::output("revise"),
                        ScriptStep::output("approve"),
                    ],
                )),
            )
            .add_node("ship", fixed("s", "shipped"))
            .add_edge("code", "review")
            .add_conditional_edge("review", "code", r#"review contains "revise""#)
            .add_conditional_edge("review", "ship", r#"review contains "approve""#)
            .set_entry_point("code")
            .set_max_node_executions(5)
            .build()
            .unwrap();

        let result = graph.run("feature").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.trace.execution_count("code"), 3);
        assert_eq!(result.trace.execution_count("review"), 3);
        assert_eq!(result.trace.execution_count("ship"), 1);
        assert_eq!(result.output, json!("shipped"));
    }

    #[tokio::test]
    async fn test_loop_stops_at_execution_limit() {
        let graph = GraphBuilder::new()
            .add_node("code", fixed("c", "draft"))
            .add_node("review", fixed("r", "revise"))
            .add_node("ship", fixed("s", "shipped"))
            .add_edge("code", "review")
            .add_conditional_edge("review", "code", r#"review contains "revise""#)
            .add_conditional_edge("review", "ship", r#"review contains "approve""#)
            .set_entry_point("code")
            .set_max_node_executions(2)
            .build()
            .unwrap();

        let result = graph.run("feature").await.unwrap();
        assert_eq!(result.trace.execution_count("code"), 2);
        assert_eq!(result.trace.execution_count("review"), 2);
        assert_eq!(result.trace.status_of("ship"), Some(NodeStatus::Skipped));
        assert_eq!(result.sinks, vec![NodeId::from("review")]);
    }

    #[tokio::test]
    async fn test_failure_contained_to_branch() {
        let graph = GraphBuilder::new()
            .add_node("root", fixed("r", "x"))
            .add_node("broken", Arc::new(FailingUnit::new("b", "tool crashed")))
            .add_node("after_broken", fixed("a", "never"))
            .add_node("healthy", fixed("h", "fine"))
            .add_edge("root", "broken")
            .add_edge("broken", "after_broken")
            .add_edge("root", "healthy")
            .set_entry_point("root")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.status, RunStatus::PartialFailure);
        assert_eq!(result.trace.status_of("broken"), Some(NodeStatus::Failed));
        assert_eq!(result.trace.status_of("after_broken"), Some(NodeStatus::Skipped));
        assert_eq!(result.output, json!("fine"));
    }

    #[tokio::test]
    async fn test_failed_entry_point_fails_run() {
        let graph = GraphBuilder::new()
            .add_node("start", Arc::new(FailingUnit::new("s", "no input")))
            .add_node("next", fixed("n", "x"))
            .add_edge("start", "next")
            .set_entry_point("start")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(matches!(
            result.into_result().unwrap_err(),
            MaestroError::Execution { .. }
        ));
    }

    #[tokio::test]
    async fn test_tolerant_join_runs_after_failure() {
        let graph = GraphBuilder::new()
            .add_node("start", fixed("s", "x"))
            .add_node("flaky", Arc::new(FailingUnit::new("f", "timeout")))
            .add_node_with(
                "report",
                Arc::new(EchoUnit::new("r")),
                NodeOptions::default().with_join(JoinPolicy::all().tolerate_failures()),
            )
            .add_edge("start", "flaky")
            .add_edge("start", "report")
            .add_edge("flaky", "report")
            .set_entry_point("start")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.status, RunStatus::PartialFailure);
        assert_eq!(result.trace.execution_count("report"), 1);
        let report = result.node("report").unwrap();
        assert_eq!(report.output, json!("go\n[start] x"));
    }

    #[tokio::test]
    async fn test_any_join_runs_once_in_dag() {
        let graph = GraphBuilder::new()
            .add_node("a", fixed("a", "A"))
            .add_node("b", fixed("b", "B"))
            .add_node_with(
                "first",
                Arc::new(EchoUnit::new("f")),
                NodeOptions::default().with_join(JoinPolicy::any()),
            )
            .add_edge("a", "first")
            .add_edge("b", "first")
            .set_entry_point("a")
            .set_entry_point("b")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.trace.execution_count("first"), 1);
    }

    #[tokio::test]
    async fn test_condition_on_missing_node_is_routing_error() {
        let graph = GraphBuilder::new()
            .add_node("a", fixed("a", "A"))
            .add_node("b", fixed("b", "B"))
            .add_node("c", fixed("c", "C"))
            .add_edge("a", "b")
            .add_edge_when("a", "c", Condition::expr(r#"b == "B""#).unwrap())
            .set_entry_point("a")
            .build()
            .unwrap();

        let err = graph.run("go").await.unwrap_err();
        assert!(matches!(err, MaestroError::Routing(_)));
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch_under_pool_limit() {
        let graph = GraphBuilder::new()
            .add_node_with("low", fixed("l", "l"), NodeOptions::default().with_priority(1))
            .add_node_with("high", fixed("h", "h"), NodeOptions::default().with_priority(9))
            .set_entry_point("low")
            .set_entry_point("high")
            .with_config(GraphConfig {
                max_concurrency: 1,
                ..GraphConfig::default()
            })
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.trace.execution_order(), vec!["high", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout_is_incomplete() {
        let graph = GraphBuilder::new()
            .add_node(
                "slow",
                Arc::new(ScriptedUnit::new(
                    "slow",
                    vec![ScriptStep::Output {
                        value: json!("late"),
                        delay_ms: 1_000,
                    }],
                )),
            )
            .add_node("next", fixed("n", "x"))
            .add_edge("slow", "next")
            .set_entry_point("slow")
            .with_config(GraphConfig {
                execution_timeout_ms: Some(10),
                ..GraphConfig::default()
            })
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.status, RunStatus::Incomplete);
        assert_eq!(result.trace.status_of("slow"), Some(NodeStatus::Success));
        assert!(result.node("next").is_none());
    }

    #[tokio::test]
    async fn test_cancellation_preserves_recorded_results() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let graph = GraphBuilder::new()
            .add_node("first", fixed("f", "done"))
            .add_node(
                "stuck",
                Arc::new(FnUnit::new("stuck", move |_inv, ctx: UnitContext| {
                    let trigger = trigger.clone();
                    async move {
                        trigger.cancel();
                        ctx.cancel.cancelled().await;
                        Err(MaestroError::Cancelled)
                    }
                })),
            )
            .add_edge("first", "stuck")
            .set_entry_point("first")
            .build()
            .unwrap();

        let result = graph.run_with_cancel(json!("go"), cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.trace.status_of("first"), Some(NodeStatus::Success));
    }

    #[tokio::test]
    async fn test_node_timeout_fails_node() {
        let graph = GraphBuilder::new()
            .add_node_with(
                "slow",
                Arc::new(ScriptedUnit::new(
                    "slow",
                    vec![ScriptStep::Output {
                        value: json!("late"),
                        delay_ms: 2_000,
                    }],
                )),
                NodeOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .set_entry_point("slow")
            .build()
            .unwrap();

        let result = graph.run("go").await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_nested_graph_as_node() {
        let inner = GraphBuilder::new()
            .with_name("inner")
            .add_node("draft", Arc::new(EchoUnit::new("d").with_prefix("draft: ")))
            .set_entry_point("draft")
            .build()
            .unwrap();

        let outer = GraphBuilder::new()
            .add_node("plan", fixed("p", "plan"))
            .add_node("inner", Arc::new(inner))
            .add_edge("plan", "inner")
            .set_entry_point("plan")
            .build()
            .unwrap();

        let result = outer.run("topic").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        let nested = result.node("inner").unwrap();
        assert!(matches!(nested.trace.as_deref(), Some(Trace::Graph(_))));
        let text = nested.text();
        assert!(text.starts_with("draft: "));
        assert!(text.contains("\"upstream\""));
    }

    #[tokio::test]
    async fn test_join_receives_every_upstream_output() {
        use maestro_test_utils::MockUnit;

        let join = Arc::new(MockUnit::returning("merge", "merged"));
        let graph = GraphBuilder::new()
            .add_node("left", fixed("l", "from left"))
            .add_node("right", fixed("r", "from right"))
            .add_node("merge", join.clone())
            .add_edge("left", "merge")
            .add_edge("right", "merge")
            .set_entry_point("left")
            .set_entry_point("right")
            .build()
            .unwrap();

        let result = graph.run("input").await.unwrap();
        assert_eq!(result.output, json!("merged"));
        assert_eq!(join.call_count(), 1);
        let call = &join.calls()[0];
        assert_eq!(call.task, json!("input"));
        assert_eq!(call.upstream.get("left"), Some(&json!("from left")));
        assert_eq!(call.upstream.get("right"), Some(&json!("from right")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_join_waits_for_longer_branch_on_every_pass() {
        use maestro_test_utils::{MockStep, MockUnit};

        let lint = |name: &str| {
            Arc::new(
                MockUnit::returning(name, format!("{} clean", name))
                    .with_delay(Duration::from_millis(50)),
            )
        };
        let review = Arc::new(MockUnit::returning("review", "looks fine"));
        let lint2 = lint("lint2");
        let merge = Arc::new(MockUnit::script(
            "merge",
            vec![
                MockStep::Output(json!("revise")),
                MockStep::Output(json!("merged")),
            ],
        ));
        let graph = GraphBuilder::new()
            .add_node("code", Arc::new(EchoUnit::new("code")))
            .add_node("review", review.clone())
            .add_node("lint1", lint("lint1"))
            .add_node("lint2", lint2.clone())
            .add_node("merge", merge.clone())
            .add_edge("code", "review")
            .add_edge("code", "lint1")
            .add_edge("lint1", "lint2")
            .add_edge("review", "merge")
            .add_edge("lint2", "merge")
            .add_conditional_edge("merge", "code", "merge contains 'revise'")
            .set_entry_point("code")
            .set_max_node_executions(3)
            .build()
            .unwrap();

        let result = graph.run("patch").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, json!("merged"));
        assert_eq!(merge.call_count(), 2);
        assert_eq!(review.call_count(), 2);
        assert_eq!(lint2.call_count(), 2);
        for call in merge.calls() {
            assert_eq!(call.upstream.get("review"), Some(&json!("looks fine")));
            assert_eq!(call.upstream.get("lint2"), Some(&json!("lint2 clean")));
        }

        let order = result.trace.execution_order();
        let second_merge = order.iter().rposition(|n| n.as_str() == "merge").unwrap();
        let second_lint = order.iter().rposition(|n| n.as_str() == "lint2").unwrap();
        assert!(second_lint < second_merge);
    }

    #[tokio::test]
    async fn test_branch_dropped_on_later_pass_releases_join() {
        use maestro_test_utils::{MockStep, MockUnit};

        let slow = Arc::new(MockUnit::returning("slow", "deep analysis"));
        let merge = Arc::new(MockUnit::script(
            "merge",
            vec![
                MockStep::Output(json!("revise")),
                MockStep::Output(json!("merged")),
            ],
        ));
        let graph = GraphBuilder::new()
            .add_node(
                "code",
                Arc::new(ScriptedUnit::new(
                    "code",
                    vec![ScriptStep::output("slow path"), ScriptStep::output("quick")],
                )),
            )
            .add_node("fast", fixed("f", "quick check"))
            .add_node("slow", slow.clone())
            .add_node("merge", merge.clone())
            .add_edge("code", "fast")
            .add_conditional_edge("code", "slow", "code contains 'slow'")
            .add_edge("fast", "merge")
            .add_edge("slow", "merge")
            .add_conditional_edge("merge", "code", "merge contains 'revise'")
            .set_entry_point("code")
            .set_max_node_executions(3)
            .build()
            .unwrap();

        let result = graph.run("patch").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, json!("merged"));
        assert_eq!(slow.call_count(), 1);
        assert_eq!(merge.call_count(), 2);
        let second = &merge.calls()[1];
        assert_eq!(second.upstream.get("fast"), Some(&json!("quick check")));
        assert!(second.upstream.get("slow").is_none());
        assert_eq!(result.sinks, vec![NodeId::from("merge")]);
    }
}
