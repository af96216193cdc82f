use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::config::SwarmConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::{EventBus, OrchestrationEvent};
use maestro_core::state::ExecutionState;
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{
    HandoffRecord, HandoffSignal, Invocation, NodeId, RunId, RunStatus, SwarmTrace, Trace,
    TranscriptEntry, UnitKind, UnitOutcome,
};

use super::signal::{HandoffParser, StructuredParser};
use crate::invoke::invoke_unit;
use crate::node::Node;

/// A set of peer units that pass one baton between them.
///
/// Exactly one unit runs at a time. Each unit sees the whole transcript so far and chooses,
/// through its output, to hand off to any registered node (including one that already ran) or
/// to complete the run.
pub struct Swarm {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    entry: usize,
    config: SwarmConfig,
    parser: Arc<dyn HandoffParser>,
    event_bus: Option<Arc<EventBus>>,
}

/// Outcome of one swarm run.
#[derive(Debug, Clone)]
pub struct SwarmResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Completion output, or the last output produced before the run stopped.
    pub output: Value,
    pub handoff_count: u32,
    /// Number of unit invocations.
    pub iteration_count: u32,
    pub trace: SwarmTrace,
    pub elapsed_ms: u64,
    /// Why the run stopped, when it did not complete.
    pub error: Option<String>,
}

impl SwarmResult {
    pub fn node_history(&self) -> &[NodeId] {
        &self.trace.node_history
    }

    pub fn handoffs(&self) -> &[HandoffRecord] {
        &self.trace.handoffs
    }

    /// Convert into the completion output, mapping other statuses to errors.
    pub fn into_result(self) -> Result<Value> {
        let reason = self.error.unwrap_or_default();
        match self.status {
            RunStatus::Success | RunStatus::PartialFailure => Ok(self.output),
            RunStatus::Failed => {
                let node = self
                    .trace
                    .node_history
                    .last()
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                Err(MaestroError::execution(node, reason))
            }
            RunStatus::Incomplete => Err(MaestroError::LimitExceeded(reason)),
            RunStatus::Cancelled => Err(MaestroError::Cancelled),
        }
    }
}

impl Swarm {
    /// Validate and assemble a swarm.
    pub fn new(
        nodes: Vec<Node>,
        entry_point: impl Into<NodeId>,
        config: SwarmConfig,
    ) -> Result<Self> {
        let entry_point = entry_point.into();
        if nodes.is_empty() {
            return Err(MaestroError::Validation("swarm has no nodes".into()));
        }
        config.validate()?;

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(MaestroError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        let entry = *index.get(&entry_point).ok_or_else(|| {
            MaestroError::Validation(format!("entry point '{}' is not a node", entry_point))
        })?;

        Ok(Self {
            name: "swarm".to_string(),
            nodes,
            index,
            entry,
            config,
            parser: Arc::new(StructuredParser),
            event_bus: None,
        })
    }

    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::new()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn HandoffParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn entry_point(&self) -> &NodeId {
        &self.nodes[self.entry].id
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub async fn run(&self, task: impl Into<Value>) -> Result<SwarmResult> {
        self.run_with_cancel(task.into(), CancellationToken::new())
            .await
    }

    /// Run the swarm on `task`.
    ///
    /// Limits and the deadline are checked between turns: a unit that overruns the deadline
    /// finishes its turn before the run stops with `INCOMPLETE`.
    pub async fn run_with_cancel(
        &self,
        task: Value,
        cancel: CancellationToken,
    ) -> Result<SwarmResult> {
        let start = Instant::now();
        let deadline = start + self.config.execution_timeout();
        let mut state = ExecutionState::new(task.clone());
        let run_id = state.run_id().clone();

        let mut trace = SwarmTrace::default();
        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        let mut current = self.entry;
        let mut payload: Option<Value> = None;
        let mut handoffs = 0u32;
        let mut iterations = 0u32;

        info!(
            swarm = %self.name,
            run_id = %run_id,
            entry = %self.nodes[self.entry].id,
            max_handoffs = self.config.max_handoffs,
            max_iterations = self.config.max_iterations,
            "Swarm run started"
        );
        self.emit(OrchestrationEvent::RunStarted {
            run_id: run_id.clone(),
            kind: UnitKind::Swarm,
            name: self.name.clone(),
        });

        let (status, output, reason) = loop {
            if cancel.is_cancelled() {
                break (
                    RunStatus::Cancelled,
                    last_output(&transcript),
                    Some("run cancelled".to_string()),
                );
            }
            if Instant::now() >= deadline {
                break (
                    RunStatus::Incomplete,
                    last_output(&transcript),
                    Some(format!(
                        "execution timeout of {}ms reached",
                        self.config.execution_timeout_ms
                    )),
                );
            }

            iterations += 1;
            let node = &self.nodes[current];
            let execution_index = state.begin_execution(&node.id);
            info!(
                swarm = %self.name,
                node_id = %node.id,
                execution_index,
                iteration = iterations,
                "Executing swarm node"
            );
            self.emit(OrchestrationEvent::NodeStarted {
                run_id: run_id.clone(),
                node_id: node.id.clone(),
                execution_index,
            });

            let mut invocation = Invocation::new(task.clone()).with_transcript(transcript.clone());
            if let Some(p) = payload.take() {
                invocation = invocation.with_payload(p);
            }
            let ctx = UnitContext::new(
                node.id.clone(),
                execution_index,
                Arc::new(state.clone()),
                cancel.child_token(),
            );
            let timeout = node
                .options
                .timeout()
                .or_else(|| self.config.node_timeout());

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break (
                        RunStatus::Cancelled,
                        last_output(&transcript),
                        Some(format!("run cancelled while {} was active", node.id)),
                    );
                }
                r = invoke_unit(node.unit.clone(), invocation, ctx, timeout) => r,
            };

            state.record_result(result.clone())?;
            trace.node_history.push(node.id.clone());
            trace.results.push(result.clone());
            self.emit(OrchestrationEvent::NodeFinished {
                run_id: run_id.clone(),
                node_id: node.id.clone(),
                execution_index,
                status: result.status,
                elapsed_ms: result.elapsed_ms,
            });

            if !result.succeeded() {
                warn!(
                    swarm = %self.name,
                    node_id = %node.id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Swarm node failed, ending run"
                );
                break (
                    RunStatus::Failed,
                    last_output(&transcript),
                    result.error.clone(),
                );
            }

            transcript.push(TranscriptEntry {
                node_id: node.id.clone(),
                output: result.output.clone(),
                timestamp: result.timestamp,
            });

            let signal = match self.parser.parse(&result.output) {
                Ok(signal) => signal,
                Err(e) => return Err(self.abort(&run_id, start, e)),
            };

            match signal {
                HandoffSignal::Complete { output } => {
                    debug!(swarm = %self.name, node_id = %node.id, "Swarm node completed the run");
                    break (RunStatus::Success, output, None);
                }
                HandoffSignal::Handoff { target, payload: p } => {
                    let Some(&next) = self.index.get(&target) else {
                        let e = MaestroError::Routing(format!(
                            "{} handed off to unknown node '{}'",
                            node.id, target
                        ));
                        return Err(self.abort(&run_id, start, e));
                    };

                    handoffs += 1;
                    let record = HandoffRecord {
                        from: node.id.clone(),
                        to: target.clone(),
                        iteration: handoffs,
                        timestamp: Utc::now(),
                        payload: p.clone(),
                    };
                    info!(
                        swarm = %self.name,
                        from = %record.from,
                        to = %record.to,
                        handoffs,
                        "Handoff"
                    );
                    self.emit(OrchestrationEvent::Handoff {
                        run_id: run_id.clone(),
                        from: record.from.clone(),
                        to: record.to.clone(),
                        iteration: handoffs,
                    });
                    state.record_handoff(record.clone());
                    trace.handoffs.push(record);

                    let stop = if handoffs >= self.config.max_handoffs {
                        Some(format!("max_handoffs ({}) reached", self.config.max_handoffs))
                    } else if iterations >= self.config.max_iterations {
                        Some(format!(
                            "max_iterations ({}) reached",
                            self.config.max_iterations
                        ))
                    } else if Instant::now() >= deadline {
                        Some(format!(
                            "execution timeout of {}ms reached",
                            self.config.execution_timeout_ms
                        ))
                    } else if self.is_repetitive(&trace.node_history, &target) {
                        Some(format!(
                            "repetitive handoffs: fewer than {} distinct nodes in the last {}",
                            self.config.repetitive_handoff_min_unique,
                            self.config.repetitive_handoff_window
                        ))
                    } else {
                        None
                    };
                    if let Some(reason) = stop {
                        warn!(swarm = %self.name, run_id = %run_id, reason = %reason, "Swarm stopped before handoff");
                        break (RunStatus::Incomplete, result.output.clone(), Some(reason));
                    }

                    current = next;
                    payload = (!p.is_null()).then_some(p);
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            swarm = %self.name,
            run_id = %run_id,
            status = %status,
            handoffs,
            iterations,
            elapsed_ms,
            "Swarm run finished"
        );
        self.emit(OrchestrationEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            elapsed_ms,
        });

        Ok(SwarmResult {
            run_id,
            status,
            output,
            handoff_count: handoffs,
            iteration_count: iterations,
            trace,
            elapsed_ms,
            error: reason,
        })
    }

    /// Whether following a handoff to `next` keeps the run bouncing between too few nodes.
    fn is_repetitive(&self, history: &[NodeId], next: &NodeId) -> bool {
        let window = self.config.repetitive_handoff_window;
        if window == 0 {
            return false;
        }
        let sequence: Vec<&NodeId> = history.iter().chain(std::iter::once(next)).collect();
        if sequence.len() < window {
            return false;
        }
        let recent: HashSet<&NodeId> = sequence[sequence.len() - window..].iter().copied().collect();
        recent.len() < self.config.repetitive_handoff_min_unique
    }

    fn abort(&self, run_id: &RunId, start: Instant, e: MaestroError) -> MaestroError {
        error!(swarm = %self.name, run_id = %run_id, error = %e, "Swarm routing failed");
        self.emit(OrchestrationEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Failed,
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
        e
    }

    fn emit(&self, event: OrchestrationEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

fn last_output(transcript: &[TranscriptEntry]) -> Value {
    transcript
        .last()
        .map(|t| t.output.clone())
        .unwrap_or(Value::Null)
}

impl Invocable for Swarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Swarm
    }

    fn execute(&self, invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            let result = self
                .run_with_cancel(invocation.as_task(), ctx.cancel.child_token())
                .await?;
            Ok(UnitOutcome::success(result.output)
                .with_status(result.status)
                .with_trace(Trace::Swarm(result.trace)))
        })
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("entry_point", self.entry_point())
            .field("config", &self.config)
            .finish()
    }
}

/// Fluent construction of a [`Swarm`]. The entry point defaults to the first node added.
pub struct SwarmBuilder {
    name: String,
    nodes: Vec<Node>,
    entry_point: Option<NodeId>,
    config: SwarmConfig,
    parser: Option<Arc<dyn HandoffParser>>,
    event_bus: Option<Arc<EventBus>>,
}

impl Default for SwarmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmBuilder {
    pub fn new() -> Self {
        Self {
            name: "swarm".to_string(),
            nodes: Vec::new(),
            entry_point: None,
            config: SwarmConfig::default(),
            parser: None,
            event_bus: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_node(mut self, id: impl Into<NodeId>, unit: Arc<dyn Invocable>) -> Self {
        self.nodes.push(Node::new(id, unit));
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn set_entry_point(mut self, id: impl Into<NodeId>) -> Self {
        self.entry_point = Some(id.into());
        self
    }

    pub fn with_config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_handoffs(mut self, max: u32) -> Self {
        self.config.max_handoffs = max;
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn node_timeout(mut self, timeout: Duration) -> Self {
        self.config.node_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Stop when the last `window` visited nodes contain fewer than `min_unique` distinct ids.
    pub fn repetitive_handoff_detection(mut self, window: usize, min_unique: usize) -> Self {
        self.config.repetitive_handoff_window = window;
        self.config.repetitive_handoff_min_unique = min_unique;
        self
    }

    pub fn parser(mut self, parser: impl HandoffParser) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Swarm> {
        let entry = match self.entry_point {
            Some(id) => id,
            None => self
                .nodes
                .first()
                .map(|n| n.id.clone())
                .ok_or_else(|| MaestroError::Validation("swarm has no nodes".into()))?,
        };
        let mut swarm = Swarm::new(self.nodes, entry, self.config)?.with_name(self.name);
        if let Some(parser) = self.parser {
            swarm = swarm.with_parser(parser);
        }
        if let Some(bus) = self.event_bus {
            swarm = swarm.with_event_bus(bus);
        }
        Ok(swarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::SentinelParser;
    use crate::units::{FailingUnit, FnUnit, ScriptStep, ScriptedUnit, StaticUnit};
    use serde_json::json;

    fn script(name: &str, steps: Vec<ScriptStep>) -> Arc<dyn Invocable> {
        Arc::new(ScriptedUnit::new(name, steps))
    }

    #[tokio::test]
    async fn test_backtracking_needs_no_special_case() {
        let swarm = Swarm::builder()
            .add_node(
                "a",
                script("a", vec![ScriptStep::handoff("b")]),
            )
            .add_node(
                "b",
                script("b", vec![ScriptStep::handoff("a"), ScriptStep::complete("merged")]),
            )
            .build()
            .unwrap();

        let result = swarm.run("task").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, json!("merged"));
        assert_eq!(result.node_history(), &["a", "b", "a", "b"].map(NodeId::from));
        assert_eq!(result.handoff_count, 3);
        assert_eq!(result.iteration_count, 4);
        let hops: Vec<(&str, &str)> = result
            .handoffs()
            .iter()
            .map(|h| (h.from.as_str(), h.to.as_str()))
            .collect();
        assert_eq!(hops, vec![("a", "b"), ("b", "a"), ("a", "b")]);
    }

    #[tokio::test]
    async fn test_max_handoffs_is_incomplete() {
        let chain = ["n0", "n1", "n2", "n3", "n4", "n5"];
        let mut builder = Swarm::builder().max_handoffs(2);
        for pair in chain.windows(2) {
            builder = builder.add_node(pair[0], script(pair[0], vec![ScriptStep::handoff(pair[1])]));
        }
        builder = builder.add_node("n5", Arc::new(StaticUnit::new("n5", "end")));
        let swarm = builder.build().unwrap();

        let result = swarm.run("task").await.unwrap();
        assert_eq!(result.status, RunStatus::Incomplete);
        assert_eq!(result.handoff_count, 2);
        assert_eq!(result.node_history(), &["n0", "n1"].map(NodeId::from));
        assert!(matches!(
            result.into_result().unwrap_err(),
            MaestroError::LimitExceeded(_)
        ));
    }

    #[tokio::test]
    async fn test_max_iterations_is_incomplete() {
        let swarm = Swarm::builder()
            .add_node("ping", script("ping", vec![ScriptStep::handoff("pong")]))
            .add_node("pong", script("pong", vec![ScriptStep::handoff("ping")]))
            .max_iterations(3)
            .build()
            .unwrap();

        let result = swarm.run("task").await.unwrap();
        assert_eq!(result.status, RunStatus::Incomplete);
        assert_eq!(result.iteration_count, 3);
        assert!(result.error.unwrap().contains("max_iterations"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_checked_between_turns() {
        let swarm = Swarm::builder()
            .add_node(
                "slow",
                script(
                    "slow",
                    vec![ScriptStep::Handoff {
                        target: NodeId::from("next"),
                        payload: Value::Null,
                        delay_ms: 1_000,
                    }],
                ),
            )
            .add_node("next", Arc::new(StaticUnit::new("next", "never")))
            .execution_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        let result = swarm.run("task").await.unwrap();
        assert_eq!(result.status, RunStatus::Incomplete);
        assert_eq!(result.node_history(), &[NodeId::from("slow")]);
        assert!(result.trace.results[0].succeeded());
        assert!(result.elapsed_ms >= 1_000);
    }

    #[tokio::test]
    async fn test_unit_failure_fails_run() {
        let swarm = Swarm::builder()
            .add_node("triage", script("t", vec![ScriptStep::handoff("billing")]))
            .add_node("billing", Arc::new(FailingUnit::new("b", "ledger offline")))
            .build()
            .unwrap();

        let result = swarm.run("refund").await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.trace.handoffs.len(), 1);
        assert!(result.error.as_deref().unwrap().contains("ledger offline"));
    }

    #[tokio::test]
    async fn test_unknown_target_is_routing_error() {
        let swarm = Swarm::builder()
            .add_node("triage", script("t", vec![ScriptStep::handoff("nobody")]))
            .build()
            .unwrap();

        let err = swarm.run("x").await.unwrap_err();
        assert!(matches!(err, MaestroError::Routing(_)));
    }

    #[tokio::test]
    async fn test_units_see_full_transcript_and_payload() {
        let checker = FnUnit::new("checker", |inv: Invocation, _ctx| async move {
            let seen: Vec<String> = inv.transcript.iter().map(|t| t.node_id.to_string()).collect();
            Ok(UnitOutcome::success(
                HandoffSignal::complete(json!({
                    "seen": seen,
                    "payload": inv.payload,
                    "task": inv.task,
                }))
                .to_value(),
            ))
        });
        let swarm = Swarm::builder()
            .add_node(
                "first",
                script(
                    "first",
                    vec![ScriptStep::Handoff {
                        target: NodeId::from("second"),
                        payload: json!({"ticket": 12}),
                        delay_ms: 0,
                    }],
                ),
            )
            .add_node("second", script("second", vec![ScriptStep::handoff("checker")]))
            .add_node("checker", Arc::new(checker))
            .build()
            .unwrap();

        let result = swarm.run("help").await.unwrap();
        assert_eq!(result.output["seen"], json!(["first", "second"]));
        assert_eq!(result.output["payload"], Value::Null);
        assert_eq!(result.output["task"], json!("help"));
        assert_eq!(result.handoffs()[0].payload, json!({"ticket": 12}));
    }

    #[tokio::test]
    async fn test_repetitive_handoffs_stop_run() {
        let swarm = Swarm::builder()
            .add_node("a", script("a", vec![ScriptStep::handoff("b")]))
            .add_node("b", script("b", vec![ScriptStep::handoff("a")]))
            .add_node("c", Arc::new(StaticUnit::new("c", "unused")))
            .repetitive_handoff_detection(4, 3)
            .build()
            .unwrap();

        let result = swarm.run("x").await.unwrap();
        assert_eq!(result.status, RunStatus::Incomplete);
        assert_eq!(result.handoff_count, 3);
        assert!(result.error.unwrap().contains("repetitive"));
    }

    #[tokio::test]
    async fn test_sentinel_parser() {
        let swarm = Swarm::builder()
            .add_node(
                "research",
                script("r", vec![ScriptStep::output("Found three sources.\nHANDOFF: writer")]),
            )
            .add_node("writer", Arc::new(StaticUnit::new("w", "article")))
            .parser(SentinelParser::default())
            .build()
            .unwrap();

        let result = swarm.run("topic").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, json!("article"));
        assert_eq!(result.handoff_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let swarm = Swarm::builder()
            .add_node("a", Arc::new(StaticUnit::new("a", "x")))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = swarm.run_with_cancel(json!("x"), cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.node_history().is_empty());
    }

    #[test]
    fn test_validation() {
        let unit: Arc<dyn Invocable> = Arc::new(StaticUnit::new("u", "x"));
        assert!(Swarm::new(vec![], "a", SwarmConfig::default()).is_err());
        assert!(Swarm::new(
            vec![Node::new("a", unit.clone())],
            "missing",
            SwarmConfig::default()
        )
        .is_err());
        assert!(Swarm::new(
            vec![Node::new("a", unit.clone()), Node::new("a", unit.clone())],
            "a",
            SwarmConfig::default()
        )
        .is_err());
        assert!(Swarm::new(
            vec![Node::new("a", unit.clone())],
            "a",
            SwarmConfig::new(0, 5, Duration::from_secs(1))
        )
        .is_err());
        assert!(Swarm::new(vec![Node::new("a", unit)], "a", SwarmConfig::default()).is_ok());
    }
}
