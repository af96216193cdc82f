use std::borrow::Borrow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a node inside one Graph or Swarm.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Unique identifier of one invocation of a Graph or Swarm.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a whole run (or of a unit invocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
    Incomplete,
    Cancelled,
}

impl RunStatus {
    /// Whether a node wrapping a run with this status counts as successful.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Success | Self::PartialFailure)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::Failed => "FAILED",
            Self::Incomplete => "INCOMPLETE",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one execution of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of this execution of the node within the run.
    pub execution_index: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Trace of a nested Graph or Swarm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Box<Trace>>,
}

impl NodeResult {
    pub fn success(node_id: impl Into<NodeId>, execution_index: u32, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Success,
            output,
            timestamp: Utc::now(),
            execution_index,
            elapsed_ms: 0,
            error: None,
            trace: None,
        }
    }

    pub fn failed(
        node_id: impl Into<NodeId>,
        execution_index: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            output: Value::Null,
            timestamp: Utc::now(),
            execution_index,
            elapsed_ms: 0,
            error: Some(error.into()),
            trace: None,
        }
    }

    pub fn skipped(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Skipped,
            output: Value::Null,
            timestamp: Utc::now(),
            execution_index: 0,
            elapsed_ms: 0,
            error: None,
            trace: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Success
    }

    /// Output rendered as plain text.
    pub fn text(&self) -> String {
        value_text(&self.output)
    }
}

/// Control signal parsed from a swarm unit's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum HandoffSignal {
    /// Transfer control to another registered node.
    Handoff {
        target: NodeId,
        #[serde(default)]
        payload: Value,
    },
    /// Finish the run with this output.
    Complete {
        #[serde(default)]
        output: Value,
    },
}

impl HandoffSignal {
    pub fn handoff(target: impl Into<NodeId>, payload: Value) -> Self {
        Self::Handoff {
            target: target.into(),
            payload,
        }
    }

    pub fn complete(output: impl Into<Value>) -> Self {
        Self::Complete {
            output: output.into(),
        }
    }

    /// Encode as the structured JSON form units emit.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Handoff { target, payload } => serde_json::json!({
                "signal": "handoff",
                "target": target.as_str(),
                "payload": payload,
            }),
            Self::Complete { output } => serde_json::json!({
                "signal": "complete",
                "output": output,
            }),
        }
    }
}

/// One handoff between swarm nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from: NodeId,
    pub to: NodeId,
    /// Handoff counter value after this handoff (1-based).
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// A turn in the shared swarm transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub node_id: NodeId,
    pub output: Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything a unit receives when invoked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// The original task of the outermost run.
    pub task: Value,
    /// Outputs of the predecessors whose edges activated this node (graph model).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upstream: BTreeMap<NodeId, Value>,
    /// Full accumulated transcript (swarm model).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<TranscriptEntry>,
    /// Payload of the handoff that activated this node (swarm model).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Invocation {
    pub fn new(task: impl Into<Value>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<NodeId, Value>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_transcript(mut self, transcript: Vec<TranscriptEntry>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True when only the task is present.
    pub fn is_bare(&self) -> bool {
        self.upstream.is_empty() && self.transcript.is_empty() && self.payload.is_none()
    }

    /// The task a nested orchestrator receives: the bare task, or the whole invocation as JSON.
    pub fn as_task(&self) -> Value {
        if self.is_bare() {
            return self.task.clone();
        }
        let mut obj = serde_json::Map::new();
        obj.insert("task".into(), self.task.clone());
        if !self.upstream.is_empty() {
            let upstream = self
                .upstream
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect();
            obj.insert("upstream".into(), Value::Object(upstream));
        }
        if !self.transcript.is_empty() {
            let transcript = self
                .transcript
                .iter()
                .map(|t| serde_json::json!({ "node": t.node_id.as_str(), "output": t.output }))
                .collect();
            obj.insert("transcript".into(), Value::Array(transcript));
        }
        if let Some(payload) = &self.payload {
            obj.insert("payload".into(), payload.clone());
        }
        Value::Object(obj)
    }
}

/// Which of the three unit shapes an Invocable is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Leaf,
    Graph,
    Swarm,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Leaf => "leaf",
            Self::Graph => "graph",
            Self::Swarm => "swarm",
        };
        f.write_str(s)
    }
}

/// What a unit returns from `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub status: RunStatus,
    pub output: Value,
    pub trace: Option<Trace>,
}

impl UnitOutcome {
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            status: RunStatus::Success,
            output: output.into(),
            trace: None,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Diagnostic trace of a Graph run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphTrace {
    /// Latest result per node, skipped nodes included.
    pub results: BTreeMap<NodeId, NodeResult>,
    /// Every execution, in completion order.
    pub executions: Vec<NodeResult>,
}

impl GraphTrace {
    /// Node ids in completion order (repeated for re-executed nodes).
    pub fn execution_order(&self) -> Vec<&NodeId> {
        self.executions.iter().map(|r| &r.node_id).collect()
    }

    /// How many times `node` executed.
    pub fn execution_count(&self, node: &str) -> usize {
        self.executions
            .iter()
            .filter(|r| r.node_id.as_str() == node)
            .count()
    }

    pub fn status_of(&self, node: &str) -> Option<NodeStatus> {
        self.results.get(node).map(|r| r.status)
    }
}

/// Diagnostic trace of a Swarm run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmTrace {
    pub handoffs: Vec<HandoffRecord>,
    /// Nodes in the order they were invoked.
    pub node_history: Vec<NodeId>,
    /// One result per invocation, same order as `node_history`.
    pub results: Vec<NodeResult>,
}

/// Trace returned by any orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trace {
    Graph(GraphTrace),
    Swarm(SwarmTrace),
}

impl Trace {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Render a JSON value as text: strings verbatim, everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
