use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MaestroError, Result};
use crate::types::{HandoffRecord, NodeId, NodeResult, NodeStatus, RunId};

/// One entry in the ordered run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    NodeStarted {
        node_id: NodeId,
        execution_index: u32,
        at: DateTime<Utc>,
    },
    NodeFinished {
        node_id: NodeId,
        execution_index: u32,
        status: NodeStatus,
        at: DateTime<Utc>,
    },
    NodeSkipped {
        node_id: NodeId,
        at: DateTime<Utc>,
    },
    Handoff(HandoffRecord),
}

/// Record of one invocation's progress.
///
/// Created fresh for every run and owned by the scheduler loop, which is the only writer.
/// Units see a read-only snapshot through their `UnitContext`. Each (node, execution index)
/// slot is written at most once; the `version` counter increases on every mutation so that
/// condition results can be memoized per version.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    run_id: RunId,
    input: Value,
    results: HashMap<NodeId, BTreeMap<u32, NodeResult>>,
    execution_counts: HashMap<NodeId, u32>,
    skipped: BTreeSet<NodeId>,
    history: Vec<HistoryEvent>,
    version: u64,
}

impl ExecutionState {
    pub fn new(input: Value) -> Self {
        Self {
            run_id: RunId::new(),
            input,
            results: HashMap::new(),
            execution_counts: HashMap::new(),
            skipped: BTreeSet::new(),
            history: Vec::new(),
            version: 0,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The original task of this run.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Register a new execution of `node` and return its zero-based index.
    pub fn begin_execution(&mut self, node: &NodeId) -> u32 {
        let count = self.execution_counts.entry(node.clone()).or_insert(0);
        let index = *count;
        *count += 1;
        self.history.push(HistoryEvent::NodeStarted {
            node_id: node.clone(),
            execution_index: index,
            at: Utc::now(),
        });
        self.version += 1;
        index
    }

    /// Write a node result into its (node, execution index) slot.
    pub fn record_result(&mut self, result: NodeResult) -> Result<()> {
        let slots = self.results.entry(result.node_id.clone()).or_default();
        if slots.contains_key(&result.execution_index) {
            return Err(MaestroError::DuplicateResult {
                node: result.node_id.to_string(),
                execution_index: result.execution_index,
            });
        }
        self.skipped.remove(&result.node_id);
        self.history.push(HistoryEvent::NodeFinished {
            node_id: result.node_id.clone(),
            execution_index: result.execution_index,
            status: result.status,
            at: result.timestamp,
        });
        slots.insert(result.execution_index, result);
        self.version += 1;
        Ok(())
    }

    pub fn mark_skipped(&mut self, node: &NodeId) {
        if self.skipped.insert(node.clone()) {
            self.history.push(HistoryEvent::NodeSkipped {
                node_id: node.clone(),
                at: Utc::now(),
            });
            self.version += 1;
        }
    }

    pub fn record_handoff(&mut self, record: HandoffRecord) {
        self.history.push(HistoryEvent::Handoff(record));
        self.version += 1;
    }

    pub fn execution_count(&self, node: &str) -> u32 {
        self.execution_counts.get(node).copied().unwrap_or(0)
    }

    pub fn is_skipped(&self, node: &str) -> bool {
        self.skipped.contains(node)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &NodeId> {
        self.skipped.iter()
    }

    /// Most recent result of `node`.
    pub fn latest(&self, node: &str) -> Option<&NodeResult> {
        self.results
            .get(node)
            .and_then(|slots| slots.values().next_back())
    }

    /// Output of the most recent execution of `node`.
    pub fn output(&self, node: &str) -> Option<&Value> {
        self.latest(node).map(|r| &r.output)
    }

    /// All recorded results of `node`, oldest first.
    pub fn results_for(&self, node: &str) -> Vec<&NodeResult> {
        self.results
            .get(node)
            .map(|slots| slots.values().collect())
            .unwrap_or_default()
    }

    pub fn result_at(&self, node: &str, execution_index: u32) -> Option<&NodeResult> {
        self.results.get(node)?.get(&execution_index)
    }

    /// Every recorded result, ordered by completion.
    pub fn results_in_order(&self) -> Vec<&NodeResult> {
        self.history
            .iter()
            .filter_map(|event| match event {
                HistoryEvent::NodeFinished {
                    node_id,
                    execution_index,
                    ..
                } => self.result_at(node_id.as_str(), *execution_index),
                _ => None,
            })
            .collect()
    }

    pub fn handoffs(&self) -> Vec<&HandoffRecord> {
        self.history
            .iter()
            .filter_map(|event| match event {
                HistoryEvent::Handoff(record) => Some(record),
                _ => None,
            })
            .collect()
    }
}
