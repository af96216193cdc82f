use crate::types::{NodeId, NodeStatus, RunId, RunStatus, UnitKind};

/// Orchestration event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// A Graph or Swarm run started.
    RunStarted { run_id: RunId, kind: UnitKind, name: String },
    /// A node was dispatched.
    NodeStarted { run_id: RunId, node_id: NodeId, execution_index: u32 },
    /// A node finished (successfully or not).
    NodeFinished {
        run_id: RunId,
        node_id: NodeId,
        execution_index: u32,
        status: NodeStatus,
        elapsed_ms: u64,
    },
    /// A node was skipped because no active edge reaches it.
    ///
    /// Inside a loop the skip is provisional: a later pass that activates an edge into the node
    /// revives it, and a `NodeStarted` for the same node follows. The run's trace reports only
    /// the final state.
    NodeSkipped { run_id: RunId, node_id: NodeId },
    /// A swarm unit handed control to another node.
    Handoff { run_id: RunId, from: NodeId, to: NodeId, iteration: u32 },
    /// The run reached a terminal status.
    RunFinished { run_id: RunId, status: RunStatus, elapsed_ms: u64 },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OrchestrationEvent::NodeSkipped {
            run_id: RunId::new(),
            node_id: NodeId::from("business"),
        });
        match rx.recv().await.unwrap() {
            OrchestrationEvent::NodeSkipped { node_id, .. } => assert_eq!(node_id, "business"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = EventBus::default();
        bus.publish(OrchestrationEvent::RunFinished {
            run_id: RunId::new(),
            status: RunStatus::Success,
            elapsed_ms: 1,
        });
    }
}
