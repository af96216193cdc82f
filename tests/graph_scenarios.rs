use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use maestro_core::config::GraphConfig;
use maestro_core::event::{EventBus, OrchestrationEvent};
use maestro_core::types::{NodeId, NodeStatus, RunStatus, Trace};
use maestro_engine::{
    Condition, EchoUnit, FailingUnit, GraphBuilder, JoinPolicy, NodeOptions, StaticUnit,
};
use maestro_test_utils::{MockStep, MockUnit, TimedUnit, Timeline};

#[tokio::test]
async fn test_classifier_routes_to_one_branch() {
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();

    let graph = GraphBuilder::new()
        .with_name("router")
        .add_node("classify", Arc::new(StaticUnit::new("classify", "technical question")))
        .add_node("technical", Arc::new(EchoUnit::new("tech").with_prefix("tech: ")))
        .add_node("business", Arc::new(EchoUnit::new("biz").with_prefix("biz: ")))
        .add_conditional_edge("classify", "technical", "classify contains 'technical'")
        .add_edge_when(
            "classify",
            "business",
            Condition::output_contains("classify", "business"),
        )
        .set_entry_point("classify")
        .with_event_bus(bus.clone())
        .build()
        .unwrap();

    let result = graph.run("How do I configure TLS?").await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.sinks, vec![NodeId::from("technical")]);
    assert!(result.output.as_str().unwrap().contains("tech: "));
    assert_eq!(result.trace.status_of("business"), Some(NodeStatus::Skipped));
    assert_eq!(result.trace.execution_count("business"), 0);

    let mut skipped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let OrchestrationEvent::NodeSkipped { node_id, .. } = event {
            skipped.push(node_id);
        }
    }
    assert_eq!(skipped, vec![NodeId::from("business")]);
}

#[tokio::test]
async fn test_fan_in_waits_for_every_predecessor() {
    let timeline = Timeline::new();
    let mut builder = GraphBuilder::new();
    for (id, ms) in [("search", 100), ("docs", 30), ("metrics", 60)] {
        builder = builder
            .add_node(id, Arc::new(TimedUnit::new(id, Duration::from_millis(ms), &timeline)))
            .add_edge(id, "integrate")
            .set_entry_point(id);
    }
    let graph = builder
        .add_node(
            "integrate",
            Arc::new(TimedUnit::new("integrate", Duration::from_millis(10), &timeline)),
        )
        .build()
        .unwrap();

    let result = graph.run("go").await.unwrap();
    assert_eq!(result.status, RunStatus::Success);

    let entries: Vec<_> = ["search", "docs", "metrics"]
        .iter()
        .map(|id| timeline.span(id).unwrap())
        .collect();
    // entry points overlap
    let first_end = entries.iter().map(|s| s.end).min().unwrap();
    assert!(entries.iter().all(|s| s.start < first_end));
    let latest_end = entries.iter().map(|s| s.end).max().unwrap();
    let integrate = timeline.span("integrate").unwrap();
    assert!(integrate.start > latest_end);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_of_one_serializes_dispatch() {
    let timeline = Timeline::new();
    let mut builder = GraphBuilder::new().with_config(GraphConfig {
        max_concurrency: 1,
        ..GraphConfig::default()
    });
    for id in ["a", "b", "c"] {
        builder = builder
            .add_node(id, Arc::new(TimedUnit::new(id, Duration::from_millis(20), &timeline)))
            .set_entry_point(id);
    }
    let graph = builder.build().unwrap();

    let result = graph.run("go").await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.sinks.len(), 3);

    let mut spans: Vec<_> = timeline.spans().into_iter().map(|(_, s)| s).collect();
    spans.sort_by_key(|s| s.start);
    for pair in spans.windows(2) {
        assert!(pair[1].start >= pair[0].end);
    }
}

#[tokio::test]
async fn test_always_active_cycle_runs_exactly_k_times() {
    let ping = Arc::new(MockUnit::returning("ping", "ping"));
    let pong = Arc::new(MockUnit::returning("pong", "pong"));
    let graph = GraphBuilder::new()
        .add_node("ping", ping.clone())
        .add_node("pong", pong.clone())
        .add_edge("ping", "pong")
        .add_edge("pong", "ping")
        .set_entry_point("ping")
        .set_max_node_executions(3)
        .build()
        .unwrap();

    let result = graph.run("rally").await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(ping.call_count(), 3);
    assert_eq!(pong.call_count(), 3);
    assert_eq!(result.trace.execution_count("ping"), 3);
    assert_eq!(result.output, json!("pong"));
    let order: Vec<&str> = result.trace.execution_order().iter().map(|n| n.as_str()).collect();
    assert_eq!(order, vec!["ping", "pong", "ping", "pong", "ping", "pong"]);
}

#[tokio::test]
async fn test_acyclic_graph_runs_each_node_once() {
    let units: Vec<(&str, Arc<MockUnit>)> = ["start", "left", "right", "join"]
        .into_iter()
        .map(|id| (id, Arc::new(MockUnit::returning(id, id))))
        .collect();

    let mut builder = GraphBuilder::new();
    for (id, unit) in &units {
        let options = if *id == "join" {
            NodeOptions::default().with_join(JoinPolicy::any())
        } else {
            NodeOptions::default()
        };
        builder = builder.add_node_with(*id, unit.clone(), options);
    }
    let graph = builder
        .add_edge("start", "left")
        .add_edge("start", "right")
        .add_edge("left", "join")
        .add_edge("right", "join")
        .set_entry_point("start")
        .build()
        .unwrap();

    assert!(!graph.is_cyclic());
    assert_eq!(graph.execution_limit(), 1);
    let result = graph.run("go").await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    for (id, unit) in &units {
        assert_eq!(unit.call_count(), 1, "{} ran more than once", id);
    }
}

#[tokio::test]
async fn test_failed_branch_is_partial_failure() {
    let graph = GraphBuilder::new()
        .add_node("fetch", Arc::new(StaticUnit::new("fetch", "rows")))
        .add_node("enrich", Arc::new(FailingUnit::new("enrich", "upstream api down")))
        .add_node("summarize", Arc::new(StaticUnit::new("summarize", "summary")))
        .add_node("publish", Arc::new(StaticUnit::new("publish", "published")))
        .add_edge("fetch", "enrich")
        .add_edge("fetch", "summarize")
        .add_edge("enrich", "publish")
        .set_entry_point("fetch")
        .build()
        .unwrap();

    let result = graph.run("daily report").await.unwrap();

    assert_eq!(result.status, RunStatus::PartialFailure);
    assert_eq!(result.output, json!("summary"));
    assert_eq!(result.trace.status_of("enrich"), Some(NodeStatus::Failed));
    assert_eq!(result.trace.status_of("publish"), Some(NodeStatus::Skipped));
    let enrich = result.node("enrich").unwrap();
    assert!(enrich.error.as_deref().unwrap().contains("upstream api down"));
}

#[tokio::test]
async fn test_trace_survives_json() {
    let graph = GraphBuilder::new()
        .add_node("a", Arc::new(StaticUnit::new("a", json!({"score": 7}))))
        .add_node("b", Arc::new(EchoUnit::new("b")))
        .add_edge("a", "b")
        .set_entry_point("a")
        .build()
        .unwrap();

    let result = graph.run("x").await.unwrap();
    let trace = Trace::Graph(result.trace.clone());
    let decoded = Trace::from_json(&trace.to_json().unwrap()).unwrap();
    assert_eq!(decoded, trace);
}

#[tokio::test]
async fn test_skipped_loop_exit_is_revived() {
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();
    let graph = GraphBuilder::new()
        .add_node("code", Arc::new(StaticUnit::new("code", "draft")))
        .add_node(
            "review",
            Arc::new(MockUnit::script(
                "review",
                vec![MockStep::Output(json!("revise")), MockStep::Output(json!("approve"))],
            )),
        )
        .add_node("ship", Arc::new(StaticUnit::new("ship", "shipped")))
        .add_edge("code", "review")
        .add_conditional_edge("review", "code", "review contains 'revise'")
        .add_conditional_edge("review", "ship", "review contains 'approve'")
        .set_entry_point("code")
        .set_max_node_executions(3)
        .with_event_bus(bus.clone())
        .build()
        .unwrap();

    let result = graph.run("feature").await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.output, json!("shipped"));
    assert_eq!(result.trace.status_of("ship"), Some(NodeStatus::Success));

    let mut ship_events = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestrationEvent::NodeSkipped { node_id, .. } if node_id == "ship" => {
                ship_events.push("skipped")
            }
            OrchestrationEvent::NodeStarted { node_id, .. } if node_id == "ship" => {
                ship_events.push("started")
            }
            _ => {}
        }
    }
    assert_eq!(ship_events, vec!["skipped", "started"]);
}

#[tokio::test]
async fn test_one_graph_serves_concurrent_runs() {
    let graph = Arc::new(
        GraphBuilder::new()
            .add_node("echo", Arc::new(EchoUnit::new("echo")))
            .set_entry_point("echo")
            .build()
            .unwrap(),
    );

    let (first, second) = tokio::join!(graph.run("first"), graph.run("second"));
    let first = first.unwrap();
    let second = second.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.output, json!("first"));
    assert_eq!(second.output, json!("second"));
}
