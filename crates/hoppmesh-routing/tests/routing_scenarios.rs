//! End-to-end routing decisions over small hand-built meshes

use hoppmesh_protocol::{Edge, Message, Node, NodeId, Priority, Recipient, TransportKind};
use hoppmesh_routing::decision::confidence;
use hoppmesh_routing::path_finder::{build_route, targets_for};
use hoppmesh_routing::scorer::rank_routes;
use hoppmesh_routing::{
    DecisionEngine, HeuristicScorer, PathFinder, PerformanceLedger, RetryStrategy, TopologyGraph,
    TopologyStore,
};
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

/// Trust 0.85 gives a per-node reliability factor of 0.9 and trust 0.4 a
/// factor of 0.6; the local node carries full trust so it contributes 1.0
async fn mesh(nodes: &[(&str, f64, bool)], links: &[(&str, &str, f64)]) -> Arc<TopologyGraph> {
    let store = TopologyStore::new();
    for (name, trust, internet) in nodes {
        store
            .upsert_node(
                Node::new(id(name), *name)
                    .with_trust(*trust)
                    .with_internet(*internet),
            )
            .await
            .unwrap();
    }
    for (a, b, reliability) in links {
        store
            .upsert_link(Edge::new(id(a), id(b), *reliability, 250.0, TransportKind::Bluetooth))
            .await
            .unwrap();
    }
    store.snapshot().await
}

fn message(priority: Priority, requires_internet: bool) -> Message {
    Message::new(id("A"), Recipient::Broadcast, "status update", priority, requires_internet)
}

#[tokio::test]
async fn test_single_gateway_link_is_routed_immediately() {
    let graph = mesh(&[("A", 1.0, false), ("G", 0.85, true)], &[("A", "G", 0.9)]).await;
    let ledger = PerformanceLedger::default();

    let decision = DecisionEngine::new()
        .decide(&id("A"), &message(Priority::Normal, true), &graph, &ledger)
        .unwrap();

    let route = &decision.selected_route;
    assert_eq!(route.path(), &[id("A"), id("G")]);
    assert_eq!(route.hop_count(), 1);
    assert!(route.has_internet_path);
    assert!((route.reliability - 0.9).abs() < 1e-9);
    assert!(!decision.should_store);
    assert_eq!(decision.retry_strategy, RetryStrategy::Immediate);
    assert!(decision.reasoning.starts_with("Route has internet gateway access"));
}

#[tokio::test]
async fn test_isolated_origin_falls_back_to_local_route() {
    let graph = mesh(&[("A", 1.0, false)], &[]).await;
    let msg = message(Priority::Normal, true);

    let targets = targets_for(&id("A"), &msg, &graph);
    let routes = PathFinder::new()
        .find_routes(&id("A"), &targets, &msg, &graph)
        .unwrap();
    assert!(routes.is_empty());

    let decision = DecisionEngine::new()
        .decide(&id("A"), &msg, &graph, &PerformanceLedger::default())
        .unwrap();
    assert_eq!(decision.selected_route.path(), &[id("A")]);
    assert!(decision.should_store);
    assert_eq!(decision.retry_strategy, RetryStrategy::WaitForGateway);
}

#[tokio::test]
async fn test_reliable_branch_wins_between_equal_length_paths() {
    let graph = mesh(
        &[
            ("A", 1.0, false),
            ("B", 0.85, false),
            ("C", 0.4, false),
            ("G", 1.0, true),
        ],
        &[("A", "B", 0.9), ("B", "G", 0.9), ("A", "C", 0.9), ("C", "G", 0.9)],
    )
    .await;

    let ledger = PerformanceLedger::default();
    let msg = message(Priority::Normal, true);

    let winning = build_route(vec![id("A"), id("B"), id("G")], &graph).unwrap();
    let losing = build_route(vec![id("A"), id("C"), id("G")], &graph).unwrap();
    assert!((winning.reliability - 0.9).abs() < 1e-9);
    assert!((losing.reliability - 0.6).abs() < 1e-9);

    let ranked = rank_routes(
        &HeuristicScorer,
        vec![losing.clone(), winning],
        &msg,
        &ledger,
        &graph,
    );
    assert_eq!(ranked[0].route.path_key(), "A-B-G");

    let decision = DecisionEngine::new()
        .decide(&id("A"), &msg, &graph, &ledger)
        .unwrap();
    assert_eq!(decision.selected_route.path_key(), "A-B-G");
    assert!((decision.confidence - (0.6 * 0.9 + 0.3 + 0.1)).abs() < 1e-9);
    assert!(decision.confidence > confidence(&losing, &msg));
}

#[tokio::test]
async fn test_emergency_without_gateways_broadcasts() {
    let graph = mesh(
        &[("A", 1.0, false), ("B", 0.2, false), ("C", 0.9, false)],
        &[("A", "B", 0.5), ("B", "C", 0.5)],
    )
    .await;

    for recipient in [Recipient::Broadcast, Recipient::Node(id("C"))] {
        let msg = Message::new(id("A"), recipient, "help", Priority::Emergency, true);
        let decision = DecisionEngine::new()
            .decide(&id("A"), &msg, &graph, &PerformanceLedger::default())
            .unwrap();
        assert_eq!(decision.retry_strategy, RetryStrategy::Broadcast);
        assert!(decision.reasoning.contains("Emergency message prioritized"));
    }
}

#[tokio::test]
async fn test_history_breaks_the_tie_between_two_gateways() {
    let graph = mesh(
        &[("A", 1.0, false), ("G1", 1.0, true), ("G2", 1.0, true)],
        &[("A", "G1", 0.9), ("A", "G2", 0.9)],
    )
    .await;
    let msg = message(Priority::Normal, true);

    let mut ledger = PerformanceLedger::default();
    for _ in 0..4 {
        ledger.record("A-G1", false, Duration::from_millis(900));
        ledger.record("A-G2", true, Duration::from_millis(300));
    }

    let decision = DecisionEngine::new()
        .decide(&id("A"), &msg, &graph, &ledger)
        .unwrap();
    assert_eq!(decision.selected_route.path_key(), "A-G2");
    assert_eq!(decision.alternative_routes.len(), 1);
    assert_eq!(decision.alternative_routes[0].path_key(), "A-G1");
}

#[tokio::test]
async fn test_alternatives_capped_at_three() {
    let mut nodes = vec![("A", 1.0, false)];
    let gateways = ["G1", "G2", "G3", "G4", "G5"];
    nodes.extend(gateways.iter().map(|g| (*g, 1.0, true)));
    let links: Vec<(&str, &str, f64)> = gateways.iter().map(|g| ("A", *g, 0.9)).collect();
    let graph = mesh(&nodes, &links).await;

    let decision = DecisionEngine::new()
        .decide(
            &id("A"),
            &message(Priority::High, true),
            &graph,
            &PerformanceLedger::default(),
        )
        .unwrap();
    assert_eq!(decision.alternative_routes.len(), 3);
    assert_eq!(decision.routes().count(), 4);
}

#[tokio::test]
async fn test_routes_only_reference_snapshot_nodes() {
    let store = TopologyStore::new();
    store.upsert_node(Node::new(id("A"), "a")).await.unwrap();
    store
        .upsert_node(Node::new(id("G"), "g").with_internet(true))
        .await
        .unwrap();
    store
        .upsert_link(Edge::new(id("A"), id("G"), 0.9, 10.0, TransportKind::Lora))
        .await
        .unwrap();
    let snapshot = store.snapshot().await;

    // later mutation must not leak into the snapshot already taken
    store
        .upsert_node(Node::new(id("H"), "h").with_internet(true))
        .await
        .unwrap();
    store
        .upsert_link(Edge::new(id("A"), id("H"), 0.9, 10.0, TransportKind::Lora))
        .await
        .unwrap();

    let msg = message(Priority::Normal, true);
    let targets = targets_for(&id("A"), &msg, &snapshot);
    let routes = PathFinder::new()
        .find_routes(&id("A"), &targets, &msg, &snapshot)
        .unwrap();

    assert_eq!(routes.len(), 1);
    for route in &routes {
        assert!(route.path().iter().all(|n| snapshot.contains(n)));
    }
}
