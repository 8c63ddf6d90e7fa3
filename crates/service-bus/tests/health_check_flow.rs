//! # Health Check Flow
//!
//! Several services share one in-memory broker and run the full
//! Ping → Pong exchange through their own connection managers.

use std::sync::Arc;
use std::time::Duration;

use service_bus::{
    BusConfig, ConnectionManager, EventRegistry, HealthCheck, InMemoryBroker, QueueNameTemplate,
    ServiceId,
};
use tokio::time::timeout;

const TEMPLATE: &str = "mesh.##DestServiceGroupName##.##EventName##";

struct Node {
    bus: Arc<ConnectionManager>,
    health: HealthCheck,
}

async fn start(service: ServiceId, broker: &InMemoryBroker) -> Node {
    let config = BusConfig::new(
        service.as_str(),
        "amqp://memory",
        "mesh",
        QueueNameTemplate::parse(TEMPLATE).expect("template"),
    );
    let bus = Arc::new(ConnectionManager::new(config, Arc::new(broker.clone())));
    bus.open_connection().await.expect("open");

    let health = HealthCheck::new();
    let registry = EventRegistry::load_events(service, &health).expect("registry");
    registry.wire(&bus).await.expect("wire");

    Node { bus, health }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_ping_pong_between_two_services() {
    let broker = InMemoryBroker::new();
    let backend = start(ServiceId::Backend, &broker).await;
    let users = start(ServiceId::Users, &broker).await;

    backend
        .health
        .send_validate_check_on_servers(&backend.bus)
        .await
        .expect("sweep");

    let tracker = backend.health.tracker();
    wait_until(|| tracker.count(ServiceId::Users) == 1).await;
    wait_until(|| broker.unacked_count() == 0).await;

    // Only Users is running, the other peers never answer.
    assert!(!backend.health.has_all_services_loaded());
    assert_eq!(
        tracker.pending(),
        vec![
            ServiceId::WebApiGateway,
            ServiceId::Communities,
            ServiceId::CommunitiesGroups,
            ServiceId::Payments,
        ]
    );
    assert_eq!(users.health.tracker().count(ServiceId::Backend), 0);
}

#[tokio::test]
async fn test_repeated_sweeps_keep_counting() {
    let broker = InMemoryBroker::new();
    let backend = start(ServiceId::Backend, &broker).await;
    let _payments = start(ServiceId::Payments, &broker).await;

    for _ in 0..3 {
        backend
            .health
            .send_validate_check_on_servers(&backend.bus)
            .await
            .expect("sweep");
    }

    let tracker = backend.health.tracker();
    wait_until(|| tracker.count(ServiceId::Payments) == 3).await;
}

#[tokio::test]
async fn test_readiness_across_full_mesh() {
    let broker = InMemoryBroker::new();
    let mut nodes = Vec::new();
    for service in ServiceId::ALL {
        nodes.push(start(service, &broker).await);
    }

    for node in &nodes {
        node.health
            .send_validate_check_on_servers(&node.bus)
            .await
            .expect("sweep");
    }

    for node in &nodes {
        wait_until(|| node.health.has_all_services_loaded()).await;
        assert!(node.health.tracker().pending().is_empty());
    }

    wait_until(|| broker.unacked_count() == 0).await;
}

#[tokio::test]
async fn test_one_service_down_blocks_readiness_everywhere() {
    let broker = InMemoryBroker::new();
    let mut nodes = Vec::new();
    for service in ServiceId::Payments.peers() {
        nodes.push(start(service, &broker).await);
    }

    for node in &nodes {
        node.health
            .send_validate_check_on_servers(&node.bus)
            .await
            .expect("sweep");
    }

    for node in &nodes {
        let tracker = node.health.tracker();
        wait_until(|| tracker.pending() == vec![ServiceId::Payments]).await;
        assert!(!node.health.has_all_services_loaded());
    }
}

#[tokio::test]
async fn test_close_stops_consumers() {
    let broker = InMemoryBroker::new();
    let backend = start(ServiceId::Backend, &broker).await;

    backend.bus.close_connection().await.expect("close");

    assert!(!backend.bus.is_connected());
    assert_eq!(broker.consumer_count("mesh.Backend.Ping"), 0);
    assert_eq!(broker.consumer_count("mesh.Backend.Pong"), 0);
}
