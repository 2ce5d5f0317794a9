//! Auto-registration and graceful restarts.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeNode, registry};
use simfleet_cluster::{NodeRegistrar, NodeRegistry, NodeWrapper, RestartOptions};
use simfleet_core::Criteria;

fn registrar(registry: &Arc<NodeRegistry>, nodes: &[Arc<FakeNode>]) -> NodeRegistrar {
    let wrappers = nodes
        .iter()
        .map(|node| Arc::new(NodeWrapper::new(node.clone())))
        .collect();
    NodeRegistrar::from_wrappers(wrappers, registry.clone())
}

#[tokio::test]
async fn registers_reachable_nodes_and_retries_the_rest() {
    let registry = registry(None);
    let up = FakeNode::new("mac-01", 2);
    let down = FakeNode::new("mac-02", 2);
    down.set_reachable(false);
    let registrar = registrar(&registry, &[up.clone(), down.clone()]);

    assert!(!registry.is_initial_registration_complete());
    assert_eq!(registrar.auto_register().await, 1);
    assert!(registry.is_initial_registration_complete());
    assert!(registry.contains("mac-01").await);
    assert!(!registry.contains("mac-02").await);
    assert!(registrar.wrappers()[0].is_health_checking());

    let failed = &registrar.wrappers()[1];
    assert!(failed.last_error().unwrap().contains("not reachable"));

    down.set_reachable(true);
    assert_eq!(registrar.auto_register().await, 1);
    assert!(registry.contains("mac-02").await);
    // Already registered nodes are left alone.
    assert_eq!(up.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(registrar.auto_register().await, 0);
}

#[tokio::test]
async fn restart_skips_nodes_with_unexpiring_leases() {
    let registry = registry(None);
    let pinned = FakeNode::new("mac-01", 2).with_remaining(0.9);
    let free = FakeNode::new("mac-02", 2).with_remaining(0.1);
    let registrar = registrar(&registry, &[pinned.clone(), free.clone()]);
    assert_eq!(registrar.auto_register().await, 2);

    let handle = registry
        .create_device_async(&Criteria::default(), None)
        .await
        .unwrap();
    assert_eq!(handle.node, "mac-01");

    assert!(registrar.restart_nodes_gracefully(RestartOptions::default()).await);
    assert_eq!(pinned.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(free.prepares.load(Ordering::SeqCst), 2);
    assert!(registry.active_devices().contains(&handle.reference));
    assert!(registry.get("mac-01").await.unwrap().is_enabled());
    assert!(!registrar.is_restarting());

    let forced = RestartOptions {
        force: true,
        parallel: true,
        ..RestartOptions::default()
    };
    assert!(registrar.restart_nodes_gracefully(forced).await);
    assert_eq!(pinned.prepares.load(Ordering::SeqCst), 2);
    assert_eq!(pinned.released(), vec![handle.reference.clone()]);
    assert!(registry.active_devices().is_empty());
}

#[tokio::test]
async fn restart_releases_expiring_leases() {
    let registry = registry(Some(Duration::from_secs(3600)));
    let node = FakeNode::new("mac-01", 2);
    let registrar = registrar(&registry, &[node.clone()]);
    registrar.auto_register().await;

    let handle = registry
        .create_device_async(&Criteria::default(), Some("ci"))
        .await
        .unwrap();
    assert!(registrar.restart_nodes_gracefully(RestartOptions::default()).await);

    assert_eq!(node.released(), vec![handle.reference]);
    assert!(registry.active_devices().is_empty());
    let wrapper = registry.get("mac-01").await.unwrap();
    assert!(wrapper.is_alive());
    assert!(wrapper.is_enabled());
    assert!(wrapper.is_health_checking());
}

#[tokio::test(start_paused = true)]
async fn restart_can_reboot_the_machine() {
    let registry = registry(None);
    let node = FakeNode::new("mac-01", 2);
    let registrar = registrar(&registry, &[node.clone()]);
    registrar.auto_register().await;

    let options = RestartOptions {
        reboot: true,
        ..RestartOptions::default()
    };
    assert!(registrar.restart_nodes_gracefully(options).await);
    assert_eq!(node.reboots.load(Ordering::SeqCst), 1);
    assert_eq!(node.prepares.load(Ordering::SeqCst), 2);
    assert!(registry.contains("mac-01").await);
}

#[tokio::test]
async fn failed_restart_deregisters_until_recovery() {
    let registry = registry(None);
    let node = FakeNode::new("mac-01", 2);
    let registrar = registrar(&registry, &[node.clone()]);
    registrar.auto_register().await;

    node.fail_prepare.store(true, Ordering::SeqCst);
    assert!(registrar.restart_nodes_gracefully(RestartOptions::default()).await);
    assert!(!registry.contains("mac-01").await);

    assert_eq!(registrar.auto_register().await, 0);
    node.fail_prepare.store(false, Ordering::SeqCst);
    assert_eq!(registrar.auto_register().await, 1);
    assert!(registry.contains("mac-01").await);
}

#[tokio::test]
async fn concurrent_restart_is_rejected() {
    let registry = registry(None);
    let node = FakeNode::new("mac-01", 2);
    let registrar = registrar(&registry, &[node]);
    registrar.auto_register().await;

    let (first, second) = tokio::join!(
        registrar.restart_nodes_gracefully(RestartOptions::default()),
        registrar.restart_nodes_gracefully(RestartOptions::default()),
    );
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn registration_loop_stops_on_shutdown() {
    let registry = registry(None);
    let node = FakeNode::new("mac-01", 2);
    let registrar = Arc::new(
        registrar(&registry, &[node]).with_interval(Duration::from_millis(20)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn({
        let registrar = registrar.clone();
        async move { registrar.run(shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.contains("mac-01").await);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
