//! Integration tests for the background sync worker.

use std::sync::Arc;
use std::time::Duration;

use beancache_daemon::{DaemonConfig, DaemonError, NotificationHub, PushTrigger, SyncWorker};
use beancache_engine::{
    AttributeSnapshot, AttributeStore, BeanData, ChangeKind, Error, LocalStore, MemoryRemote,
    SyncCoordinator, SyncMode, SyncStatus,
};

/// Test fixture: a booted "orders" channel wired to an in-memory remote.
struct Fixture {
    remote: Arc<MemoryRemote>,
    hub: Arc<NotificationHub>,
    coordinator: Arc<SyncCoordinator>,
}

fn fixture(config: &DaemonConfig) -> Fixture {
    let remote = Arc::new(MemoryRemote::new());
    let hub = NotificationHub::new_shared();
    let coordinator = Arc::new(
        SyncCoordinator::new(Arc::new(LocalStore::in_memory()), remote.clone())
            .with_notifier(hub.clone())
            .with_config(config.coordinator_config()),
    );
    coordinator.boot_channel("orders").unwrap();
    Fixture {
        remote,
        hub,
        coordinator,
    }
}

/// A config whose interval never fires during a test.
fn quiet() -> DaemonConfig {
    DaemonConfig::default().with_sync_interval(Duration::from_secs(3600))
}

fn data(pairs: &[(&str, &str)]) -> BeanData {
    BeanData::new(AttributeStore::from_pairs(pairs.iter().copied()).unwrap())
}

#[tokio::test]
async fn test_trigger_sync_drains_offline_saves() {
    let config = quiet();
    let f = fixture(&config);

    f.remote.set_online(false);
    let order = f.coordinator.new_instance_with_id("orders", "o-1").unwrap();
    order.set_value("status", "open").unwrap();
    assert_eq!(f.coordinator.save(&order).unwrap(), SyncStatus::Pending);

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    f.remote.set_online(true);

    let report = worker.trigger_sync().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(worker.last_report(), Some(report));
    assert_eq!(f.remote.len("orders"), 1);
    assert!(!order.is_dirty());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interval_drives_sync() {
    let config = DaemonConfig::default().with_sync_interval(Duration::from_millis(20));
    let f = fixture(&config);

    f.remote.set_online(false);
    let order = f.coordinator.new_instance("orders").unwrap();
    order.set_value("status", "open").unwrap();
    f.coordinator.save(&order).unwrap();
    f.remote.set_online(true);

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    for _ in 0..200 {
        if f.coordinator.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(f.coordinator.pending_count(), 0);
    assert_eq!(f.remote.len("orders"), 1);
    assert!(worker.last_report().is_some());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deferred_saves_wait_for_worker() {
    let config = quiet().with_sync_mode(SyncMode::Deferred);
    let f = fixture(&config);
    let mut worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);

    let order = f.coordinator.new_instance("orders").unwrap();
    order.set_value("status", "open").unwrap();
    assert_eq!(f.coordinator.save(&order).unwrap(), SyncStatus::Pending);
    assert_eq!(f.remote.push_count(), 0);

    let report = worker.trigger_sync().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(f.remote.push_count(), 1);

    // The pass above already published its report.
    let seen = tokio::time::timeout(Duration::from_secs(5), worker.next_report())
        .await
        .unwrap()
        .unwrap();
    assert!(seen.synced <= 1);
    assert_eq!(f.coordinator.pending_count(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_applies_remote_update() {
    let config = quiet();
    let f = fixture(&config);

    let order = f.coordinator.new_instance_with_id("orders", "o-1").unwrap();
    order.set_value("status", "open").unwrap();
    f.coordinator.save(&order).unwrap();

    let (_, mut events) = f.hub.subscribe(Some("orders"));
    f.remote.insert(AttributeSnapshot::hydrated(
        "orders",
        "o-1",
        data(&[("status", "shipped")]),
    ));

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    let report = worker
        .push(PushTrigger::new("orders", ["o-1"]))
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(order.get_value("status").unwrap().as_deref(), Some("shipped"));
    let event = events.try_recv().unwrap();
    assert_eq!(event.id, "o-1");
    assert_eq!(event.kind, ChangeKind::Updated);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_keeps_dirty_fields() {
    let config = quiet();
    let f = fixture(&config);

    let order = f.coordinator.new_instance_with_id("orders", "o-1").unwrap();
    order.set_value("status", "open").unwrap();
    order.set_value("region", "west").unwrap();
    f.coordinator.save(&order).unwrap();
    order.set_value("status", "draft").unwrap();

    f.remote.insert(AttributeSnapshot::hydrated(
        "orders",
        "o-1",
        data(&[("status", "shipped"), ("region", "east")]),
    ));

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    worker
        .push(PushTrigger::new("orders", ["o-1"]))
        .await
        .unwrap();

    assert_eq!(order.get_value("status").unwrap().as_deref(), Some("draft"));
    assert_eq!(order.get_value("region").unwrap().as_deref(), Some("east"));
    assert!(order.is_dirty());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_for_removed_bean_deletes_locally() {
    let config = quiet();
    let f = fixture(&config);

    let order = f.coordinator.new_instance_with_id("orders", "o-1").unwrap();
    order.set_value("status", "open").unwrap();
    f.coordinator.save(&order).unwrap();
    let (_, mut events) = f.hub.subscribe(None);
    assert!(f.remote.remove("orders", "o-1"));

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    let report = worker
        .push(PushTrigger::new("orders", ["o-1", "o-unknown"]))
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(events.try_recv().unwrap().kind, ChangeKind::Deleted);
    assert!(matches!(
        f.coordinator.read_by_id("orders", "o-1"),
        Err(Error::NotFound { .. })
    ));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_while_offline_reports_failures() {
    let config = quiet();
    let f = fixture(&config);
    f.remote.set_online(false);

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    let report = worker
        .push(PushTrigger::new("orders", ["o-1", "o-2"]))
        .await
        .unwrap();

    assert_eq!(report.failed, 2);
    assert_eq!(report.applied, 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reboot_reloads_channel() {
    let config = quiet();
    let f = fixture(&config);
    for i in 0..3 {
        f.remote.insert(AttributeSnapshot::hydrated(
            "orders",
            format!("o-{}", i),
            data(&[("status", "open")]),
        ));
    }
    assert!(f.coordinator.read_all("orders").unwrap().is_empty());

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    assert_eq!(worker.reboot("orders").await.unwrap(), 3);
    assert_eq!(f.coordinator.read_all("orders").unwrap().len(), 3);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reboot_offline_fails_retryably() {
    let config = quiet();
    let f = fixture(&config);
    f.remote.set_online(false);

    let worker = SyncWorker::spawn(f.coordinator.clone(), f.remote.clone(), &config);
    let err = worker.reboot("orders").await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Engine(Error::RemoteUnavailable(_))
    ));
    assert!(err.is_retryable());

    worker.shutdown().await.unwrap();
}

#[test]
fn test_push_trigger_wire_format() {
    let json = r#"{"channel": "orders", "ids": ["o-1", "o-2"]}"#;
    let trigger: PushTrigger = serde_json::from_str(json).unwrap();
    assert_eq!(trigger, PushTrigger::new("orders", ["o-1", "o-2"]));

    let report = beancache_daemon::PushReport {
        applied: 1,
        unchanged: 0,
        failed: 2,
    };
    let value = serde_json::to_value(report).unwrap();
    assert_eq!(value["applied"], 1);
    assert_eq!(value["failed"], 2);
}
