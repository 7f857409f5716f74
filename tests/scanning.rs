mod common;

use std::sync::atomic::Ordering;

use ble_link_core::LinkError;
use ble_link_core::core::bluetooth::{
    AdvertisementRecord, DriverEvent, LinkEvent, RejectReason, UUID_BATTERY_SERVICE,
};
use common::{MONITOR, harness, heart_rate_monitor, monitor, next_event, test_config};

#[tokio::test]
async fn scan_publishes_discoveries_between_start_and_stop() {
    let (mut manager, driver, mut events) = harness(test_config()).await;

    manager.start_scan().await.unwrap();
    assert!(manager.is_scanning());
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStarted);

    let first = heart_rate_monitor();
    let seen_at = first.captured_at;
    assert!(driver.advertise(first));
    assert!(driver.advertise(
        AdvertisementRecord::new("11:22:33:44:55:66")
            .with_services([UUID_BATTERY_SERVICE])
            .with_name("Heart Rate Strap")
    ));
    assert!(driver.advertise(
        heart_rate_monitor()
            .with_rssi(-48)
            .captured_at(seen_at + chrono::Duration::seconds(1))
    ));

    match next_event(&mut events).await {
        LinkEvent::DeviceDiscovered(identity) => {
            assert_eq!(identity.address, monitor());
            assert_eq!(identity.rssi, Some(-62));
            assert_eq!(identity.name.as_deref(), Some("HRM Pro"));
        }
        other => panic!("expected discovery, got {other:?}"),
    }
    match next_event(&mut events).await {
        LinkEvent::DeviceUpdated(identity) => assert_eq!(identity.rssi, Some(-48)),
        other => panic!("expected update, got {other:?}"),
    }

    manager.stop_scan().await.unwrap();
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStopped);
    assert!(!manager.is_scanning());
    assert_eq!(driver.scans_stopped.load(Ordering::SeqCst), 1);

    let accepted = manager.accepted_devices();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].address.as_str(), MONITOR);

    let rejections = manager.registry().rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectReason::NoMatchingServiceId);
}

#[tokio::test]
async fn restarting_a_scan_stops_the_previous_one() {
    let (mut manager, driver, mut events) = harness(test_config()).await;

    manager.start_scan().await.unwrap();
    manager.start_scan().await.unwrap();

    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStarted);
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStopped);
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStarted);
    assert_eq!(driver.scans_started.load(Ordering::SeqCst), 2);
    assert_eq!(driver.scans_stopped.load(Ordering::SeqCst), 1);

    manager.shutdown().await.unwrap();
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStopped);
}

#[tokio::test]
async fn registry_survives_between_scans() {
    let (mut manager, driver, mut events) = harness(test_config()).await;

    manager.start_scan().await.unwrap();
    driver.advertise(heart_rate_monitor());
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStarted);
    assert!(matches!(next_event(&mut events).await, LinkEvent::DeviceDiscovered(_)));
    manager.stop_scan().await.unwrap();

    manager.start_scan().await.unwrap();
    assert!(manager.registry().contains(&monitor()));
    manager.stop_scan().await.unwrap();
}

#[tokio::test]
async fn advertisements_from_the_driver_stream_reach_the_registry() {
    let (manager, _driver, mut events) = harness(test_config()).await;

    manager.handle_driver_event(DriverEvent::Advertisement(heart_rate_monitor()));
    assert!(matches!(next_event(&mut events).await, LinkEvent::DeviceDiscovered(_)));
    assert!(manager.registry().contains(&monitor()));
}

#[tokio::test]
async fn connecting_requires_a_discovered_peripheral() {
    let (manager, driver, _events) = harness(test_config()).await;

    let err = manager.connect(&monitor()).await.unwrap_err();
    assert_eq!(err, LinkError::DeviceNotFound(MONITOR.to_string()));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 0);
    assert_eq!(manager.state(&monitor()), None);
}

#[tokio::test]
async fn shutdown_releases_a_scan_whose_stream_ended() {
    let (mut manager, driver, mut events) = harness(test_config()).await;
    manager.start_scan().await.unwrap();
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStarted);

    driver.end_scan();
    assert_eq!(next_event(&mut events).await, LinkEvent::ScanStopped);
    while manager.is_scanning() {
        tokio::task::yield_now().await;
    }

    manager.shutdown().await.unwrap();
    assert_eq!(driver.scans_stopped.load(Ordering::SeqCst), 1);
}
