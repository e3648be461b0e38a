//! TCP attach/detach flows.

mod common;

use common::*;
use dpm_core::{DeviceHandle, DeviceState, RecoveryMode};
use std::time::{Duration, Instant};

#[tokio::test]
async fn tcp_connect_retries_then_succeeds() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    let serial = "10.0.0.5:5555";

    h.executor.enqueue("adb connect 10.0.0.5:5555", failed("unable to connect"));
    h.executor.enqueue("adb connect 10.0.0.5:5555", failed("unable to connect"));
    h.executor
        .enqueue("adb connect 10.0.0.5:5555", ok("connected to 10.0.0.5:5555\n"));

    // The bridge reports the device once adb has attached it.
    let bridge = h.bridge.clone();
    let fire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        bridge
            .fire_connected(&DeviceHandle::physical("10.0.0.5:5555", DeviceState::Online))
            .await;
    });

    let start = Instant::now();
    let device = h
        .manager
        .connect_to_tcp_device(serial)
        .await
        .expect("initialized")
        .expect("third attempt connects");
    fire.await.expect("bridge task");

    assert_eq!(device.serial(), serial);
    assert_eq!(h.executor.calls_matching("adb connect 10.0.0.5:5555"), 3);
    // Two retry sleeps must have elapsed.
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(device.device_state(), DeviceState::Online);
}

#[tokio::test]
async fn tcp_connect_gives_up_after_three_failures() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    h.executor.set_default("adb connect", failed("unable to connect"));

    let result = h
        .manager
        .connect_to_tcp_device("10.0.0.5:5555")
        .await
        .expect("initialized");

    assert!(result.is_none());
    assert_eq!(h.executor.calls_matching("adb connect 10.0.0.5:5555"), 3);
    assert!(
        h.manager.allocated_devices().expect("allocated query").is_empty(),
        "the placeholder lease must be freed on failure"
    );
}

#[tokio::test]
async fn tcp_connect_refuses_an_already_leased_serial() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    let serial = "10.0.0.5:5555";
    h.executor
        .enqueue("adb connect 10.0.0.5:5555", ok("connected to 10.0.0.5:5555\n"));

    let bridge = h.bridge.clone();
    let fire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge
            .fire_connected(&DeviceHandle::physical("10.0.0.5:5555", DeviceState::Online))
            .await;
    });
    let device = h
        .manager
        .connect_to_tcp_device(serial)
        .await
        .expect("initialized")
        .expect("first connect");
    fire.await.expect("bridge task");

    let connects_so_far = h.executor.calls_matching("adb connect");
    assert!(
        h.manager
            .connect_to_tcp_device(serial)
            .await
            .expect("initialized")
            .is_none()
    );
    assert_eq!(
        h.executor.calls_matching("adb connect"),
        connects_so_far,
        "a refused connect must not touch adb"
    );

    assert_eq!(device.serial(), serial);
}

#[tokio::test]
async fn disconnect_from_tcp_frees_the_lease() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    let serial = "10.0.0.5:5555";
    h.executor
        .enqueue("adb connect 10.0.0.5:5555", ok("connected to 10.0.0.5:5555\n"));

    let bridge = h.bridge.clone();
    let fire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge
            .fire_connected(&DeviceHandle::physical("10.0.0.5:5555", DeviceState::Online))
            .await;
    });
    let device = h
        .manager
        .connect_to_tcp_device(serial)
        .await
        .expect("initialized")
        .expect("connect");
    fire.await.expect("bridge task");

    let switched = h
        .manager
        .disconnect_from_tcp_device(&device)
        .await
        .expect("initialized");
    assert!(switched);
    assert_eq!(h.executor.calls_matching("adb -s 10.0.0.5:5555 usb"), 1);
    assert!(h.manager.allocated_devices().expect("allocated query").is_empty());
}

#[tokio::test]
async fn reconnect_moves_a_usb_lease_to_tcp() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    h.bridge
        .fire_connected(&DeviceHandle::physical("A1B2", DeviceState::Online))
        .await;
    let usb_device = h
        .manager
        .allocate_device_timeout(Duration::from_secs(1))
        .await
        .expect("initialized")
        .expect("usb device");

    h.executor.set_default(
        "adb -s A1B2 shell ip",
        ok("    inet 192.168.1.7/24 brd 192.168.1.255 scope global wlan0\n"),
    );
    h.executor
        .enqueue("adb connect 192.168.1.7:5555", ok("connected to 192.168.1.7:5555\n"));

    let bridge = h.bridge.clone();
    let fire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge
            .fire_connected(&DeviceHandle::physical("192.168.1.7:5555", DeviceState::Online))
            .await;
    });

    let tcp_device = h
        .manager
        .reconnect_device_to_tcp(&usb_device)
        .await
        .expect("initialized")
        .expect("tcp lease");
    fire.await.expect("bridge task");

    assert_eq!(tcp_device.serial(), "192.168.1.7:5555");
    assert_eq!(h.executor.calls_matching("adb -s A1B2 tcpip 5555"), 1);
}

#[tokio::test]
async fn reconnect_recovers_the_usb_side_on_switch_failure() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    h.bridge
        .fire_connected(&DeviceHandle::physical("A1B2", DeviceState::Online))
        .await;
    let usb_device = h
        .manager
        .allocate_device_timeout(Duration::from_secs(1))
        .await
        .expect("initialized")
        .expect("usb device");

    // No parsable address: the transport switch fails before adb connect.
    h.executor
        .set_default("adb -s A1B2 shell ip", ok("wlan0: no address assigned"));
    usb_device
        .set_recovery_mode(RecoveryMode::None)
        .expect("set recovery mode");

    let result = h
        .manager
        .reconnect_device_to_tcp(&usb_device)
        .await
        .expect("recovery mode none swallows the failure");
    assert!(result.is_none());
    assert_eq!(h.executor.calls_matching("adb connect"), 0);
}
