//! Fastboot probing, polling, and reclassification.

mod common;

use common::*;
use dpm_core::{DeviceError, DeviceHandle, DeviceKind, DeviceState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn fastboot_reclassifies_leased_devices() {
    let h = harness(test_config());
    h.executor.set_default("fastboot help", ok(""));
    h.executor.set_default("fastboot devices", ok(""));
    h.manager.init(None).await.expect("init");
    assert!(h.manager.is_fastboot_enabled());

    h.bridge
        .fire_connected(&DeviceHandle::physical("FB01", DeviceState::Online))
        .await;
    let device = h
        .manager
        .allocate_device_timeout(Duration::from_secs(1))
        .await
        .expect("initialized")
        .expect("FB01");

    let listener = Arc::new(CountingFastbootListener::default());
    h.manager
        .add_fastboot_listener(listener.clone())
        .expect("fastboot is enabled");

    // The enumerator starts reporting FB01 in fastboot mode.
    h.executor.set_default("fastboot devices", ok("FB01\tfastboot\n"));
    {
        let device = device.clone();
        wait_until(move || device.device_state() == DeviceState::Fastboot).await;
    }
    let updates_after_fastboot = listener.updates.load(Ordering::SeqCst);
    assert!(updates_after_fastboot >= 1, "listeners are notified per tick");

    // FB01 disappears from the enumeration: back to not-available.
    h.executor.set_default("fastboot devices", ok(""));
    {
        let device = device.clone();
        wait_until(move || device.device_state() == DeviceState::NotAvailable).await;
    }
    assert!(listener.updates.load(Ordering::SeqCst) > updates_after_fastboot);
}

#[tokio::test]
async fn fastboot_monitor_skips_polling_without_subscribers() {
    let h = harness(test_config());
    h.executor.set_default("fastboot help", ok(""));
    h.manager.init(None).await.expect("init");

    // One enumeration happens at init; idle ticks must not add more.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.executor.calls_matching("fastboot devices"), 1);
}

#[tokio::test]
async fn removing_the_last_listener_stops_polling() {
    let h = harness(test_config());
    h.executor.set_default("fastboot help", ok(""));
    h.manager.init(None).await.expect("init");

    let listener = Arc::new(CountingFastbootListener::default());
    h.manager
        .add_fastboot_listener(listener.clone())
        .expect("fastboot is enabled");
    {
        let listener = listener.clone();
        wait_until(move || listener.updates.load(Ordering::SeqCst) >= 1).await;
    }

    let fastboot_listener: Arc<dyn dpm_manager::FastbootListener> = listener.clone();
    h.manager
        .remove_fastboot_listener(&fastboot_listener)
        .expect("remove listener");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let calls = h.executor.calls_matching("fastboot devices");
    let updates = listener.updates.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.executor.calls_matching("fastboot devices"), calls);
    assert_eq!(listener.updates.load(Ordering::SeqCst), updates);
}

#[tokio::test]
async fn subscribing_without_fastboot_support_fails() {
    let h = harness(test_config());
    h.manager.init(None).await.expect("init");
    assert!(!h.manager.is_fastboot_enabled());

    let listener = Arc::new(CountingFastbootListener::default());
    assert!(matches!(
        h.manager.add_fastboot_listener(listener),
        Err(DeviceError::FastbootNotSupported)
    ));
}

#[tokio::test]
async fn usage_on_stderr_also_counts_as_fastboot_support() {
    let h = harness(test_config());
    h.executor
        .set_default("fastboot help", failed("usage: fastboot [OPTION...] COMMAND"));
    h.manager.init(None).await.expect("init");
    assert!(h.manager.is_fastboot_enabled());
}

#[tokio::test]
async fn init_pools_devices_already_in_fastboot_mode() {
    let h = harness(test_config());
    h.executor.set_default("fastboot help", ok(""));
    h.executor.set_default("fastboot devices", ok("FB99\tfastboot\n"));
    h.manager.init(None).await.expect("init");

    let device = h
        .manager
        .allocate_device_timeout(Duration::from_secs(1))
        .await
        .expect("initialized")
        .expect("fastboot stub");
    assert_eq!(device.serial(), "FB99");
    assert_eq!(device.handle().expect("handle").kind, DeviceKind::FastbootStub);
    assert_eq!(device.device_state(), DeviceState::Fastboot);
}

#[tokio::test]
async fn terminate_stops_the_fastboot_monitor() {
    let h = harness(test_config());
    h.executor.set_default("fastboot help", ok(""));
    h.manager.init(None).await.expect("init");
    let listener = Arc::new(CountingFastbootListener::default());
    h.manager
        .add_fastboot_listener(listener.clone())
        .expect("fastboot is enabled");
    {
        let listener = listener.clone();
        wait_until(move || listener.updates.load(Ordering::SeqCst) >= 1).await;
    }

    h.manager.terminate().await.expect("terminate");
    let calls = h.executor.calls_matching("fastboot devices");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        h.executor.calls_matching("fastboot devices"),
        calls,
        "no polling after terminate"
    );
}
