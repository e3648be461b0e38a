//! Background poller for devices in fastboot mode.
//!
//! Fastboot devices are invisible to the bridge, so the pool polls
//! `fastboot devices` on a fixed period and reclassifies leased devices
//! that enter or leave fastboot mode.

use crate::managed::ManagedDevice;
use async_trait::async_trait;
use dpm_core::DeviceState;
use dpm_process::CommandExecutor;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timeout for one `fastboot devices` enumeration.
pub(crate) const FASTBOOT_ENUMERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Subscriber notified after every fastboot polling cycle.
#[async_trait]
pub trait FastbootListener: Send + Sync {
    async fn state_updated(&self);
}

pub(crate) struct FastbootMonitor {
    fastboot_path: String,
    executor: Arc<dyn CommandExecutor>,
    allocated: Arc<Mutex<HashMap<String, Arc<ManagedDevice>>>>,
    listeners: Arc<Mutex<Vec<Arc<dyn FastbootListener>>>>,
    poll_interval: Duration,
}

impl FastbootMonitor {
    pub fn new(
        fastboot_path: String,
        executor: Arc<dyn CommandExecutor>,
        allocated: Arc<Mutex<HashMap<String, Arc<ManagedDevice>>>>,
        listeners: Arc<Mutex<Vec<Arc<dyn FastbootListener>>>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fastboot_path,
            executor,
            allocated,
            listeners,
            poll_interval,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("fastboot monitor started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => self.tick().await,
                }
            }
            debug!("fastboot monitor stopped");
        })
    }

    async fn tick(&self) {
        // Polling fastboot with nobody subscribed can wedge a real fastboot
        // command someone else is running against the device.
        match self.listeners.lock() {
            Ok(listeners) => {
                if listeners.is_empty() {
                    return;
                }
            }
            Err(_) => {
                error!("fastboot listeners lock poisoned; skipping poll");
                return;
            }
        }

        let argv = vec![self.fastboot_path.clone(), "devices".to_string()];
        let result = self
            .executor
            .run_timed_cmd(FASTBOOT_ENUMERATE_TIMEOUT, &argv)
            .await;
        if !result.success() {
            warn!(status = ?result.status, "fastboot devices enumeration failed");
        }
        let serials = parse_fastboot_serials(&result.stdout);

        match self.allocated.lock() {
            Ok(allocated) => {
                for (serial, device) in allocated.iter() {
                    if serials.contains(serial.as_str()) {
                        if device.device_state() != DeviceState::Fastboot {
                            info!(serial = %serial, "leased device entered fastboot mode");
                            if let Err(e) = device.set_device_state(DeviceState::Fastboot) {
                                warn!(serial = %serial, error = %e, "failed to update device state");
                            }
                        }
                    } else if device.device_state() == DeviceState::Fastboot {
                        info!(serial = %serial, "leased device left fastboot mode");
                        if let Err(e) = device.set_device_state(DeviceState::NotAvailable) {
                            warn!(serial = %serial, error = %e, "failed to update device state");
                        }
                    }
                }
            }
            Err(_) => error!("allocated map lock poisoned; skipping reclassification"),
        }

        // Notify a snapshot so a listener resubscribing from its callback
        // cannot deadlock against the set.
        let listeners: Vec<_> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                error!("fastboot listeners lock poisoned; skipping notification");
                return;
            }
        };
        for listener in listeners {
            listener.state_updated().await;
        }
    }
}

/// Extract serials from `fastboot devices` output lines of the form
/// `<serial>\tfastboot`.
pub(crate) fn parse_fastboot_serials(output: &str) -> HashSet<String> {
    static DEVICE_LINE: OnceLock<Regex> = OnceLock::new();
    let re = DEVICE_LINE
        .get_or_init(|| Regex::new(r"^([\w\d]+)\s+fastboot\s*$").expect("static regex compiles"));
    output
        .lines()
        .filter_map(|line| re.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}
