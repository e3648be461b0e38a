//! The leased device wrapper handed to allocators.

use crate::monitor::DeviceStateMonitor;
use dpm_core::{DeviceError, DeviceHandle, DeviceState, RecoveryMode};
use dpm_process::{CommandExecutor, CommandStatus};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Timeout for the short adb control commands the wrapper issues itself.
const ADB_CMD_TIMEOUT: Duration = Duration::from_secs(20);
/// How long recovery waits for the device to come back.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(120);
/// Port devices listen on after `adb tcpip`.
const ADB_TCP_PORT: u16 = 5555;

/// A device under lease. Owned by the allocator until it is returned to
/// the manager with `free_device`; the manager keeps refreshing its handle
/// and state from bridge events while it is leased.
pub struct ManagedDevice {
    /// Stable identity key; never changes over the lease lifetime even
    /// when the bridge re-reports the handle.
    serial: String,
    handle: Mutex<DeviceHandle>,
    monitor: Arc<DeviceStateMonitor>,
    executor: Arc<dyn CommandExecutor>,
    adb_path: String,
    recovery_mode: Mutex<RecoveryMode>,
    fastboot_enabled: AtomicBool,
    logcat_child: AsyncMutex<Option<Child>>,
    emulator_child: AsyncMutex<Option<Child>>,
}

impl ManagedDevice {
    pub(crate) fn new(
        handle: DeviceHandle,
        monitor: Arc<DeviceStateMonitor>,
        executor: Arc<dyn CommandExecutor>,
        adb_path: String,
    ) -> Self {
        Self {
            serial: handle.serial.clone(),
            handle: Mutex::new(handle),
            monitor,
            executor,
            adb_path,
            recovery_mode: Mutex::new(RecoveryMode::default()),
            fastboot_enabled: AtomicBool::new(false),
            logcat_child: AsyncMutex::new(None),
            emulator_child: AsyncMutex::new(None),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Snapshot of the current identity.
    pub fn handle(&self) -> Result<DeviceHandle, DeviceError> {
        Ok(self
            .handle
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("device handle"))?
            .clone())
    }

    /// Replace the identity after the bridge re-reported this serial and
    /// propagate the newly reported mode.
    pub fn set_handle(&self, new_handle: DeviceHandle) -> Result<(), DeviceError> {
        if new_handle.serial != self.serial {
            warn!(
                current = %self.serial,
                reported = %new_handle.serial,
                "refusing a handle refresh with a different serial"
            );
            return Ok(());
        }
        let state = new_handle.state;
        *self
            .handle
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("device handle"))? = new_handle;
        self.monitor.set_state(state);
        Ok(())
    }

    pub fn device_state(&self) -> DeviceState {
        self.monitor.state()
    }

    pub fn set_device_state(&self, state: DeviceState) -> Result<(), DeviceError> {
        self.handle
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("device handle"))?
            .state = state;
        self.monitor.set_state(state);
        Ok(())
    }

    pub fn recovery_mode(&self) -> Result<RecoveryMode, DeviceError> {
        Ok(*self
            .recovery_mode
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("recovery mode"))?)
    }

    pub fn set_recovery_mode(&self, mode: RecoveryMode) -> Result<(), DeviceError> {
        *self
            .recovery_mode
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("recovery mode"))? = mode;
        Ok(())
    }

    pub fn fastboot_enabled(&self) -> bool {
        self.fastboot_enabled.load(Ordering::SeqCst)
    }

    pub fn set_fastboot_enabled(&self, enabled: bool) {
        self.fastboot_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Start capturing logcat in the background. Failure to start is
    /// logged, not raised; capture is an aid, not a requirement.
    pub async fn start_logcat(&self) {
        let mut slot = self.logcat_child.lock().await;
        if slot.is_some() {
            return;
        }
        let argv = self.adb_argv(&["logcat", "-v", "threadtime"]);
        match self.executor.run_in_background(&argv).await {
            Ok(child) => {
                debug!(serial = %self.serial, "logcat capture started");
                *slot = Some(child);
            }
            Err(e) => {
                warn!(serial = %self.serial, error = %format!("{e:#}"), "failed to start logcat capture");
            }
        }
    }

    pub async fn stop_logcat(&self) {
        if let Some(mut child) = self.logcat_child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(serial = %self.serial, "logcat capture stopped");
        }
    }

    /// Record the emulator process backing this device. The device owns it
    /// until the lease is freed.
    pub async fn set_emulator_process(&self, child: Child) {
        *self.emulator_child.lock().await = Some(child);
    }

    pub async fn take_emulator_process(&self) -> Option<Child> {
        self.emulator_child.lock().await.take()
    }

    pub async fn has_emulator_process(&self) -> bool {
        self.emulator_child.lock().await.is_some()
    }

    pub async fn wait_for_device_online(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_online(timeout).await
    }

    pub async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_available(timeout).await
    }

    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_not_available(timeout).await
    }

    /// Bring the device back per the installed [`RecoveryMode`].
    pub async fn recover_device(&self) -> Result<(), DeviceError> {
        match self.recovery_mode()? {
            RecoveryMode::Abort => Err(DeviceError::RecoveryAborted(self.serial.clone())),
            RecoveryMode::None => Ok(()),
            RecoveryMode::Available => {
                if self.monitor.wait_for_device_available(RECOVERY_TIMEOUT).await {
                    Ok(())
                } else {
                    Err(DeviceError::DeviceNotAvailable(
                        self.serial.clone(),
                        "device did not recover to an available state".to_string(),
                    ))
                }
            }
        }
    }

    /// Switch the device's adb transport to TCP. Returns the `ip:port`
    /// endpoint to connect to, or `None` when the switch failed.
    pub async fn switch_to_adb_tcp(&self) -> Option<String> {
        let result = self
            .executor
            .run_timed_cmd(
                ADB_CMD_TIMEOUT,
                &self.adb_argv(&["shell", "ip", "-f", "inet", "addr", "show", "wlan0"]),
            )
            .await;
        let Some(ip) = parse_ip_address(&result.stdout) else {
            warn!(serial = %self.serial, "could not determine the device ip address");
            return None;
        };

        let result = self
            .executor
            .run_timed_cmd(ADB_CMD_TIMEOUT, &self.adb_argv(&["tcpip", &ADB_TCP_PORT.to_string()]))
            .await;
        if result.status != CommandStatus::Success {
            warn!(serial = %self.serial, status = ?result.status, "adb tcpip failed");
            return None;
        }
        Some(format!("{ip}:{ADB_TCP_PORT}"))
    }

    /// Switch the device's adb transport back to USB.
    pub async fn switch_to_adb_usb(&self) -> bool {
        let result = self
            .executor
            .run_timed_cmd(ADB_CMD_TIMEOUT, &self.adb_argv(&["usb"]))
            .await;
        result.status == CommandStatus::Success
    }

    fn adb_argv(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = vec![self.adb_path.clone(), "-s".to_string(), self.serial.clone()];
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }
}

fn parse_ip_address(output: &str) -> Option<String> {
    static INET_LINE: OnceLock<Regex> = OnceLock::new();
    let re = INET_LINE
        .get_or_init(|| Regex::new(r"inet (\d+\.\d+\.\d+\.\d+)").expect("static regex compiles"));
    re.captures(output).map(|caps| caps[1].to_string())
}
