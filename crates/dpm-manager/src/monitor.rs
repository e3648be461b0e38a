//! Per-device state observation.

use dpm_core::DeviceState;
use dpm_process::{CommandExecutor, CommandStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Budget for a single adb shell round-trip.
pub(crate) const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between failed shell probes.
const SHELL_PROBE_POLL: Duration = Duration::from_secs(1);

/// Observes a single device's reported state and answers "wait until…"
/// questions about it.
///
/// State transitions are driven externally: bridge callbacks and the
/// fastboot monitor call [`set_state`](Self::set_state); the monitor never
/// changes state on its own. Shell responsiveness is probed actively
/// through the command executor.
pub struct DeviceStateMonitor {
    serial: String,
    adb_path: String,
    executor: Arc<dyn CommandExecutor>,
    state_tx: watch::Sender<DeviceState>,
}

impl DeviceStateMonitor {
    pub fn new(
        serial: String,
        adb_path: String,
        executor: Arc<dyn CommandExecutor>,
        initial_state: DeviceState,
    ) -> Self {
        let (state_tx, _) = watch::channel(initial_state);
        Self {
            serial,
            adb_path,
            executor,
            state_tx,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: DeviceState) {
        if self.state_tx.send_replace(state) != state {
            debug!(serial = %self.serial, ?state, "device state updated");
        }
    }

    /// Wait until an adb shell probe succeeds, retrying until `timeout`
    /// elapses.
    pub async fn wait_for_device_shell(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let argv = vec![
            self.adb_path.clone(),
            "-s".to_string(),
            self.serial.clone(),
            "shell".to_string(),
            "id".to_string(),
        ];
        loop {
            let budget = SHELL_PROBE_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            let result = self.executor.run_timed_cmd_silently(budget, &argv).await;
            if result.status == CommandStatus::Success {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(serial = %self.serial, "device shell did not become responsive");
                return false;
            }
            dpm_process::sleep(SHELL_PROBE_POLL.min(deadline - now)).await;
        }
    }

    pub async fn wait_for_device_online(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, DeviceState::Online).await
    }

    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, DeviceState::NotAvailable).await
    }

    /// Online and answering shell commands, all within `timeout`.
    pub async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.wait_for_device_online(timeout).await {
            return false;
        }
        self.wait_for_device_shell(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    async fn wait_for_state(&self, timeout: Duration, target: DeviceState) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}
