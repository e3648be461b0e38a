//! Shared fakes for driving the pool without a real bridge or adb.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use dpm_core::DeviceHandle;
use dpm_manager::{DebugBridge, DeviceChangeListener, DeviceManager, FastbootListener, PoolConfig};
use dpm_process::{CommandExecutor, CommandResult, CommandStatus};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        status: CommandStatus::Success,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

pub fn failed(stderr: &str) -> CommandResult {
    CommandResult {
        status: CommandStatus::Failed,
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

pub fn timed_out() -> CommandResult {
    CommandResult::new(CommandStatus::TimedOut)
}

/// Scripted stand-in for the host `adb`/`fastboot` binaries.
///
/// Results are matched by command-line prefix. One-shot results queued
/// with `enqueue` are consumed in order and beat the sticky defaults set
/// with `set_default`; with no match at all the command "succeeds" with
/// empty output.
#[derive(Default)]
pub struct FakeExecutor {
    queued: Mutex<Vec<(String, VecDeque<CommandResult>)>>,
    sticky: Mutex<Vec<(String, CommandResult)>>,
    calls: Mutex<Vec<String>>,
    background_argv: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        let executor = Self::default();
        *executor.background_argv.lock().unwrap() =
            vec!["sleep".to_string(), "60".to_string()];
        Arc::new(executor)
    }

    pub fn enqueue(&self, prefix: &str, result: CommandResult) {
        let mut queued = self.queued.lock().unwrap();
        if let Some((_, results)) = queued.iter_mut().find(|(p, _)| p == prefix) {
            results.push_back(result);
        } else {
            queued.push((prefix.to_string(), VecDeque::from([result])));
        }
    }

    pub fn set_default(&self, prefix: &str, result: CommandResult) {
        let mut sticky = self.sticky.lock().unwrap();
        if let Some((_, existing)) = sticky.iter_mut().find(|(p, _)| p == prefix) {
            *existing = result;
        } else {
            sticky.push((prefix.to_string(), result));
        }
    }

    /// What `run_in_background` actually spawns (the argv it was asked to
    /// spawn is only recorded).
    pub fn set_background_command(&self, argv: &[&str]) {
        *self.background_argv.lock().unwrap() = argv.iter().map(|s| s.to_string()).collect();
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn lookup(&self, argv: &[String]) -> CommandResult {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let mut queued = self.queued.lock().unwrap();
        let best = queued
            .iter()
            .enumerate()
            .filter(|(_, (prefix, results))| line.starts_with(prefix.as_str()) && !results.is_empty())
            .max_by_key(|(_, (prefix, _))| prefix.len())
            .map(|(index, _)| index);
        if let Some(index) = best {
            return queued[index].1.pop_front().expect("checked non-empty");
        }
        drop(queued);

        self.sticky
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| ok(""))
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run_timed_cmd(&self, _timeout: Duration, argv: &[String]) -> CommandResult {
        self.lookup(argv)
    }

    async fn run_timed_cmd_with_input(
        &self,
        _timeout: Duration,
        _input: &str,
        argv: &[String],
    ) -> CommandResult {
        self.lookup(argv)
    }

    async fn run_timed_cmd_silently(&self, _timeout: Duration, argv: &[String]) -> CommandResult {
        self.lookup(argv)
    }

    async fn run_in_background(&self, argv: &[String]) -> Result<Child> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("[background] {}", argv.join(" ")));
        let spawn_argv = self.background_argv.lock().unwrap().clone();
        let mut cmd = Command::new(&spawn_argv[0]);
        cmd.args(&spawn_argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Ok(cmd.spawn()?)
    }
}

/// Hand-driven debug bridge.
#[derive(Default)]
pub struct FakeBridge {
    listeners: Mutex<Vec<Arc<dyn DeviceChangeListener>>>,
    view: Mutex<Vec<DeviceHandle>>,
    pub init_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
}

impl FakeBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn DeviceChangeListener>> {
        self.listeners.lock().unwrap().clone()
    }

    fn upsert_view(&self, device: &DeviceHandle) {
        let mut view = self.view.lock().unwrap();
        if let Some(existing) = view.iter_mut().find(|d| d.serial == device.serial) {
            *existing = device.clone();
        } else {
            view.push(device.clone());
        }
    }

    pub async fn fire_connected(&self, device: &DeviceHandle) {
        self.upsert_view(device);
        for listener in self.snapshot_listeners() {
            listener.device_connected(device).await;
        }
    }

    pub async fn fire_changed(&self, device: &DeviceHandle, change_mask: u32) {
        self.upsert_view(device);
        for listener in self.snapshot_listeners() {
            listener.device_changed(device, change_mask).await;
        }
    }

    pub async fn fire_disconnected(&self, device: &DeviceHandle) {
        self.view.lock().unwrap().retain(|d| d.serial != device.serial);
        for listener in self.snapshot_listeners() {
            listener.device_disconnected(device).await;
        }
    }
}

#[async_trait]
impl DebugBridge for FakeBridge {
    async fn init(&self, _client_support: bool, _adb_binary: &str) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn devices(&self) -> Vec<DeviceHandle> {
        self.view.lock().unwrap().clone()
    }

    fn set_event_timeout(&self, _timeout: Duration) {}

    fn add_device_change_listener(&self, listener: Arc<dyn DeviceChangeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_device_change_listener(&self, listener: &Arc<dyn DeviceChangeListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

#[derive(Default)]
pub struct CountingFastbootListener {
    pub updates: AtomicUsize,
}

#[async_trait]
impl FastbootListener for CountingFastbootListener {
    async fn state_updated(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub manager: DeviceManager,
    pub bridge: Arc<FakeBridge>,
    pub executor: Arc<FakeExecutor>,
}

/// Pool over a fake bridge and executor. Fastboot stays disabled unless a
/// test scripts the `fastboot help` probe to pass.
pub fn harness(config: PoolConfig) -> Harness {
    let bridge = FakeBridge::new();
    let executor = FakeExecutor::new();
    executor.set_default("fastboot help", failed("fastboot: not found"));
    let manager = DeviceManager::new(config, bridge.clone(), executor.clone());
    Harness {
        manager,
        bridge,
        executor,
    }
}

/// Config with no slot stubs, short timeouts, and inline admission.
pub fn test_config() -> PoolConfig {
    PoolConfig {
        num_emulator_slots: 0,
        num_null_devices: 0,
        available_check_timeout_ms: 500,
        adb_connect_retry_delay_ms: 50,
        fastboot_poll_interval_ms: 50,
        sync_mode: true,
        ..PoolConfig::default()
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
