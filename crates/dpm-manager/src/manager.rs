//! The central device pool: admission, exclusive leasing, emulator and
//! TCP device lifecycles, termination.

use crate::bridge::{CHANGE_STATE, DebugBridge, DeviceChangeListener};
use crate::config::PoolConfig;
use crate::fastboot::{
    FASTBOOT_ENUMERATE_TIMEOUT, FastbootListener, FastbootMonitor, parse_fastboot_serials,
};
use crate::managed::ManagedDevice;
use crate::monitor::DeviceStateMonitor;
use async_trait::async_trait;
use dpm_core::{
    DeviceError, DeviceHandle, DeviceSelection, DeviceState, FreeDeviceState, RecoveryMode,
};
use dpm_process::{CommandExecutor, sleep};
use dpm_queue::ConditionalQueue;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timeout for the `fastboot help` availability probe.
const FASTBOOT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound handed to the bridge for its own operations.
const BRIDGE_EVENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Console port of the first emulator slot; subsequent slots step by 2.
const EMULATOR_BASE_PORT: u16 = 5554;
/// Grace period before checking that a launched emulator survived.
const EMULATOR_LAUNCH_CHECK_DELAY: Duration = Duration::from_millis(500);
/// How long an emulator gets to die after a kill request.
const EMULATOR_KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for reaching the local emulator console.
const EMULATOR_CONSOLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-attempt timeout for `adb connect`.
const ADB_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const ADB_CONNECT_ATTEMPTS: u32 = 3;
/// How long a TCP device gets to come online after `adb connect`.
const TCP_ONLINE_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace window force-allocate grants a handle that is already pooled.
const FORCE_ALLOCATE_POLL: Duration = Duration::from_millis(1);

const LIFECYCLE_CREATED: u8 = 0;
const LIFECYCLE_INITIALIZING: u8 = 1;
const LIFECYCLE_INITIALIZED: u8 = 2;
const LIFECYCLE_TERMINATED: u8 = 3;

/// Optional observer subsystem interested in listing the fleet.
pub trait PoolMonitor: Send + Sync {
    /// Receives a closure that snapshots every device the pool knows of.
    fn set_device_lister(&self, lister: Box<dyn Fn() -> Vec<DeviceHandle> + Send + Sync>);
}

/// The device pool. Cheap to clone; all clones share one pool.
///
/// Construct with [`new`](Self::new), wire everything with
/// [`init`](Self::init) exactly once, then lease devices through the
/// `allocate_*` methods. Every leased device must come back through
/// [`free_device`](Self::free_device).
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    bridge: Arc<dyn DebugBridge>,
    executor: Arc<dyn CommandExecutor>,
    lifecycle: AtomicU8,
    global_filter: Mutex<Option<DeviceSelection>>,
    available: ConditionalQueue<DeviceHandle>,
    allocated: Arc<Mutex<HashMap<String, Arc<ManagedDevice>>>>,
    checking: Mutex<HashMap<String, Arc<DeviceStateMonitor>>>,
    fastboot_enabled: AtomicBool,
    fastboot_listeners: Arc<Mutex<Vec<Arc<dyn FastbootListener>>>>,
    fastboot_task: AsyncMutex<Option<JoinHandle<()>>>,
    bridge_listener: Mutex<Option<Arc<BridgeEventHandler>>>,
    pool_monitor: Mutex<Option<Arc<dyn PoolMonitor>>>,
    shutdown: watch::Sender<bool>,
    check_permits: Arc<Semaphore>,
}

impl DeviceManager {
    pub fn new(
        config: PoolConfig,
        bridge: Arc<dyn DebugBridge>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let check_permits = Arc::new(Semaphore::new(config.max_concurrent_checks.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                bridge,
                executor,
                lifecycle: AtomicU8::new(LIFECYCLE_CREATED),
                global_filter: Mutex::new(None),
                available: ConditionalQueue::new(),
                allocated: Arc::new(Mutex::new(HashMap::new())),
                checking: Mutex::new(HashMap::new()),
                fastboot_enabled: AtomicBool::new(false),
                fastboot_listeners: Arc::new(Mutex::new(Vec::new())),
                fastboot_task: AsyncMutex::new(None),
                bridge_listener: Mutex::new(None),
                pool_monitor: Mutex::new(None),
                shutdown,
                check_permits,
            }),
        }
    }

    /// Install the optional monitor subsystem hook. Must be called before
    /// [`init`](Self::init) to take effect.
    pub fn set_pool_monitor(&self, monitor: Arc<dyn PoolMonitor>) -> Result<(), DeviceError> {
        *self
            .inner
            .pool_monitor
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("pool monitor"))? = Some(monitor);
        Ok(())
    }

    /// Wire the pool: probe fastboot, start its monitor, register with the
    /// bridge *before* starting it, and seed the emulator and null-device
    /// slot stubs. Callable exactly once; later calls fail with
    /// [`DeviceError::AlreadyInitialized`]. The pool only accepts other
    /// operations after everything here completed.
    pub async fn init(&self, global_filter: Option<DeviceSelection>) -> Result<(), DeviceError> {
        if self
            .inner
            .lifecycle
            .compare_exchange(
                LIFECYCLE_CREATED,
                LIFECYCLE_INITIALIZING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(DeviceError::AlreadyInitialized);
        }

        match self.init_wiring(global_filter).await {
            Ok(fastboot_available) => {
                // Flip the flag last: nothing above may be observable
                // through the lease API half-built.
                self.inner
                    .lifecycle
                    .store(LIFECYCLE_INITIALIZED, Ordering::SeqCst);
                info!(fastboot = fastboot_available, "device manager initialized");
                Ok(())
            }
            Err(e) => {
                self.inner
                    .lifecycle
                    .store(LIFECYCLE_TERMINATED, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// The ordered init steps; returns whether fastboot is usable.
    async fn init_wiring(
        &self,
        global_filter: Option<DeviceSelection>,
    ) -> Result<bool, DeviceError> {
        *self
            .inner
            .global_filter
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("global filter"))? = global_filter;

        let fastboot_available = self.inner.probe_fastboot().await;
        self.inner
            .fastboot_enabled
            .store(fastboot_available, Ordering::SeqCst);
        if fastboot_available {
            let monitor = FastbootMonitor::new(
                self.inner.config.fastboot_path.clone(),
                self.inner.executor.clone(),
                self.inner.allocated.clone(),
                self.inner.fastboot_listeners.clone(),
                self.inner.config.fastboot_poll_interval(),
            );
            let task = monitor.spawn(self.inner.shutdown.subscribe());
            *self.inner.fastboot_task.lock().await = Some(task);
            self.inner.pool_current_fastboot_devices().await?;
        } else {
            debug!("fastboot not usable on this host; fastboot support disabled");
        }

        self.inner.bridge.set_event_timeout(BRIDGE_EVENT_TIMEOUT);

        // Listen before the bridge starts so no connect event can be lost.
        let handler = Arc::new(BridgeEventHandler {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.bridge.add_device_change_listener(handler.clone());
        *self
            .inner
            .bridge_listener
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("bridge listener"))? = Some(handler);

        let pool_monitor = self
            .inner
            .pool_monitor
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("pool monitor"))?
            .clone();
        if let Some(monitor) = pool_monitor {
            let weak = Arc::downgrade(&self.inner);
            monitor.set_device_lister(Box::new(move || {
                weak.upgrade()
                    .and_then(|inner| inner.list_known_devices().ok())
                    .unwrap_or_default()
            }));
        }

        self.inner
            .bridge
            .init(false, &self.inner.config.adb_path)
            .await
            .map_err(|e| DeviceError::Bridge(format!("{e:#}")))?;

        for slot in 0..self.inner.config.num_emulator_slots {
            self.inner
                .available
                .add(DeviceHandle::emulator_stub(EMULATOR_BASE_PORT + 2 * slot))
                .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
        }
        for index in 0..self.inner.config.num_null_devices {
            self.inner
                .available
                .add(DeviceHandle::null_stub(index))
                .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
        }

        Ok(fastboot_available)
    }

    /// Lease any available device, waiting as long as it takes.
    pub async fn allocate_device(&self) -> Result<Arc<ManagedDevice>, DeviceError> {
        self.ensure_initialized()?;
        self.allocate_blocking(DeviceSelection::default()).await
    }

    /// Lease any available device, waiting at most `timeout`. `None` on
    /// expiry.
    pub async fn allocate_device_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        self.allocate_matching(timeout, DeviceSelection::default()).await
    }

    /// Lease the earliest-pooled device matching `selection`, waiting at
    /// most `timeout`.
    pub async fn allocate_matching(
        &self,
        timeout: Duration,
        selection: DeviceSelection,
    ) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        self.ensure_initialized()?;
        match tokio::time::timeout(timeout, self.allocate_blocking(selection)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                debug!("device allocation timed out");
                Ok(None)
            }
        }
    }

    async fn allocate_blocking(
        &self,
        selection: DeviceSelection,
    ) -> Result<Arc<ManagedDevice>, DeviceError> {
        loop {
            let matcher_selection = selection.clone();
            let handle = self
                .inner
                .available
                .take(move |handle| matcher_selection.matches(handle))
                .await
                .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
            if let Some(device) = self.inner.lease(handle).await? {
                return Ok(device);
            }
            // The serial collided with a force-allocated lease; wait for
            // the next candidate.
        }
    }

    /// Pre-register a lease on `serial`. When the serial is already pooled
    /// the live handle is used; otherwise a placeholder stub is leased so
    /// the serial is reserved before the device appears. Returns `None`
    /// when the serial is already leased.
    ///
    /// The pooled-handle lookup is a deliberately tiny grace window; a
    /// device arriving concurrently may still end up stubbed.
    pub async fn force_allocate_device(
        &self,
        serial: &str,
    ) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        self.ensure_initialized()?;
        if !DeviceHandle::serial_is_valid(serial) {
            return Err(DeviceError::InvalidSerial(serial.to_string()));
        }
        if self
            .inner
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?
            .contains_key(serial)
        {
            debug!(serial = %serial, "force-allocate refused; serial already leased");
            return Ok(None);
        }
        let wanted = serial.to_string();
        let handle = self
            .inner
            .available
            .poll(FORCE_ALLOCATE_POLL, move |handle| handle.serial == wanted)
            .await
            .map_err(|_| DeviceError::LockPoisoned("available queue"))?
            .unwrap_or_else(|| DeviceHandle::stub(serial));
        self.inner.lease(handle).await
    }

    /// Return a leased device. `Available` and `Unresponsive` re-pool the
    /// handle; `Unavailable` and `Ignore` drop it. Emulators are killed,
    /// their slot stub returns to the pool regardless of `state`.
    pub async fn free_device(
        &self,
        device: &Arc<ManagedDevice>,
        state: FreeDeviceState,
    ) -> Result<(), DeviceError> {
        device.stop_logcat().await;
        let serial = device.serial();
        let removed = self
            .inner
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?
            .remove(serial);
        if removed.is_none() {
            warn!(serial = %serial, "ignoring free of a device that was not leased");
            return Ok(());
        }

        let mut handle = device.handle()?;
        let mut state = state;
        if handle.is_emulator() {
            if let Err(e) = self.inner.kill_emulator(device).await {
                error!(serial = %serial, error = %e, "failed to kill emulator");
            }
            // The slot outlives the lease: pool a fresh stub in its place.
            handle = match handle.emulator_port() {
                Some(port) => DeviceHandle::emulator_stub(port),
                None => DeviceHandle::stub(serial),
            };
            state = FreeDeviceState::Available;
        }

        match state {
            FreeDeviceState::Available | FreeDeviceState::Unresponsive => {
                debug!(serial = %serial, "device returned to the available pool");
                self.inner
                    .available
                    .add(handle)
                    .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
            }
            FreeDeviceState::Unavailable | FreeDeviceState::Ignore => {
                debug!(serial = %serial, "device dropped from the pool");
            }
        }
        Ok(())
    }

    /// Boot the emulator backing a leased emulator slot. The slot must be
    /// `NotAvailable`. `runner` launches the emulator binary; the spawned
    /// process is owned by the device until the lease is freed.
    pub async fn launch_emulator(
        &self,
        device: &Arc<ManagedDevice>,
        boot_timeout: Duration,
        runner: &Arc<dyn CommandExecutor>,
        emulator_args: Vec<String>,
    ) -> Result<(), DeviceError> {
        self.ensure_initialized()?;
        let handle = device.handle()?;
        if !handle.is_emulator() {
            return Err(DeviceError::WrongDeviceState {
                serial: handle.serial,
                state: handle.state,
                expected: "an emulator slot",
            });
        }
        if device.device_state() != DeviceState::NotAvailable {
            return Err(DeviceError::WrongDeviceState {
                serial: handle.serial,
                state: device.device_state(),
                expected: "NotAvailable",
            });
        }
        let serial = handle.serial.clone();
        let port = handle
            .emulator_port()
            .ok_or_else(|| DeviceError::InvalidEmulatorPort(serial.clone()))?;

        let mut args = emulator_args;
        args.push("-port".to_string());
        args.push(port.to_string());
        info!(serial = %serial, cmd = %args.join(" "), "launching emulator");

        let mut child = runner.run_in_background(&args).await.map_err(|e| {
            DeviceError::DeviceNotAvailable(serial.clone(), format!("failed to launch emulator: {e:#}"))
        })?;

        sleep(EMULATOR_LAUNCH_CHECK_DELAY).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                return Err(DeviceError::DeviceNotAvailable(
                    serial,
                    format!("emulator exited immediately with {exit}"),
                ));
            }
            Err(e) => {
                return Err(DeviceError::DeviceNotAvailable(
                    serial,
                    format!("cannot observe the emulator process: {e}"),
                ));
            }
        }
        device.set_emulator_process(child).await;
        device.start_logcat().await;

        if !device.wait_for_device_available(boot_timeout).await {
            if let Err(e) = self.inner.kill_emulator(device).await {
                warn!(serial = %serial, error = %e, "failed to reclaim an unbootable emulator");
            }
            return Err(DeviceError::DeviceNotAvailable(
                serial,
                format!("emulator did not boot within {boot_timeout:?}"),
            ));
        }
        Ok(())
    }

    /// Attach a device over TCP. Leases a placeholder for `ip_and_port`,
    /// runs `adb connect` up to three times, and waits for the device to
    /// come online. Any failure frees the placeholder and yields `None`;
    /// an already-leased serial also yields `None`.
    pub async fn connect_to_tcp_device(
        &self,
        ip_and_port: &str,
    ) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        self.ensure_initialized()?;
        if self
            .inner
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?
            .contains_key(ip_and_port)
        {
            warn!(serial = %ip_and_port, "tcp device is already leased");
            return Ok(None);
        }
        let Some(device) = self.inner.lease(DeviceHandle::tcp_stub(ip_and_port)).await? else {
            return Ok(None);
        };

        let argv = vec![
            self.inner.config.adb_path.clone(),
            "connect".to_string(),
            ip_and_port.to_string(),
        ];
        let expected = format!("connected to {ip_and_port}");
        let mut connected = false;
        for attempt in 1..=ADB_CONNECT_ATTEMPTS {
            let result = self.inner.executor.run_timed_cmd(ADB_CONNECT_TIMEOUT, &argv).await;
            if result.stdout.starts_with(&expected) {
                connected = true;
                break;
            }
            debug!(serial = %ip_and_port, attempt, "adb connect failed");
            if attempt < ADB_CONNECT_ATTEMPTS {
                sleep(self.inner.config.adb_connect_retry_delay()).await;
            }
        }

        if connected && device.wait_for_device_online(TCP_ONLINE_TIMEOUT).await {
            info!(serial = %ip_and_port, "tcp device connected");
            return Ok(Some(device));
        }
        warn!(serial = %ip_and_port, "could not attach tcp device");
        self.free_device(&device, FreeDeviceState::Ignore).await?;
        Ok(None)
    }

    /// Move a USB-attached lease onto TCP. On a failed transport switch
    /// the USB device is sent through recovery instead.
    pub async fn reconnect_device_to_tcp(
        &self,
        usb_device: &Arc<ManagedDevice>,
    ) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        self.ensure_initialized()?;
        match usb_device.switch_to_adb_tcp().await {
            Some(ip_and_port) => self.connect_to_tcp_device(&ip_and_port).await,
            None => {
                warn!(serial = %usb_device.serial(), "transport switch to tcp failed; recovering the usb device");
                usb_device.recover_device().await?;
                Ok(None)
            }
        }
    }

    /// Switch a TCP lease back to USB and drop the lease. Returns whether
    /// the transport switch succeeded.
    pub async fn disconnect_from_tcp_device(
        &self,
        device: &Arc<ManagedDevice>,
    ) -> Result<bool, DeviceError> {
        self.ensure_initialized()?;
        let switched = device.switch_to_adb_usb().await;
        self.free_device(device, FreeDeviceState::Ignore).await?;
        Ok(switched)
    }

    /// Subscribe to fastboot polling cycles. Fails when the `fastboot`
    /// binary was not usable at init.
    pub fn add_fastboot_listener(
        &self,
        listener: Arc<dyn FastbootListener>,
    ) -> Result<(), DeviceError> {
        if !self.inner.fastboot_enabled.load(Ordering::SeqCst) {
            return Err(DeviceError::FastbootNotSupported);
        }
        self.inner
            .fastboot_listeners
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("fastboot listeners"))?
            .push(listener);
        Ok(())
    }

    pub fn remove_fastboot_listener(
        &self,
        listener: &Arc<dyn FastbootListener>,
    ) -> Result<(), DeviceError> {
        self.inner
            .fastboot_listeners
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("fastboot listeners"))?
            .retain(|existing| !Arc::ptr_eq(existing, listener));
        Ok(())
    }

    pub fn is_fastboot_enabled(&self) -> bool {
        self.inner.fastboot_enabled.load(Ordering::SeqCst)
    }

    /// Serials currently under lease.
    pub fn allocated_devices(&self) -> Result<Vec<String>, DeviceError> {
        let mut serials: Vec<String> = self
            .inner
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?
            .keys()
            .cloned()
            .collect();
        serials.sort_unstable();
        Ok(serials)
    }

    /// Real devices waiting in the pool; slot stubs are not reported.
    pub fn available_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        Ok(self
            .inner
            .available
            .snapshot()
            .map_err(|_| DeviceError::LockPoisoned("available queue"))?
            .into_iter()
            .filter(|handle| !handle.is_stub())
            .collect())
    }

    /// Serials the bridge can see that are neither pooled nor leased.
    pub fn unavailable_devices(&self) -> Result<Vec<String>, DeviceError> {
        let available: HashSet<String> = self
            .inner
            .available
            .snapshot()
            .map_err(|_| DeviceError::LockPoisoned("available queue"))?
            .into_iter()
            .map(|handle| handle.serial)
            .collect();
        let allocated: HashSet<String> = self
            .inner
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?
            .keys()
            .cloned()
            .collect();
        Ok(self
            .inner
            .bridge
            .devices()
            .into_iter()
            .map(|handle| handle.serial)
            .filter(|serial| !available.contains(serial) && !allocated.contains(serial))
            .collect())
    }

    /// Shut the pool down: deregister from the bridge, stop it, and stop
    /// the fastboot monitor. Idempotent.
    pub async fn terminate(&self) -> Result<(), DeviceError> {
        let previous = self
            .inner
            .lifecycle
            .swap(LIFECYCLE_TERMINATED, Ordering::SeqCst);
        if previous == LIFECYCLE_TERMINATED {
            return Ok(());
        }
        let listener = self
            .inner
            .bridge_listener
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("bridge listener"))?
            .take();
        if let Some(listener) = listener {
            let listener: Arc<dyn DeviceChangeListener> = listener;
            self.inner.bridge.remove_device_change_listener(&listener);
        }
        self.inner.bridge.terminate().await;
        self.inner.shutdown.send_replace(true);
        if let Some(task) = self.inner.fastboot_task.lock().await.take() {
            let _ = task.await;
        }
        info!("device manager terminated");
        Ok(())
    }

    /// Emergency shutdown: poison recovery on every lease so in-flight
    /// work fails fast, drop the bridge connection, then terminate.
    pub async fn terminate_hard(&self) -> Result<(), DeviceError> {
        {
            let allocated = self
                .inner
                .allocated
                .lock()
                .map_err(|_| DeviceError::LockPoisoned("allocated map"))?;
            for device in allocated.values() {
                device.set_recovery_mode(RecoveryMode::Abort)?;
            }
        }
        self.inner.bridge.disconnect().await;
        self.terminate().await
    }

    fn ensure_initialized(&self) -> Result<(), DeviceError> {
        if self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_INITIALIZED {
            Ok(())
        } else {
            Err(DeviceError::NotInitialized)
        }
    }
}

impl Inner {
    async fn probe_fastboot(&self) -> bool {
        let argv = vec![self.config.fastboot_path.clone(), "help".to_string()];
        let result = self
            .executor
            .run_timed_cmd_silently(FASTBOOT_PROBE_TIMEOUT, &argv)
            .await;
        result.success() || result.stderr.contains("usage: fastboot")
    }

    /// Pool every device already sitting in fastboot mode at init.
    async fn pool_current_fastboot_devices(&self) -> Result<(), DeviceError> {
        let argv = vec![self.config.fastboot_path.clone(), "devices".to_string()];
        let result = self
            .executor
            .run_timed_cmd(FASTBOOT_ENUMERATE_TIMEOUT, &argv)
            .await;
        for serial in parse_fastboot_serials(&result.stdout) {
            info!(serial = %serial, "found a device in fastboot mode");
            self.available
                .add(DeviceHandle::fastboot_stub(serial))
                .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
        }
        Ok(())
    }

    /// Construct a lease for `handle`. `Ok(None)` when the serial is
    /// already leased.
    async fn lease(&self, handle: DeviceHandle) -> Result<Option<Arc<ManagedDevice>>, DeviceError> {
        let monitor = Arc::new(DeviceStateMonitor::new(
            handle.serial.clone(),
            self.config.adb_path.clone(),
            self.executor.clone(),
            handle.state,
        ));
        let device = Arc::new(ManagedDevice::new(
            handle.clone(),
            monitor,
            self.executor.clone(),
            self.config.adb_path.clone(),
        ));
        {
            let mut allocated = self
                .allocated
                .lock()
                .map_err(|_| DeviceError::LockPoisoned("allocated map"))?;
            if allocated.contains_key(&handle.serial) {
                warn!(serial = %handle.serial, "serial is already leased");
                return Ok(None);
            }
            allocated.insert(handle.serial.clone(), device.clone());
        }
        if self.config.logcat_on_allocate && !handle.is_stub() {
            device.start_logcat().await;
        }
        info!(serial = %handle.serial, "device allocated");
        Ok(Some(device))
    }

    async fn kill_emulator(&self, device: &Arc<ManagedDevice>) -> Result<(), DeviceError> {
        let serial = device.serial().to_string();
        let port = device
            .handle()?
            .emulator_port()
            .ok_or_else(|| DeviceError::InvalidEmulatorPort(serial.clone()))?;

        let console_killed = emulator_console_kill(port).await;
        let Some(mut child) = device.take_emulator_process().await else {
            // Not launched by us; the console request is all we can do.
            return Ok(());
        };
        if console_killed {
            match tokio::time::timeout(EMULATOR_KILL_CONFIRM_TIMEOUT, child.wait()).await {
                Ok(_) => {
                    debug!(serial = %serial, "emulator shut down via its console");
                    return Ok(());
                }
                Err(_) => {
                    warn!(serial = %serial, "emulator ignored the console kill; destroying the process");
                }
            }
        }
        let _ = child.start_kill();
        match tokio::time::timeout(EMULATOR_KILL_CONFIRM_TIMEOUT, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DeviceError::DeviceNotAvailable(
                serial,
                "emulator process survived the kill window".to_string(),
            )),
        }
    }

    fn list_known_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        let mut devices = self
            .available
            .snapshot()
            .map_err(|_| DeviceError::LockPoisoned("available queue"))?;
        let allocated = self
            .allocated
            .lock()
            .map_err(|_| DeviceError::LockPoisoned("allocated map"))?;
        for device in allocated.values() {
            devices.push(device.handle()?);
        }
        Ok(devices)
    }

    /// Bridge callbacks never raise upward; poisoning is logged and the
    /// event dropped.
    fn handle_disconnected(&self, device: &DeviceHandle) {
        match self.available.remove_if(|handle| handle.serial == device.serial) {
            Ok(Some(_)) => {
                debug!(serial = %device.serial, "removed disconnected device from the pool");
            }
            Ok(None) => {}
            Err(e) => error!(serial = %device.serial, error = %e, "could not scrub the available pool"),
        }
        let leased = match self.allocated.lock() {
            Ok(allocated) => allocated.get(&device.serial).cloned(),
            Err(_) => {
                error!(serial = %device.serial, "allocated map lock poisoned; dropping disconnect event");
                None
            }
        };
        if let Some(managed) = leased {
            info!(serial = %device.serial, "leased device disconnected");
            if let Err(e) = managed.set_device_state(DeviceState::NotAvailable) {
                warn!(serial = %device.serial, error = %e, "failed to mark device not available");
            }
        }
        let checking = match self.checking.lock() {
            Ok(checking) => checking.get(&device.serial).cloned(),
            Err(_) => {
                error!(serial = %device.serial, "checking set lock poisoned; dropping disconnect event");
                None
            }
        };
        if let Some(monitor) = checking {
            monitor.set_state(DeviceState::NotAvailable);
        }
    }
}

/// Shared body of `device_connected` and a state-bit `device_changed`.
/// Runs on the bridge dispatch path, so failures are logged, never raised.
async fn handle_device_event(inner: &Arc<Inner>, device: &DeviceHandle) {
    let leased = match inner.allocated.lock() {
        Ok(allocated) => allocated.get(&device.serial).cloned(),
        Err(_) => {
            error!(serial = %device.serial, "allocated map lock poisoned; dropping bridge event");
            return;
        }
    };
    if let Some(managed) = leased {
        debug!(serial = %device.serial, state = ?device.state, "refreshing leased device from bridge");
        if let Err(e) = managed.set_handle(device.clone()) {
            warn!(serial = %device.serial, error = %e, "failed to refresh leased device");
        }
        return;
    }
    if DeviceHandle::serial_is_valid(&device.serial) && device.state == DeviceState::Online {
        check_and_add_available_device(inner, device.clone()).await;
        return;
    }
    let checking = match inner.checking.lock() {
        Ok(checking) => checking.get(&device.serial).cloned(),
        Err(_) => {
            error!(serial = %device.serial, "checking set lock poisoned; dropping bridge event");
            return;
        }
    };
    if let Some(monitor) = checking {
        monitor.set_state(device.state);
    }
}

/// Admission: register a responsiveness probe for a newly observed device
/// and pool it once the probe passes. While the probe runs the serial sits
/// in the checking set, which also dedups re-admission.
async fn check_and_add_available_device(inner: &Arc<Inner>, device: DeviceHandle) {
    {
        let Ok(checking) = inner.checking.lock() else {
            error!(serial = %device.serial, "checking set lock poisoned; dropping device");
            return;
        };
        if checking.contains_key(&device.serial) {
            debug!(serial = %device.serial, "responsiveness check already in flight");
            return;
        }
    }
    {
        let Ok(filter) = inner.global_filter.lock() else {
            error!(serial = %device.serial, "global filter lock poisoned; dropping device");
            return;
        };
        if let Some(filter) = &*filter {
            if !filter.matches(&device) {
                debug!(serial = %device.serial, "device rejected by the global filter");
                return;
            }
        }
    }

    let monitor = Arc::new(DeviceStateMonitor::new(
        device.serial.clone(),
        inner.config.adb_path.clone(),
        inner.executor.clone(),
        device.state,
    ));
    {
        let Ok(mut checking) = inner.checking.lock() else {
            error!(serial = %device.serial, "checking set lock poisoned; dropping device");
            return;
        };
        match checking.entry(device.serial.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(monitor.clone());
            }
        }
    }

    let task_inner = inner.clone();
    let check = async move { run_responsiveness_check(task_inner, device, monitor).await };
    if inner.config.sync_mode {
        check.await;
    } else {
        tokio::spawn(check);
    }
}

async fn run_responsiveness_check(
    inner: Arc<Inner>,
    device: DeviceHandle,
    monitor: Arc<DeviceStateMonitor>,
) {
    let serial = device.serial.clone();
    let timeout = inner.config.available_check_timeout();

    let responsive = match inner.check_permits.acquire().await {
        Ok(_permit) => {
            let mut shutdown = inner.shutdown.subscribe();
            tokio::select! {
                responsive = monitor.wait_for_device_shell(timeout) => responsive,
                _ = monitor.wait_for_device_not_available(timeout) => false,
                _ = shutdown.wait_for(|stop| *stop) => false,
            }
        }
        // The semaphore only closes at teardown.
        Err(_) => false,
    };

    if responsive {
        let wanted = serial.clone();
        match inner
            .available
            .add_unique(move |handle| handle.serial == wanted, device)
        {
            Ok(displaced) => {
                if displaced.is_some() {
                    debug!(serial = %serial, "replaced a stale pool entry");
                }
                info!(serial = %serial, "device is available for allocation");
            }
            Err(e) => error!(serial = %serial, error = %e, "could not pool checked device"),
        }
    } else {
        warn!(serial = %serial, "device failed the responsiveness check; not pooling it");
    }
    match inner.checking.lock() {
        Ok(mut checking) => {
            checking.remove(&serial);
        }
        Err(_) => error!(serial = %serial, "checking set lock poisoned; entry not cleared"),
    }
}

/// Ask the emulator console on localhost to shut the instance down.
async fn emulator_console_kill(port: u16) -> bool {
    let connect = TcpStream::connect(("127.0.0.1", port));
    let Ok(Ok(mut stream)) = tokio::time::timeout(EMULATOR_CONSOLE_TIMEOUT, connect).await else {
        return false;
    };
    // Drain the greeting banner, best effort.
    let mut banner = [0u8; 512];
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut banner)).await;
    stream.write_all(b"kill\n").await.is_ok()
}

/// The pool's ear on the bridge. Holds the pool weakly so a forgotten
/// deregistration cannot keep it alive.
pub(crate) struct BridgeEventHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl DeviceChangeListener for BridgeEventHandler {
    async fn device_connected(&self, device: &DeviceHandle) {
        if let Some(inner) = self.inner.upgrade() {
            handle_device_event(&inner, device).await;
        }
    }

    async fn device_changed(&self, device: &DeviceHandle, change_mask: u32) {
        if change_mask & CHANGE_STATE == 0 {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            handle_device_event(&inner, device).await;
        }
    }

    async fn device_disconnected(&self, device: &DeviceHandle) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_disconnected(device);
        }
    }
}
