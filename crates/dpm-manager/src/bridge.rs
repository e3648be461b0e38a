//! Contract of the external debug bridge the pool consumes.
//!
//! The bridge owns device discovery; the pool only reacts to the events it
//! delivers. Listener callbacks are dispatched serially from the bridge's
//! own task and must not block it. The manager's listener delegates any
//! slow work to background workers.

use async_trait::async_trait;
use dpm_core::DeviceHandle;
use std::sync::Arc;
use std::time::Duration;

/// Bit set in the `device_changed` mask when the reported mode changed.
pub const CHANGE_STATE: u32 = 0x0001;

#[async_trait]
pub trait DeviceChangeListener: Send + Sync {
    async fn device_connected(&self, device: &DeviceHandle);

    async fn device_changed(&self, device: &DeviceHandle, change_mask: u32);

    async fn device_disconnected(&self, device: &DeviceHandle);
}

#[async_trait]
pub trait DebugBridge: Send + Sync {
    /// Start the bridge. Events begin flowing to registered listeners, so
    /// listeners must be in place before this is called.
    async fn init(&self, client_support: bool, adb_binary: &str) -> anyhow::Result<()>;

    /// Stop the bridge.
    async fn terminate(&self);

    /// Forcibly drop the bridge connection without an orderly shutdown.
    async fn disconnect(&self);

    /// Devices currently in the bridge's view.
    fn devices(&self) -> Vec<DeviceHandle>;

    /// Upper bound the bridge applies to its own operations.
    fn set_event_timeout(&self, timeout: Duration);

    fn add_device_change_listener(&self, listener: Arc<dyn DeviceChangeListener>);

    fn remove_device_change_listener(&self, listener: &Arc<dyn DeviceChangeListener>);
}
