use serde::{Deserialize, Serialize};

/// Serial prefix the emulator uses for its console-port handles.
pub const EMULATOR_SERIAL_PREFIX: &str = "emulator-";

/// Serial prefix for null-device slot reservations.
pub const NULL_DEVICE_SERIAL_PREFIX: &str = "null-device-";

/// Mode of a device as reported through the debug bridge or the fastboot
/// poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Visible to adb and accepting commands.
    Online,
    /// Visible to adb but not yet responsive.
    Offline,
    /// Booted into the recovery image.
    Recovery,
    /// In fastboot mode; only visible to the fastboot poller.
    Fastboot,
    /// Gone from every view the manager has.
    NotAvailable,
}

/// Terminal state a caller reports when returning a leased device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeDeviceState {
    /// Device is healthy; return it to the available pool.
    Available,
    /// Device misbehaved but may recover; return it to the pool.
    Unresponsive,
    /// Device is gone; drop it from the pool.
    Unavailable,
    /// Caller does not care; drop it without judgement.
    Ignore,
}

/// How a managed device reacts when asked to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Wait until the device is online and shell-responsive again.
    #[default]
    Available,
    /// Recovery is a no-op.
    None,
    /// Every recovery attempt fails immediately. Installed on all leased
    /// devices by `terminate_hard`.
    Abort,
}

/// Discriminates real hardware from the synthesized placeholder handles
/// that reserve allocation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Real hardware attached through the bridge.
    Physical,
    /// Emulator slot; a placeholder until `launch_emulator` boots it.
    Emulator,
    /// Null-device slot reservation.
    NullStub,
    /// Pre-connect TCP device placeholder.
    TcpStub,
    /// Device observed in fastboot mode.
    FastbootStub,
    /// Generic placeholder (force-allocate pre-registration).
    Stub,
}

/// Identity of a device as the pool tracks it. The serial is the stable
/// key; everything else may be refreshed by bridge events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub serial: String,
    pub state: DeviceState,
    pub kind: DeviceKind,
    pub product_type: Option<String>,
    pub product_variant: Option<String>,
    /// Battery charge in percent, when the bridge reported one.
    pub battery_level: Option<u8>,
}

impl DeviceHandle {
    /// Handle for real hardware reported by the bridge.
    pub fn physical(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            kind: DeviceKind::Physical,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// Placeholder reserving an emulator slot on the given console port.
    pub fn emulator_stub(port: u16) -> Self {
        Self {
            serial: format!("{EMULATOR_SERIAL_PREFIX}{port}"),
            state: DeviceState::NotAvailable,
            kind: DeviceKind::Emulator,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// Placeholder reserving a null-device slot.
    pub fn null_stub(index: u16) -> Self {
        Self {
            serial: format!("{NULL_DEVICE_SERIAL_PREFIX}{index}"),
            state: DeviceState::NotAvailable,
            kind: DeviceKind::NullStub,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// Placeholder for a TCP device that has not connected yet.
    pub fn tcp_stub(ip_and_port: impl Into<String>) -> Self {
        Self {
            serial: ip_and_port.into(),
            state: DeviceState::NotAvailable,
            kind: DeviceKind::TcpStub,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// Handle for a device currently sitting in fastboot mode.
    pub fn fastboot_stub(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Fastboot,
            kind: DeviceKind::FastbootStub,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// Generic placeholder for a serial expected to appear later.
    pub fn stub(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::NotAvailable,
            kind: DeviceKind::Stub,
            product_type: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// True for every synthesized placeholder handle.
    pub fn is_stub(&self) -> bool {
        !matches!(self.kind, DeviceKind::Physical)
    }

    /// True for emulator slots and for live devices carrying an emulator
    /// serial.
    pub fn is_emulator(&self) -> bool {
        self.kind == DeviceKind::Emulator || self.serial.starts_with(EMULATOR_SERIAL_PREFIX)
    }

    /// Console port encoded in an `emulator-<port>` serial.
    pub fn emulator_port(&self) -> Option<u16> {
        self.serial
            .strip_prefix(EMULATOR_SERIAL_PREFIX)
            .and_then(|port| port.parse().ok())
    }

    /// Whether a serial reported by the bridge identifies a usable device.
    /// The bridge surfaces placeholder serials like `?` for devices it
    /// cannot read.
    pub fn serial_is_valid(serial: &str) -> bool {
        serial.len() > 1 && !serial.contains('?')
    }
}
