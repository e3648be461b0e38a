use crate::types::{DeviceHandle, DeviceKind};

/// Criteria for picking a device out of the available pool.
///
/// Every criterion is optional; a device matches when all *specified*
/// criteria hold. The default selection therefore matches any handle,
/// including slot-reservation stubs.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    /// Only these serials are eligible (empty = unrestricted).
    pub serials: Vec<String>,
    /// These serials are never eligible.
    pub exclude_serials: Vec<String>,
    pub product_type: Option<String>,
    pub product_variant: Option<String>,
    /// Minimum battery percentage; a device with unknown battery fails the
    /// criterion.
    pub min_battery_level: Option<u8>,
    pub max_battery_level: Option<u8>,
    /// Only emulator handles are eligible.
    pub emulator_only: bool,
    /// Only physical hardware is eligible (no emulators, no stubs).
    pub device_only: bool,
    pub null_device_allowed: bool,
    pub stub_allowed: bool,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self {
            serials: Vec::new(),
            exclude_serials: Vec::new(),
            product_type: None,
            product_variant: None,
            min_battery_level: None,
            max_battery_level: None,
            emulator_only: false,
            device_only: false,
            null_device_allowed: true,
            stub_allowed: true,
        }
    }
}

impl DeviceSelection {
    /// Selection restricted to a single serial.
    pub fn for_serial(serial: impl Into<String>) -> Self {
        Self {
            serials: vec![serial.into()],
            ..Self::default()
        }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serials.push(serial.into());
        self
    }

    pub fn exclude_serial(mut self, serial: impl Into<String>) -> Self {
        self.exclude_serials.push(serial.into());
        self
    }

    pub fn emulator_only(mut self) -> Self {
        self.emulator_only = true;
        self
    }

    pub fn device_only(mut self) -> Self {
        self.device_only = true;
        self
    }

    /// True iff the device satisfies every specified criterion.
    pub fn matches(&self, device: &DeviceHandle) -> bool {
        if !self.serials.is_empty() && !self.serials.iter().any(|s| *s == device.serial) {
            return false;
        }
        if self.exclude_serials.iter().any(|s| *s == device.serial) {
            return false;
        }
        if let Some(product) = &self.product_type {
            if device.product_type.as_deref() != Some(product.as_str()) {
                return false;
            }
        }
        if let Some(variant) = &self.product_variant {
            if device.product_variant.as_deref() != Some(variant.as_str()) {
                return false;
            }
        }
        if self.min_battery_level.is_some() || self.max_battery_level.is_some() {
            let Some(level) = device.battery_level else {
                return false;
            };
            if self.min_battery_level.is_some_and(|min| level < min) {
                return false;
            }
            if self.max_battery_level.is_some_and(|max| level > max) {
                return false;
            }
        }
        if self.emulator_only && !device.is_emulator() {
            return false;
        }
        if self.device_only && (device.is_emulator() || device.is_stub()) {
            return false;
        }
        if !self.null_device_allowed && device.kind == DeviceKind::NullStub {
            return false;
        }
        if !self.stub_allowed && device.is_stub() {
            return false;
        }
        true
    }
}
