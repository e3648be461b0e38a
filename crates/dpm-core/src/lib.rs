//! Shared data model for the device pool: device handles and states,
//! selection criteria, and the typed error surface.
//! Independent crate with no async runtime or I/O dependencies.

pub mod error;
pub mod selection;
pub mod types;

pub use error::DeviceError;
pub use selection::DeviceSelection;
pub use types::{DeviceHandle, DeviceKind, DeviceState, FreeDeviceState, RecoveryMode};
