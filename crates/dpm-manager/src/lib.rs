//! Device-pool management for adb/fastboot test fleets.
//!
//! The [`DeviceManager`] discovers devices through an external debug
//! bridge, qualifies each one with a responsiveness probe, and hands out
//! mutually exclusive leases. Background tasks track fastboot-mode devices
//! and keep per-device state monitors current as bridge events arrive.

pub mod bridge;
pub mod config;
pub mod fastboot;
pub mod managed;
pub mod manager;
pub mod monitor;

pub use bridge::{CHANGE_STATE, DebugBridge, DeviceChangeListener};
pub use config::PoolConfig;
pub use fastboot::FastbootListener;
pub use managed::ManagedDevice;
pub use manager::{DeviceManager, PoolMonitor};
pub use monitor::DeviceStateMonitor;
