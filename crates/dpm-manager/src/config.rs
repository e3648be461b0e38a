//! Pool tunables, loadable from TOML.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Path of the adb binary handed to the bridge and used for probes.
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default = "default_fastboot_path")]
    pub fastboot_path: String,
    /// Emulator slot stubs added at init; console ports start at 5554 and
    /// step by 2.
    #[serde(default = "default_num_emulator_slots")]
    pub num_emulator_slots: u16,
    /// Null-device slot stubs added at init.
    #[serde(default = "default_num_null_devices")]
    pub num_null_devices: u16,
    /// Cap on concurrently running responsiveness checks.
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default = "default_fastboot_poll_interval_ms")]
    pub fastboot_poll_interval_ms: u64,
    /// How long a newly observed device gets to become shell-responsive
    /// before it is dropped instead of pooled.
    #[serde(default = "default_available_check_timeout_ms")]
    pub available_check_timeout_ms: u64,
    /// Sleep between failed `adb connect` attempts.
    #[serde(default = "default_adb_connect_retry_delay_ms")]
    pub adb_connect_retry_delay_ms: u64,
    /// Start logcat capture when a non-stub device is leased.
    #[serde(default)]
    pub logcat_on_allocate: bool,
    /// Run admission checks inline on the bridge event instead of
    /// dispatching a worker. For tests.
    #[serde(default)]
    pub sync_mode: bool,
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_fastboot_path() -> String {
    "fastboot".to_string()
}

fn default_num_emulator_slots() -> u16 {
    1
}

fn default_num_null_devices() -> u16 {
    1
}

fn default_max_concurrent_checks() -> usize {
    4
}

fn default_fastboot_poll_interval_ms() -> u64 {
    5_000
}

fn default_available_check_timeout_ms() -> u64 {
    30_000
}

fn default_adb_connect_retry_delay_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            fastboot_path: default_fastboot_path(),
            num_emulator_slots: default_num_emulator_slots(),
            num_null_devices: default_num_null_devices(),
            max_concurrent_checks: default_max_concurrent_checks(),
            fastboot_poll_interval_ms: default_fastboot_poll_interval_ms(),
            available_check_timeout_ms: default_available_check_timeout_ms(),
            adb_connect_retry_delay_ms: default_adb_connect_retry_delay_ms(),
            logcat_on_allocate: false,
            sync_mode: false,
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse pool config")
    }

    pub fn fastboot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fastboot_poll_interval_ms)
    }

    pub fn available_check_timeout(&self) -> Duration {
        Duration::from_millis(self.available_check_timeout_ms)
    }

    pub fn adb_connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.adb_connect_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.adb_path, "adb");
        assert_eq!(config.fastboot_path, "fastboot");
        assert_eq!(config.num_emulator_slots, 1);
        assert_eq!(config.num_null_devices, 1);
        assert_eq!(config.fastboot_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.available_check_timeout(), Duration::from_secs(30));
        assert!(!config.logcat_on_allocate);
        assert!(!config.sync_mode);
    }

    #[test]
    fn test_empty_toml_matches_defaults() {
        let config = PoolConfig::from_toml_str("").expect("parse");
        assert_eq!(config.adb_path, PoolConfig::default().adb_path);
        assert_eq!(config.num_emulator_slots, PoolConfig::default().num_emulator_slots);
        assert_eq!(
            config.available_check_timeout_ms,
            PoolConfig::default().available_check_timeout_ms
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PoolConfig::from_toml_str(
            r#"
            adb_path = "/opt/sdk/adb"
            num_emulator_slots = 4
            "#,
        )
        .expect("parse");

        assert_eq!(config.adb_path, "/opt/sdk/adb");
        assert_eq!(config.num_emulator_slots, 4);
        assert_eq!(config.fastboot_path, "fastboot");
        assert_eq!(config.available_check_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(PoolConfig::from_toml_str("num_emulator_slots = \"many\"").is_err());
    }
}
