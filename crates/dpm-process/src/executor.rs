//! Command-execution seam between the pool manager and the host system.
//!
//! The manager only ever talks to the `adb`/`fastboot`/emulator binaries
//! through this trait, so tests can script command outcomes without
//! touching a real bridge.

use crate::{CommandResult, ProcessRunner};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Child;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run_timed_cmd(&self, timeout: Duration, argv: &[String]) -> CommandResult;

    async fn run_timed_cmd_with_input(
        &self,
        timeout: Duration,
        input: &str,
        argv: &[String],
    ) -> CommandResult;

    async fn run_timed_cmd_silently(&self, timeout: Duration, argv: &[String]) -> CommandResult;

    /// Spawn without waiting; the caller owns the child.
    async fn run_in_background(&self, argv: &[String]) -> Result<Child>;
}

#[async_trait]
impl CommandExecutor for ProcessRunner {
    async fn run_timed_cmd(&self, timeout: Duration, argv: &[String]) -> CommandResult {
        ProcessRunner::run_timed_cmd(self, timeout, argv).await
    }

    async fn run_timed_cmd_with_input(
        &self,
        timeout: Duration,
        input: &str,
        argv: &[String],
    ) -> CommandResult {
        ProcessRunner::run_timed_cmd_with_input(self, timeout, input, argv).await
    }

    async fn run_timed_cmd_silently(&self, timeout: Duration, argv: &[String]) -> CommandResult {
        ProcessRunner::run_timed_cmd_silently(self, timeout, argv).await
    }

    async fn run_in_background(&self, argv: &[String]) -> Result<Child> {
        ProcessRunner::run_in_background(self, argv)
    }
}
