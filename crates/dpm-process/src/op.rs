//! Generic timed operations and the retry policies built on them.

use crate::CommandStatus;
use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Unit of work driven by [`run_timed`].
///
/// `run` reports `Ok(true)` for success and `Ok(false)` for failure;
/// errors map to [`CommandStatus::Exception`]. When the deadline expires
/// before `run` resolves, the in-flight future is dropped and `cancel` is
/// invoked; `cancel` must synchronously release whatever external resource
/// `run` was blocked on (a child process, a socket) rather than rely on
/// the drop alone.
#[async_trait]
pub trait TimedOperation: Send {
    async fn run(&mut self) -> Result<bool>;

    async fn cancel(&mut self) {}
}

/// Drive `op.run()` to completion or until `timeout` expires.
///
/// The deadline arm wins a simultaneous wakeup: an operation that
/// completes at `timeout + ε` still reports [`CommandStatus::TimedOut`].
pub async fn run_timed(
    timeout: Duration,
    op: &mut dyn TimedOperation,
    log_errors: bool,
) -> CommandStatus {
    let outcome = {
        let run = op.run();
        tokio::pin!(run);
        tokio::select! {
            biased;
            _ = tokio::time::sleep(timeout) => None,
            res = &mut run => Some(res),
        }
    };

    match outcome {
        Some(Ok(true)) => CommandStatus::Success,
        Some(Ok(false)) => CommandStatus::Failed,
        Some(Err(e)) => {
            if log_errors {
                error!(error = %e, "timed operation raised");
            }
            CommandStatus::Exception
        }
        None => {
            op.cancel().await;
            CommandStatus::TimedOut
        }
    }
}

/// Run `op` up to `attempts` times, sleeping `poll_interval` between
/// failures. Success short-circuits.
pub async fn run_timed_retry(
    op_timeout: Duration,
    poll_interval: Duration,
    attempts: u32,
    op: &mut dyn TimedOperation,
) -> bool {
    for attempt in 1..=attempts {
        if run_timed(op_timeout, op, true).await == CommandStatus::Success {
            return true;
        }
        debug!(attempt, attempts, "timed operation failed");
        if attempt < attempts {
            sleep(poll_interval).await;
        }
    }
    false
}

/// Run `op` repeatedly until it succeeds or the wall clock passes
/// `max_time` from the first attempt.
pub async fn run_fixed_timed_retry(
    op_timeout: Duration,
    poll_interval: Duration,
    max_time: Duration,
    op: &mut dyn TimedOperation,
) -> bool {
    let start = Instant::now();
    loop {
        if run_timed(op_timeout, op, true).await == CommandStatus::Success {
            return true;
        }
        if start.elapsed() >= max_time {
            return false;
        }
        sleep(poll_interval).await;
    }
}

/// Run `op` repeatedly until it succeeds or the wall clock passes
/// `max_time`. The poll interval starts at `initial_poll` and is
/// multiplied by 4 after every failure, capped at `max_poll`.
pub async fn run_escalating_timed_retry(
    op_timeout: Duration,
    initial_poll: Duration,
    max_poll: Duration,
    max_time: Duration,
    op: &mut dyn TimedOperation,
) -> bool {
    let start = Instant::now();
    let mut poll_interval = initial_poll;
    loop {
        if run_timed(op_timeout, op, true).await == CommandStatus::Success {
            return true;
        }
        if start.elapsed() >= max_time {
            return false;
        }
        debug!(
            poll_ms = poll_interval.as_millis() as u64,
            "operation failed; backing off"
        );
        sleep(poll_interval).await;
        poll_interval = poll_interval.saturating_mul(4).min(max_poll);
    }
}

/// Sleep for `duration`; a zero duration returns immediately.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
#[path = "op_tests.rs"]
mod tests;
