//! Timed subprocess execution: spawning with a configured environment,
//! deadline enforcement with child cleanup, and output capture.

pub mod executor;
pub mod op;

pub use executor::CommandExecutor;
pub use op::{
    TimedOperation, run_escalating_timed_retry, run_fixed_timed_retry, run_timed,
    run_timed_retry, sleep,
};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

/// Outcome of a timed command or operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    /// Ran to completion with a zero exit code (or a `true` operation).
    Success,
    /// Ran to completion unsuccessfully.
    Failed,
    /// The deadline expired first; the child was destroyed.
    TimedOut,
    /// The command could not run at all, or the operation raised.
    Exception,
}

/// Result of a timed subprocess run. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
    /// Exit code when the child ran to completion and was not
    /// signal-killed.
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn new(status: CommandStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Spawn-time settings shared by every command a [`ProcessRunner`] runs.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Working directory for spawned children; inherited when unset.
    pub working_dir: Option<PathBuf>,
    /// Environment entries merged on top of the inherited environment.
    pub env: HashMap<String, String>,
}

/// Launches child processes with a consistent configuration snapshot.
///
/// Configuration mutations are serialized against spawns: a spawn clones
/// the config under the same lock the setters take, so a child never sees
/// a half-applied environment.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    config: Mutex<RunnerConfig>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn set_working_dir(&self, dir: Option<PathBuf>) -> Result<()> {
        self.config
            .lock()
            .map_err(|_| anyhow!("runner config lock poisoned"))?
            .working_dir = dir;
        Ok(())
    }

    pub fn set_env_var(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.config
            .lock()
            .map_err(|_| anyhow!("runner config lock poisoned"))?
            .env
            .insert(key.into(), value.into());
        Ok(())
    }

    pub fn unset_env_var(&self, key: &str) -> Result<()> {
        self.config
            .lock()
            .map_err(|_| anyhow!("runner config lock poisoned"))?
            .env
            .remove(key);
        Ok(())
    }

    /// Run `argv` to completion or until `timeout` expires, capturing
    /// stdout and stderr. On expiry the child is destroyed and the result
    /// reports [`CommandStatus::TimedOut`] with whatever output was
    /// captured; the timeout decision wins even if the child exits while
    /// it is being made.
    pub async fn run_timed_cmd(&self, timeout: Duration, argv: &[String]) -> CommandResult {
        self.run_cmd_internal(timeout, argv, None, true).await
    }

    /// As [`run_timed_cmd`](Self::run_timed_cmd), additionally writing
    /// `input` to the child's stdin and closing it before waiting.
    pub async fn run_timed_cmd_with_input(
        &self,
        timeout: Duration,
        input: &str,
        argv: &[String],
    ) -> CommandResult {
        self.run_cmd_internal(timeout, argv, Some(input), true).await
    }

    /// As [`run_timed_cmd`](Self::run_timed_cmd) but without error logging
    /// when the command cannot be spawned. For probes that are expected to
    /// fail on some hosts.
    pub async fn run_timed_cmd_silently(&self, timeout: Duration, argv: &[String]) -> CommandResult {
        self.run_cmd_internal(timeout, argv, None, false).await
    }

    /// Spawn `argv` without waiting. The caller owns the child and its
    /// termination.
    pub fn run_in_background(&self, argv: &[String]) -> Result<Child> {
        let mut cmd =
            self.build_command(argv.first().map(String::as_str).unwrap_or_default(), argv)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        debug!(cmd = %argv.join(" "), "spawning background command");
        cmd.spawn()
            .with_context(|| format!("failed to spawn background command '{}'", argv.join(" ")))
    }

    async fn run_cmd_internal(
        &self,
        timeout: Duration,
        argv: &[String],
        input: Option<&str>,
        log_errors: bool,
    ) -> CommandResult {
        let Some(program) = argv.first() else {
            if log_errors {
                error!("refusing to run an empty command line");
            }
            return CommandResult::new(CommandStatus::Exception);
        };
        debug!(
            cmd = %argv.join(" "),
            timeout_ms = timeout.as_millis() as u64,
            "running command"
        );

        let mut cmd = match self.build_command(program, argv) {
            Ok(cmd) => cmd,
            Err(e) => {
                if log_errors {
                    error!(cmd = %program, error = %format!("{e:#}"), "failed to prepare command");
                }
                let mut result = CommandResult::new(CommandStatus::Exception);
                result.stderr = e.to_string();
                return result;
            }
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if log_errors {
                    error!(cmd = %program, error = %e, "failed to spawn command");
                }
                let mut result = CommandResult::new(CommandStatus::Exception);
                result.stderr = e.to_string();
                return result;
            }
        };

        // Drain both pipes concurrently so a chatty child cannot block on a
        // full pipe while we wait for it.
        let stdout_task = tokio::spawn(drain_lossy(child.stdout.take()));
        let stderr_task = tokio::spawn(drain_lossy(child.stderr.take()));

        let mut stdin = child.stdin.take();
        let input = input.map(str::as_bytes).map(Vec::from);

        let waited = {
            let wait = async {
                if let (Some(mut stdin), Some(data)) = (stdin.take(), input) {
                    if let Err(e) = stdin.write_all(&data).await {
                        warn!(error = %e, "failed to write command input");
                    }
                    let _ = stdin.shutdown().await;
                    // stdin drops here, closing the pipe before the wait
                }
                child.wait().await
            };
            tokio::pin!(wait);
            tokio::select! {
                biased;
                _ = tokio::time::sleep(timeout) => None,
                res = &mut wait => Some(res),
            }
        };

        let (status, exit_code) = match waited {
            Some(Ok(exit)) if exit.success() => (CommandStatus::Success, exit.code()),
            Some(Ok(exit)) => (CommandStatus::Failed, exit.code()),
            Some(Err(e)) => {
                if log_errors {
                    error!(cmd = %program, error = %e, "failed waiting for command");
                }
                (CommandStatus::Exception, None)
            }
            None => {
                warn!(
                    cmd = %argv.join(" "),
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out; destroying child"
                );
                kill_child_process_group(&mut child);
                let _ = child.wait().await;
                (CommandStatus::TimedOut, None)
            }
        };

        CommandResult {
            status,
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
            exit_code,
        }
    }

    /// Build a command from a consistent snapshot of the runner config.
    fn build_command(&self, program: &str, argv: &[String]) -> Result<Command> {
        let config = self
            .config
            .lock()
            .map_err(|_| anyhow!("runner config lock poisoned"))?
            .clone();
        let mut cmd = Command::new(program);
        cmd.args(argv.iter().skip(1));
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        // Isolate the child in its own process group so a timeout kill
        // reaches any grandchildren it spawned.
        // SAFETY: setsid() is async-signal-safe and runs before exec.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        Ok(cmd)
    }
}

fn kill_child_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; the negative PID targets
            // the process group created by setsid in pre_exec.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }

    let _ = child.start_kill();
}

async fn drain_lossy<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
