use crate::error::RunnerError;
use crate::util;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Outcome of one external command. A non-zero exit is a normal result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stderr then stdout, each keeping its last `max_bytes / 2` bytes, since
    /// compiler errors and test summaries come last.
    pub fn log_tail(&self, max_bytes: usize) -> String {
        let half = (max_bytes / 2).max(1);
        let mut out = String::new();
        if self.timed_out {
            out.push_str("[timed out]\n");
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            out.push_str(&util::tail_str_bytes(stderr, half));
        }
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&util::tail_str_bytes(stdout, half));
        }
        out
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<RunOutput, RunnerError>;
}

/// Runs commands through `sh -c`. Children are killed when their future is
/// dropped, so a cancelled session leaves nothing running.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        command: &str,
        workdir: &Path,
        limit: Duration,
    ) -> Result<RunOutput, RunnerError> {
        if !workdir.is_dir() {
            return Err(RunnerError::MissingWorkingDir(workdir.to_path_buf()));
        }
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| RunnerError::Spawn {
                command: command.to_string(),
                source,
            })?,
            Err(_) => {
                tracing::warn!(command, timeout_secs = limit.as_secs(), "command timed out");
                return Ok(RunOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("command timed out after {}s", limit.as_secs()),
                    timed_out: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let result = RunOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            command,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "command finished"
        );
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStep {
    Build,
    Test,
}

impl VerifyStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStep::Build => "build",
            VerifyStep::Test => "test",
        }
    }
}

/// The build runner and test runner: optional commands sharing one executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCommands {
    pub build: Option<String>,
    pub test: Option<String>,
}

impl VerifyCommands {
    pub fn is_empty(&self) -> bool {
        self.build.is_none() && self.test.is_none()
    }

    pub fn command(&self, step: VerifyStep) -> Option<&str> {
        match step {
            VerifyStep::Build => self.build.as_deref(),
            VerifyStep::Test => self.test.as_deref(),
        }
    }
}

pub struct VerifyRunner<'a> {
    runner: &'a dyn CommandRunner,
    commands: &'a VerifyCommands,
    timeout: Duration,
}

impl<'a> VerifyRunner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, commands: &'a VerifyCommands, timeout: Duration) -> Self {
        Self {
            runner,
            commands,
            timeout,
        }
    }

    /// `Ok(None)` when no command is configured for `step`.
    pub async fn run(&self, step: VerifyStep, workdir: &Path) -> Result<Option<RunOutput>, RunnerError> {
        let Some(command) = self.commands.command(step) else {
            return Ok(None);
        };
        let output = self.runner.run(command, workdir, self.timeout).await?;
        Ok(Some(output))
    }
}
