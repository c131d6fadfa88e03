//! External tool execution.
//!
//! Tool-backed stages (`rsync`, `cdo`, `ncks`, ...) run through the
//! [`CommandRunner`] trait so they can be timed out, cancelled and recorded
//! in tests.

use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion; a non-zero exit is a `StageFailure` of `stage`
    async fn run(&self, stage: &str, command: &ToolCommand) -> Result<ToolOutput>;
}

/// Runs tools as child processes with a per-invocation timeout
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, stage: &str, command: &ToolCommand) -> Result<ToolOutput> {
        debug!("[{}] {}", stage, command);
        let start = Instant::now();

        // Dropping the future (cancellation) kills the child
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessorError::stage(stage, format!("failed to start {}: {}", command.program, e))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ProcessorError::stage(stage, e.to_string()))?,
            Err(_) => {
                return Err(ProcessorError::stage(
                    stage,
                    format!("{} timed out after {:?}", command.program, self.timeout),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ProcessorError::stage(
                stage,
                format!("{} exited with {}: {}", command.program, output.status, stderr.trim()),
            ));
        }

        debug!(
            "[{}] {} finished in {}ms",
            stage,
            command.program,
            start.elapsed().as_millis()
        );
        Ok(ToolOutput { stdout, stderr })
    }
}

/// Runner that records commands instead of executing them
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolCommand>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` to commands whose rendering contains `needle`
    pub fn respond_to(&self, needle: &str, stdout: &str) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((needle.to_string(), stdout.to_string()));
        }
    }

    /// Fail commands whose rendering contains `needle`
    pub fn fail_when(&self, needle: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(needle.to_string());
        }
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, stage: &str, command: &ToolCommand) -> Result<ToolOutput> {
        let rendered = command.to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }

        let fails = self
            .failures
            .lock()
            .map(|f| f.iter().any(|needle| rendered.contains(needle.as_str())))
            .unwrap_or(false);
        if fails {
            return Err(ProcessorError::stage(
                stage,
                format!("{} exited with exit status: 1", command.program),
            ));
        }

        let stdout = self
            .responses
            .lock()
            .ok()
            .and_then(|responses| {
                responses
                    .iter()
                    .find(|(needle, _)| rendered.contains(needle.as_str()))
                    .map(|(_, stdout)| stdout.clone())
            })
            .unwrap_or_default();

        Ok(ToolOutput {
            stdout,
            stderr: String::new(),
        })
    }
}
