use crate::spec::{ExecutionConfig, TestSpecification};
use async_trait::async_trait;
use sandbox::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors the engine raises for configuration and infrastructure problems.
///
/// Ordinary test failures are never errors; they travel inside
/// [`RawExecutionResult`] and the orchestrator's `TestResult`.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// No backend can execute this run at all
    #[error("No usable execution backend: {reason}")]
    BackendUnavailable { reason: String },

    /// Run configuration is not usable
    #[error("Invalid run configuration: {message}")]
    InvalidConfig { message: String },

    /// The host test-runner tool could not be spawned
    #[error("Failed to spawn test runner '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// A concurrently scheduled run could not be joined
    #[error("Concurrent run failed: {reason}")]
    PoolFailed { reason: String },

    /// Sandbox infrastructure error
    #[error(transparent)]
    Sandbox(#[from] sandbox::SandboxError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Which execution strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Sandbox,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// Raw outcome of one attempt, identical in shape for every backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExecutionResult {
    /// True exactly when the exit code was zero
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Absent when the attempt was terminated at the deadline
    pub exit_code: Option<i64>,
    pub duration: Duration,
    /// Whether the deadline expired before the runner finished
    pub timed_out: bool,
    /// Best-effort resource snapshot, sandbox runs only
    pub resource_usage: Option<ResourceUsage>,
}

impl RawExecutionResult {
    /// Stdout followed by stderr, as one displayable stream
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// One strategy for executing a test attempt.
///
/// Exactly two variants exist: [`crate::local::LocalProcessBackend`] and
/// [`crate::sandboxed::ContainerSandboxBackend`]. The orchestrator selects
/// one per run and is indifferent to which one ran.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Execute one attempt inside the given per-attempt workspace
    async fn execute(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
        workspace: &Path,
    ) -> RunnerResult<RawExecutionResult>;

    /// Path of the transient artifact this backend leaves in the
    /// workspace, for post-mortem inspection before cleanup
    fn artifact_path(&self, spec: &TestSpecification, workspace: &Path) -> PathBuf;

    fn mode(&self) -> ExecutionMode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let result = RawExecutionResult {
            success: true,
            stdout: "1 passed".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(10),
            timed_out: false,
            resource_usage: None,
        };
        assert_eq!(result.combined_output(), "1 passed");

        let result = RawExecutionResult {
            stderr: "warning: slow".to_string(),
            ..result
        };
        assert_eq!(result.combined_output(), "1 passed\nwarning: slow");
    }

    #[test]
    fn test_execution_mode_display() {
        assert_eq!(ExecutionMode::Local.to_string(), "local");
        assert_eq!(ExecutionMode::Sandbox.to_string(), "sandbox");
    }
}
