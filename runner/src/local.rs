//! Local subprocess execution of generated tests.
//!
//! The host's own test-runner tool is spawned with the project root as the
//! working directory and an augmented copy of the host environment. The
//! timeout contract terminates the whole process group, not just the leaf
//! process, so test-spawned children never outlive the attempt.

use crate::backend::{
    ExecutionBackend, ExecutionMode, RawExecutionResult, RunnerError, RunnerResult,
};
use crate::spec::{detect_settings_module, Ecosystem, ExecutionConfig, TestSpecification};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Runs one attempt as a subprocess of the host test runner
#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    project_path: PathBuf,
}

impl LocalProcessBackend {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }
}

/// Argument vector for the ecosystem's test runner
fn build_command(
    spec: &TestSpecification,
    config: &ExecutionConfig,
    test_file: &Path,
    project_path: &Path,
) -> (String, Vec<String>) {
    match spec.ecosystem {
        Ecosystem::Django => {
            let settings = config
                .settings_module
                .clone()
                .or_else(|| detect_settings_module(project_path))
                .unwrap_or_else(|| "settings".to_string());
            let mut args = vec![
                "-m".to_string(),
                "pytest".to_string(),
                "--ds".to_string(),
                settings,
                test_file.display().to_string(),
                "-v".to_string(),
            ];
            if config.with_coverage {
                args.extend(["--cov=.".to_string(), "--cov-report=term".to_string()]);
            }
            ("python3".to_string(), args)
        }
        Ecosystem::Flask => {
            let mut args = vec![
                "-m".to_string(),
                "pytest".to_string(),
                test_file.display().to_string(),
                "-v".to_string(),
            ];
            if config.with_coverage {
                args.extend(["--cov=.".to_string(), "--cov-report=term".to_string()]);
            }
            ("python3".to_string(), args)
        }
        Ecosystem::Node => (
            "npx".to_string(),
            vec!["jest".to_string(), test_file.display().to_string()],
        ),
    }
}

/// Environment overrides layered on top of the inherited host environment
fn build_environment(
    project_path: &Path,
    ecosystem: Ecosystem,
    config: &ExecutionConfig,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if matches!(ecosystem, Ecosystem::Django | Ecosystem::Flask) {
        let project_root = project_path.display().to_string();
        let python_path = match std::env::var("PYTHONPATH") {
            Ok(existing) if !existing.is_empty() => {
                format!("{}:{}", project_root, existing)
            }
            _ => project_root,
        };
        env.push(("PYTHONPATH".to_string(), python_path));
    }

    if ecosystem == Ecosystem::Django {
        if let Some(settings) = config
            .settings_module
            .clone()
            .or_else(|| detect_settings_module(project_path))
        {
            env.push(("DJANGO_SETTINGS_MODULE".to_string(), settings));
        }
    }

    env
}

/// Supervises one spawned test-runner process.
///
/// The deadline mechanism is the only control surface: the supervisor can
/// wait and it can [`ProcessSupervisor::terminate`]. How termination
/// happens on a given platform stays in here.
struct ProcessSupervisor {
    child: Child,
}

impl ProcessSupervisor {
    fn spawn(mut cmd: Command) -> std::io::Result<Self> {
        // Place the child in its own process group so that terminate()
        // can reap test-spawned grandchildren as well.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        Ok(Self { child })
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
            return;
        }

        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    async fn execute(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
        workspace: &Path,
    ) -> RunnerResult<RawExecutionResult> {
        let test_file = self.artifact_path(spec, workspace);
        tokio::fs::write(&test_file, &spec.source).await?;

        let (program, args) = build_command(spec, config, &test_file, &self.project_path);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in build_environment(&self.project_path, spec.ecosystem, config) {
            cmd.env(key, value);
        }

        tracing::debug!(test = %spec.name, %program, "spawning local test runner");
        let start = Instant::now();
        let mut supervisor =
            ProcessSupervisor::spawn(cmd).map_err(|e| RunnerError::SpawnFailed {
                command: program.clone(),
                reason: if e.kind() == std::io::ErrorKind::NotFound {
                    format!("'{}' not found on PATH. Is it installed?", program)
                } else {
                    e.to_string()
                },
            })?;

        let mut stdout_pipe = supervisor.child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let mut stderr_pipe = supervisor.child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let waited = tokio::time::timeout(config.timeout, supervisor.child.wait()).await;

        let (status, timed_out) = match waited {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                tracing::warn!(
                    test = %spec.name,
                    timeout_secs = config.timeout.as_secs(),
                    "local test runner timed out, terminating process group"
                );
                supervisor.terminate();
                let _ = supervisor.child.wait().await;
                (None, true)
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        let exit_code = status.and_then(|s| s.code()).map(i64::from);
        Ok(RawExecutionResult {
            success: exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            duration: start.elapsed(),
            timed_out,
            resource_usage: None,
        })
    }

    fn artifact_path(&self, spec: &TestSpecification, workspace: &Path) -> PathBuf {
        workspace.join(format!(
            "test_{}{}",
            spec.sanitized_name(),
            spec.ecosystem.test_extension()
        ))
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }
}
