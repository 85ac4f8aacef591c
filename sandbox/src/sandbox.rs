use crate::archive::{build_context_tar, compress_archive, ExecutionPlan};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::runtime::{self, ContainerRuntime};
use crate::unit::{SandboxUnit, UnitState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

/// Resource consumption snapshot harvested from a unit, best-effort
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Memory in use, bytes
    pub memory_bytes: u64,
    /// Configured memory ceiling, bytes
    pub memory_limit_bytes: u64,
    /// CPU utilisation percentage at sample time
    pub cpu_percent: f64,
}

/// Outcome of one sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    /// Whether the unit exited with code zero
    pub success: bool,
    /// Combined stdout and stderr harvested from the unit
    pub output: String,
    /// Exit code, absent when the unit was terminated at the deadline
    pub exit_code: Option<i64>,
    /// Wall-clock time from archive build to harvest
    pub duration: Duration,
    /// Whether the deadline expired before the unit finished
    pub timed_out: bool,
    /// Resource snapshot, when the runtime produced one
    pub resource_usage: Option<ResourceUsage>,
}

/// Executes tests in isolated, resource-capped container units.
///
/// One `ContainerSandbox` may serve many concurrent runs; each call to
/// [`ContainerSandbox::execute`] owns exactly one unit and removes it on
/// every exit path.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    runtime: ContainerRuntime,
    config: SandboxConfig,
}

impl ContainerSandbox {
    /// Connect to the preferred available container runtime.
    ///
    /// This is an explicit capability acquisition: nothing is probed or
    /// mutated until the caller asks for it.
    pub async fn connect(config: SandboxConfig) -> SandboxResult<Self> {
        config
            .validate()
            .map_err(|message| SandboxError::InvalidConfig { message })?;

        let runtime = runtime::detect_runtime().await;
        if !runtime.is_available() {
            return Err(SandboxError::NoRuntimeAvailable);
        }

        tracing::debug!(%runtime, image = %config.image, "sandbox runtime connected");
        Ok(Self { runtime, config })
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Capability check: runtime reachable, image present or fetchable,
    /// host memory headroom. Returns pass/fail plus a diagnostic string.
    pub async fn validate(&self) -> (bool, String) {
        if let Err(e) = runtime::ping(self.runtime).await {
            return (false, e.to_string());
        }

        let mut issues = Vec::new();

        match runtime::image_exists(self.runtime, &self.config.image).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = runtime::pull_image(self.runtime, &self.config.image).await {
                    issues.push(format!("Cannot fetch sandbox image: {}", e));
                }
            }
            Err(e) => issues.push(e.to_string()),
        }

        if let Some(available) = runtime::host_memory_available() {
            if available < 1024 * 1024 * 1024 {
                issues.push("Low system memory for sandbox units".to_string());
            }
        }

        (issues.is_empty(), issues.join("\n"))
    }

    /// Run one execution plan in a fresh isolated unit.
    ///
    /// The unit is created, the context archive injected, the unit started
    /// and awaited up to the configured timeout, logs and stats harvested,
    /// and the unit removed — on every exit path.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        project: &Path,
        artifact_dir: &Path,
    ) -> SandboxResult<SandboxExecution> {
        let start = Instant::now();

        let tar_bytes = build_context_tar(project, plan)?;
        let gz_bytes = compress_archive(&tar_bytes)?;
        tokio::fs::write(artifact_dir.join("context.tar.gz"), &gz_bytes).await?;

        let name = format!("testforge-{}", Uuid::new_v4().simple());
        let mut unit = SandboxUnit::new(name, self.runtime);

        let result = self.drive(&mut unit, plan, &tar_bytes, start).await;

        if result.is_err()
            && !matches!(unit.state(), UnitState::Removed | UnitState::TimedOut)
        {
            unit.mark(UnitState::Crashed);
        }

        // Guaranteed teardown before returning to the orchestrator; the
        // unit's Drop impl backstops panics between here and the caller.
        if let Err(e) = unit.remove().await {
            tracing::warn!(unit = unit.name(), error = %e, "sandbox unit cleanup failed");
        }

        result
    }

    async fn drive(
        &self,
        unit: &mut SandboxUnit,
        plan: &ExecutionPlan,
        tar_bytes: &[u8],
        start: Instant,
    ) -> SandboxResult<SandboxExecution> {
        self.create_unit(unit.name(), plan).await?;
        self.inject(unit.name(), tar_bytes).await?;
        self.start_unit(unit.name()).await?;
        unit.mark(UnitState::Running);

        let name = unit.name().to_string();
        let (waited, resource_usage) = tokio::join!(
            tokio::time::timeout(self.config.timeout, self.wait_unit(&name)),
            self.sample_stats(&name),
        );

        match waited {
            Ok(Ok(exit_code)) => {
                unit.mark(UnitState::Completed);
                let output = self.harvest_logs(&name).await;
                Ok(SandboxExecution {
                    success: exit_code == 0,
                    output,
                    exit_code: Some(exit_code),
                    duration: start.elapsed(),
                    timed_out: false,
                    resource_usage,
                })
            }
            Ok(Err(e)) => {
                unit.mark(UnitState::Crashed);
                Err(e)
            }
            Err(_elapsed) => {
                // Deadline expired: terminate rather than block. Logs are
                // still harvested best-effort before removal.
                unit.mark(UnitState::TimedOut);
                tracing::warn!(
                    unit = %name,
                    timeout_secs = self.config.timeout.as_secs(),
                    "sandbox unit timed out, terminating"
                );
                let output = self.harvest_logs(&name).await;
                Ok(SandboxExecution {
                    success: false,
                    output,
                    exit_code: None,
                    duration: start.elapsed(),
                    timed_out: true,
                    resource_usage,
                })
            }
        }
    }

    async fn create_unit(&self, name: &str, plan: &ExecutionPlan) -> SandboxResult<()> {
        let mut cmd = Command::new(self.runtime.command());
        cmd.args(["create", "--name", name])
            .arg(format!("--memory={}", self.config.memory_limit))
            .arg(format!("--cpus={}", self.config.cpu_limit));

        if self.config.network_disabled {
            cmd.arg("--network=none");
        }

        if self.config.read_only_root {
            cmd.arg("--read-only")
                .arg("--tmpfs=/tmp:rw,size=128m");
        }

        cmd.args(["-w", "/app"]);

        for (key, value) in &plan.env {
            cmd.args(["-e", &format!("{}={}", key, value)]);
        }

        cmd.arg(&self.config.image);
        cmd.args(&plan.command);

        let output = cmd
            .output()
            .await
            .map_err(|e| SandboxError::UnitCreateFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxError::UnitCreateFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    /// Stream the context tar into the unit's filesystem before start
    async fn inject(&self, name: &str, tar_bytes: &[u8]) -> SandboxResult<()> {
        let mut child = Command::new(self.runtime.command())
            .args(["cp", "-", &format!("{}:/", name)])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::InjectFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(tar_bytes)
                .await
                .map_err(|e| SandboxError::InjectFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
            stdin.shutdown().await.ok();
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::InjectFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxError::InjectFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    async fn start_unit(&self, name: &str) -> SandboxResult<()> {
        let output = Command::new(self.runtime.command())
            .args(["start", name])
            .output()
            .await
            .map_err(|e| SandboxError::UnitStartFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxError::UnitStartFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    /// Block until the unit exits and return its exit code
    async fn wait_unit(&self, name: &str) -> SandboxResult<i64> {
        let output = Command::new(self.runtime.command())
            .args(["wait", name])
            .output()
            .await
            .map_err(|e| SandboxError::WaitFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxError::WaitFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<i64>()
            .map_err(|e| SandboxError::WaitFailed {
                name: name.to_string(),
                reason: format!("unparseable exit code: {}", e),
            })
    }

    /// Combined stdout and stderr of the unit, empty on harvest failure
    async fn harvest_logs(&self, name: &str) -> String {
        match Command::new(self.runtime.command())
            .args(["logs", name])
            .output()
            .await
        {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                combined
            }
            Err(e) => {
                tracing::warn!(unit = name, error = %e, "failed to harvest sandbox logs");
                String::new()
            }
        }
    }

    /// One-shot resource sample. Absence of stats never fails the attempt.
    async fn sample_stats(&self, name: &str) -> Option<ResourceUsage> {
        let format = match self.runtime {
            ContainerRuntime::Podman => "json",
            _ => "{{json .}}",
        };

        let output = Command::new(self.runtime.command())
            .args(["stats", "--no-stream", "--format", format, name])
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        parse_stats(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse one runtime stats record (docker `{{json .}}` object or podman
/// `json` array) into a usage snapshot.
pub(crate) fn parse_stats(raw: &str) -> Option<ResourceUsage> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    let record = match &value {
        serde_json::Value::Array(items) => items.first()?,
        other => other,
    };

    let mem_usage = ["MemUsage", "mem_usage"]
        .iter()
        .find_map(|key| record.get(*key))
        .and_then(|v| v.as_str())?;
    let (used, limit) = mem_usage.split_once('/')?;

    let cpu = ["CPUPerc", "CPU", "cpu_percent"]
        .iter()
        .find_map(|key| record.get(*key))
        .and_then(|v| v.as_str())
        .and_then(parse_percent)
        .unwrap_or(0.0);

    Some(ResourceUsage {
        memory_bytes: parse_size(used)?,
        memory_limit_bytes: parse_size(limit)?,
        cpu_percent: cpu,
    })
}

/// Parse runtime size notation ("899.1kB", "1.5MiB") into bytes
pub(crate) fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let value: f64 = raw[..split].parse().ok()?;
    let multiplier: f64 = match raw[split..].trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1kB"), Some(1000));
        assert_eq!(parse_size("1.5MiB"), Some(1_572_864));
        assert_eq!(parse_size("2GiB"), Some(2_147_483_648));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn test_parse_stats_docker_object() {
        let raw = r#"{"CPUPerc":"1.50%","MemUsage":"10MiB / 512MiB"}"#;
        let usage = parse_stats(raw).unwrap();
        assert_eq!(usage.memory_bytes, 10 * 1024 * 1024);
        assert_eq!(usage.memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(usage.cpu_percent, 1.5);
    }

    #[test]
    fn test_parse_stats_podman_array() {
        let raw = r#"[{"CPU":"0.20%","MemUsage":"899.1kB / 512MB"}]"#;
        let usage = parse_stats(raw).unwrap();
        assert_eq!(usage.memory_bytes, 899_100);
        assert_eq!(usage.memory_limit_bytes, 512_000_000);
        assert_eq!(usage.cpu_percent, 0.2);
    }

    #[test]
    fn test_parse_stats_tolerates_garbage() {
        assert!(parse_stats("not json").is_none());
        assert!(parse_stats(r#"{"MemUsage":"weird"}"#).is_none());
        assert!(parse_stats("{}").is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = SandboxConfig::default().with_cpu_limit(0.0);
        let result = ContainerSandbox::connect(config).await;
        assert!(matches!(result, Err(SandboxError::InvalidConfig { .. })));
    }
}
