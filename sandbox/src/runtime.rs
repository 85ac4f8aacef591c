use crate::error::{SandboxError, SandboxResult};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Podman container runtime
    Podman,
    /// Docker container runtime
    Docker,
    /// No container runtime available
    None,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::None => "",
        }
    }

    /// Check if this runtime is available
    pub fn is_available(&self) -> bool {
        matches!(self, ContainerRuntime::Podman | ContainerRuntime::Docker)
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerRuntime::Podman => write!(f, "podman"),
            ContainerRuntime::Docker => write!(f, "docker"),
            ContainerRuntime::None => write!(f, "none"),
        }
    }
}

async fn probe(command: &str) -> bool {
    Command::new(command)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

/// Detect available container runtime in order of preference
pub async fn detect_runtime() -> ContainerRuntime {
    // Podman first (better for rootless containers)
    if probe("podman").await {
        return ContainerRuntime::Podman;
    }

    if probe("docker").await {
        return ContainerRuntime::Docker;
    }

    ContainerRuntime::None
}

/// Check that the runtime daemon/service answers
pub async fn ping(runtime: ContainerRuntime) -> SandboxResult<()> {
    if !runtime.is_available() {
        return Err(SandboxError::NoRuntimeAvailable);
    }

    let output = Command::new(runtime.command())
        .arg("info")
        .stdout(Stdio::null())
        .output()
        .await
        .map_err(|e| SandboxError::ConnectivityFailed {
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(SandboxError::ConnectivityFailed {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Verify that a container image exists locally
pub async fn image_exists(runtime: ContainerRuntime, image: &str) -> SandboxResult<bool> {
    if !runtime.is_available() {
        return Err(SandboxError::NoRuntimeAvailable);
    }

    let output = Command::new(runtime.command())
        .args(["image", "inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|_e| SandboxError::CommandFailed {
            command: format!("{} image inspect {}", runtime.command(), image),
        })?;

    Ok(output.status.success())
}

/// Pull a container image from its registry
pub async fn pull_image(runtime: ContainerRuntime, image: &str) -> SandboxResult<()> {
    if !runtime.is_available() {
        return Err(SandboxError::NoRuntimeAvailable);
    }

    tracing::info!(image, "pulling sandbox image");
    let output = Command::new(runtime.command())
        .args(["pull", image])
        .output()
        .await
        .map_err(|e| SandboxError::ImageNotFound {
            image: image.to_string(),
            suggestion: format!("Failed to pull image: {}", e),
        })?;

    if !output.status.success() {
        return Err(SandboxError::ImageNotFound {
            image: image.to_string(),
            suggestion: format!(
                "Pull failed: {}. Check network connectivity and image name.",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(())
}

/// Available host memory in bytes, when the host exposes it
pub fn host_memory_available() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_command() {
        assert_eq!(ContainerRuntime::Podman.command(), "podman");
        assert_eq!(ContainerRuntime::Docker.command(), "docker");
        assert_eq!(ContainerRuntime::None.command(), "");
    }

    #[test]
    fn test_runtime_availability() {
        assert!(ContainerRuntime::Podman.is_available());
        assert!(ContainerRuntime::Docker.is_available());
        assert!(!ContainerRuntime::None.is_available());
    }

    #[tokio::test]
    async fn test_detect_runtime_returns_valid_variant() {
        // We can't predict what is installed in the test environment,
        // just ensure the probe completes.
        match detect_runtime().await {
            ContainerRuntime::Podman | ContainerRuntime::Docker | ContainerRuntime::None => {}
        }
    }

    #[tokio::test]
    async fn test_ping_no_runtime() {
        let result = ping(ContainerRuntime::None).await;
        assert!(matches!(result, Err(SandboxError::NoRuntimeAvailable)));
    }

    #[tokio::test]
    async fn test_image_exists_no_runtime() {
        let result = image_exists(ContainerRuntime::None, "python:3.11-slim").await;
        assert!(matches!(result, Err(SandboxError::NoRuntimeAvailable)));
    }

    #[test]
    fn test_host_memory_available_is_plausible() {
        if let Some(bytes) = host_memory_available() {
            assert!(bytes > 0);
        }
    }
}
