use crate::error::{SandboxError, SandboxResult};
use crate::runtime::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::process::Command;

/// Lifecycle states of an isolated execution unit.
///
/// `Created -> Running -> {Completed | TimedOut | Crashed} -> Removed`,
/// with `Removed` reached unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    /// Unit exists but has not started
    Created,
    /// Unit is executing the test
    Running,
    /// Unit exited on its own
    Completed,
    /// Unit was terminated at the deadline
    TimedOut,
    /// Unit could not be driven to completion
    Crashed,
    /// Unit has been removed from the host (terminal)
    Removed,
}

/// Handle for one isolated execution unit
#[derive(Debug)]
pub struct SandboxUnit {
    name: String,
    runtime: ContainerRuntime,
    state: UnitState,
}

impl SandboxUnit {
    pub(crate) fn new(name: String, runtime: ContainerRuntime) -> Self {
        Self {
            name,
            runtime,
            state: UnitState::Created,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub(crate) fn mark(&mut self, state: UnitState) {
        self.state = state;
    }

    /// Force-remove the unit from the host.
    ///
    /// Safe to call in any state; the unit is gone afterwards even if the
    /// runtime reports an error for an already-removed unit.
    pub async fn remove(&mut self) -> SandboxResult<()> {
        if self.state == UnitState::Removed {
            return Ok(());
        }

        let output = tokio::process::Command::new(self.runtime.command())
            .args(["rm", "-f", &self.name])
            .output()
            .await
            .map_err(|e| SandboxError::CleanupFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        self.state = UnitState::Removed;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "no such container" just means someone beat us to it
            if !stderr.contains("no such container") && !stderr.contains("No such container") {
                return Err(SandboxError::CleanupFailed {
                    name: self.name.clone(),
                    reason: stderr.trim().to_string(),
                });
            }
        }

        tracing::debug!(unit = %self.name, "sandbox unit removed");
        Ok(())
    }
}

impl Drop for SandboxUnit {
    fn drop(&mut self) {
        // Last line of defense: a unit that escaped the normal teardown
        // path is still removed, synchronously.
        if self.state != UnitState::Removed && self.runtime.is_available() {
            let _ = Command::new(self.runtime.command())
                .args(["rm", "-f", &self.name])
                .output();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_starts_created() {
        let unit = SandboxUnit::new("testforge-abc".to_string(), ContainerRuntime::None);
        assert_eq!(unit.state(), UnitState::Created);
        assert_eq!(unit.name(), "testforge-abc");
    }

    #[test]
    fn test_unit_state_transitions() {
        let mut unit = SandboxUnit::new("testforge-abc".to_string(), ContainerRuntime::None);
        unit.mark(UnitState::Running);
        assert_eq!(unit.state(), UnitState::Running);
        unit.mark(UnitState::TimedOut);
        assert_eq!(unit.state(), UnitState::TimedOut);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_once_removed() {
        let mut unit = SandboxUnit::new("testforge-abc".to_string(), ContainerRuntime::None);
        unit.mark(UnitState::Removed);
        // No runtime is consulted for an already-removed unit.
        assert!(unit.remove().await.is_ok());
    }
}
