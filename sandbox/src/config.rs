use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one isolated execution unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base image the unit runs
    pub image: String,
    /// Memory ceiling in runtime notation, e.g. "512m"
    pub memory_limit: String,
    /// CPU share, e.g. 1.0 for one core
    pub cpu_limit: f64,
    /// Wall-clock ceiling for one execution
    pub timeout: Duration,
    /// Whether the unit may reach the network
    pub network_disabled: bool,
    /// Mount the root filesystem read-only, with a writable /tmp
    pub read_only_root: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout: Duration::from_secs(30),
            network_disabled: true,
            read_only_root: true,
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = limit.into();
        self
    }

    pub fn with_cpu_limit(mut self, cpus: f64) -> Self {
        self.cpu_limit = cpus;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_disabled = !enabled;
        self
    }

    pub fn with_read_only_root(mut self, read_only: bool) -> Self {
        self.read_only_root = read_only;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.image.is_empty() {
            return Err("Sandbox image cannot be empty".to_string());
        }

        if self.memory_limit.is_empty()
            || !self
                .memory_limit
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        {
            return Err(format!(
                "Memory limit '{}' is not in runtime notation (e.g. '512m')",
                self.memory_limit
            ));
        }

        if self.cpu_limit <= 0.0 {
            return Err("CPU limit must be greater than 0".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.memory_limit, "512m");
        assert!(config.network_disabled);
        assert!(config.read_only_root);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SandboxConfig::new()
            .with_image("node:20-slim")
            .with_memory_limit("256m")
            .with_cpu_limit(0.5)
            .with_timeout(Duration::from_secs(60))
            .with_network(true);

        assert_eq!(config.image, "node:20-slim");
        assert_eq!(config.memory_limit, "256m");
        assert_eq!(config.cpu_limit, 0.5);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(!config.network_disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SandboxConfig::default();

        config.image = String::new();
        assert!(config.validate().is_err());

        config.image = "python:3.11-slim".to_string();
        config.memory_limit = "lots".to_string();
        assert!(config.validate().is_err());

        config.memory_limit = "512m".to_string();
        config.cpu_limit = 0.0;
        assert!(config.validate().is_err());

        config.cpu_limit = 1.0;
        config.timeout = Duration::from_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = SandboxConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: SandboxConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.image, deserialized.image);
        assert_eq!(config.memory_limit, deserialized.memory_limit);
    }
}
