use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ecosystems the engine can execute tests for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    /// Django project, tests run under pytest with a settings module
    Django,
    /// Flask (or plain pytest) project
    Flask,
    /// Node.js project, tests run under jest
    Node,
}

impl Ecosystem {
    /// Detect the ecosystem of a project tree, when it is recognizable
    pub fn detect(project_path: &Path) -> Option<Self> {
        if project_path.join("manage.py").exists() {
            return Some(Ecosystem::Django);
        }

        if project_path.join("package.json").exists() {
            return Some(Ecosystem::Node);
        }

        // Flask has no marker file; look for a flask import near the root.
        for entry in std::fs::read_dir(project_path).ok()?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if content.contains("from flask import") || content.contains("import flask") {
                    return Some(Ecosystem::Flask);
                }
            }
        }

        None
    }

    /// File extension generated test sources carry in this ecosystem
    pub fn test_extension(&self) -> &'static str {
        match self {
            Ecosystem::Django | Ecosystem::Flask => ".py",
            Ecosystem::Node => ".test.js",
        }
    }

    /// Command that installs a missing package in this ecosystem
    pub fn install_command(&self, package: &str) -> String {
        match self {
            Ecosystem::Django | Ecosystem::Flask => format!("pip install {}", package),
            Ecosystem::Node => format!("npm install {}", package),
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ecosystem::Django => write!(f, "django"),
            Ecosystem::Flask => write!(f, "flask"),
            Ecosystem::Node => write!(f, "node"),
        }
    }
}

impl std::str::FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "django" => Ok(Ecosystem::Django),
            "flask" => Ok(Ecosystem::Flask),
            "node" => Ok(Ecosystem::Node),
            other => Err(format!("Unknown ecosystem: {}", other)),
        }
    }
}

/// Read the Django settings module a project declares in its manage.py
pub fn detect_settings_module(project_path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(project_path.join("manage.py")).ok()?;
    let pattern = regex::Regex::new(
        r#"os\.environ\.setdefault\(\s*['"]DJANGO_SETTINGS_MODULE['"]\s*,\s*['"]([^'"]+)['"]"#,
    )
    .ok()?;
    pattern
        .captures(&content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// A generated test to execute: immutable once constructed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpecification {
    /// Human-readable name, used for workspaces and correlation
    pub name: String,
    /// The test source text
    pub source: String,
    /// Which ecosystem's runner and settings apply
    pub ecosystem: Ecosystem,
}

impl TestSpecification {
    pub fn new(name: impl Into<String>, source: impl Into<String>, ecosystem: Ecosystem) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ecosystem,
        }
    }

    /// Filesystem-safe form of the test name
    pub fn sanitized_name(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect::<String>()
            .trim_matches('_')
            .to_string()
    }
}

/// Per-run execution settings.
///
/// Constructed once per invocation; the orchestrator may downgrade
/// `use_sandbox` when the sandbox capability check fails, nothing else
/// changes after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Memory ceiling for the isolated unit, runtime notation
    pub memory_limit: String,
    /// CPU share for the isolated unit
    pub cpu_limit: f64,
    /// Wall-clock ceiling for one attempt
    pub timeout: Duration,
    /// Whether the isolated unit may reach the network
    pub network_enabled: bool,
    /// Read-only root filesystem in the isolated unit
    pub read_only_root: bool,
    /// Maximum number of attempts before giving up
    pub retries: u32,
    /// Fixed delay between attempts, no backoff growth
    pub retry_delay: Duration,
    /// Prefer the container sandbox over local execution
    pub use_sandbox: bool,
    /// Override for the sandbox base image
    pub sandbox_image: Option<String>,
    /// Settings module for ecosystems that need one (Django)
    pub settings_module: Option<String>,
    /// Collect a coverage total for the run (pytest only)
    pub with_coverage: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout: Duration::from_secs(300),
            network_enabled: false,
            read_only_root: true,
            retries: 3,
            retry_delay: Duration::from_secs(2),
            use_sandbox: true,
            sandbox_image: None,
            settings_module: None,
            with_coverage: false,
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
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
        self.network_enabled = enabled;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_sandbox(mut self, use_sandbox: bool) -> Self {
        self.use_sandbox = use_sandbox;
        self
    }

    pub fn with_sandbox_image(mut self, image: impl Into<String>) -> Self {
        self.sandbox_image = Some(image.into());
        self
    }

    pub fn with_settings_module(mut self, module: impl Into<String>) -> Self {
        self.settings_module = Some(module.into());
        self
    }

    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.with_coverage = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retries == 0 {
            return Err("Retry budget must be at least 1".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.cpu_limit <= 0.0 {
            return Err("CPU limit must be greater than 0".to_string());
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

        Ok(())
    }
}
