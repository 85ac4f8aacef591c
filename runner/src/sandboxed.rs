//! Container-sandboxed execution of generated tests.
//!
//! Policy lives here: which image, which entrypoint bootstrap, which
//! manifest and pinned environment each ecosystem gets. The mechanics of
//! driving the isolated unit live in the `sandbox` crate.

use crate::backend::{ExecutionBackend, ExecutionMode, RawExecutionResult, RunnerResult};
use crate::spec::{detect_settings_module, Ecosystem, ExecutionConfig, TestSpecification};
use async_trait::async_trait;
use sandbox::{ContainerSandbox, ExecutionPlan, SandboxConfig};
use std::path::{Path, PathBuf};

const PYTHON_IMAGE: &str = "python:3.11-slim";
const NODE_IMAGE: &str = "node:20-slim";

fn default_image(ecosystem: Ecosystem) -> &'static str {
    match ecosystem {
        Ecosystem::Django | Ecosystem::Flask => PYTHON_IMAGE,
        Ecosystem::Node => NODE_IMAGE,
    }
}

/// Runs one attempt inside an isolated, resource-capped container unit
pub struct ContainerSandboxBackend {
    project_path: PathBuf,
    sandbox: ContainerSandbox,
}

impl ContainerSandboxBackend {
    /// Connect to the container runtime with settings derived from the run
    /// configuration. Fails fast when no runtime is installed.
    pub async fn connect(
        project_path: impl Into<PathBuf>,
        ecosystem: Ecosystem,
        config: &ExecutionConfig,
    ) -> RunnerResult<Self> {
        let image = config
            .sandbox_image
            .clone()
            .unwrap_or_else(|| default_image(ecosystem).to_string());

        let sandbox_config = SandboxConfig::new()
            .with_image(image)
            .with_memory_limit(config.memory_limit.clone())
            .with_cpu_limit(config.cpu_limit)
            .with_timeout(config.timeout)
            .with_network(config.network_enabled)
            .with_read_only_root(config.read_only_root);

        let sandbox = ContainerSandbox::connect(sandbox_config).await?;
        Ok(Self {
            project_path: project_path.into(),
            sandbox,
        })
    }

    /// Capability check used by the orchestrator to decide fallback
    pub async fn validate(&self) -> (bool, String) {
        self.sandbox.validate().await
    }
}

/// Assemble the per-ecosystem archive content, command, and pinned
/// environment for one sandboxed attempt
fn build_plan(
    project_path: &Path,
    spec: &TestSpecification,
    config: &ExecutionConfig,
) -> ExecutionPlan {
    let name = spec.sanitized_name();
    match spec.ecosystem {
        Ecosystem::Django => {
            let settings = config
                .settings_module
                .clone()
                .or_else(|| detect_settings_module(project_path))
                .unwrap_or_else(|| "settings".to_string());
            let test_path = format!("tests/test_{}.py", name);
            ExecutionPlan {
                entrypoint: format!(
                    "#!/usr/bin/env python3\n\
                     import os\n\
                     import sys\n\
                     \n\
                     sys.path.insert(0, \"/app\")\n\
                     os.environ.setdefault(\"DJANGO_SETTINGS_MODULE\", \"{settings}\")\n\
                     \n\
                     import django\n\
                     \n\
                     django.setup()\n\
                     \n\
                     import pytest\n\
                     \n\
                     raise SystemExit(pytest.main([\"/app/{test_path}\", \"-v\"]))\n",
                ),
                test_path,
                test_source: spec.source.clone(),
                entrypoint_path: "run_tests.py".to_string(),
                manifest_path: "requirements-test.txt".to_string(),
                manifest: "django>=3.2,<5.0\n\
                           pytest>=7.0.0\n\
                           pytest-django>=4.5.0\n\
                           factory-boy>=3.2.0\n"
                    .to_string(),
                command: vec!["python".to_string(), "/app/run_tests.py".to_string()],
                env: python_env(),
            }
        }
        Ecosystem::Flask => {
            let test_path = format!("tests/test_{}.py", name);
            ExecutionPlan {
                entrypoint: format!(
                    "#!/usr/bin/env python3\n\
                     import sys\n\
                     \n\
                     sys.path.insert(0, \"/app\")\n\
                     \n\
                     import pytest\n\
                     \n\
                     raise SystemExit(pytest.main([\"/app/{test_path}\", \"-v\"]))\n",
                ),
                test_path,
                test_source: spec.source.clone(),
                entrypoint_path: "run_tests.py".to_string(),
                manifest_path: "requirements-test.txt".to_string(),
                manifest: "flask>=2.0\npytest>=7.0.0\n".to_string(),
                command: vec!["python".to_string(), "/app/run_tests.py".to_string()],
                env: python_env(),
            }
        }
        Ecosystem::Node => {
            let test_path = format!("tests/test_{}.test.js", name);
            ExecutionPlan {
                entrypoint: format!("#!/bin/sh\ncd /app\nexec npx jest {test_path}\n"),
                test_path,
                test_source: spec.source.clone(),
                entrypoint_path: "run_tests.sh".to_string(),
                manifest_path: "package-test.json".to_string(),
                manifest: "{\n  \"devDependencies\": {\n    \"jest\": \"^29.0.0\"\n  }\n}\n"
                    .to_string(),
                command: vec!["sh".to_string(), "/app/run_tests.sh".to_string()],
                env: vec![
                    ("NODE_ENV".to_string(), "test".to_string()),
                    ("CI".to_string(), "true".to_string()),
                ],
            }
        }
    }
}

/// Environment pinned for deterministic Python output buffering
fn python_env() -> Vec<(String, String)> {
    vec![
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("PYTHONPATH".to_string(), "/app".to_string()),
    ]
}

#[async_trait]
impl ExecutionBackend for ContainerSandboxBackend {
    async fn execute(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
        workspace: &Path,
    ) -> RunnerResult<RawExecutionResult> {
        let plan = build_plan(&self.project_path, spec, config);
        let execution = self
            .sandbox
            .execute(&plan, &self.project_path, workspace)
            .await?;

        Ok(RawExecutionResult {
            success: execution.success,
            stdout: execution.output,
            stderr: String::new(),
            exit_code: execution.exit_code,
            duration: execution.duration,
            timed_out: execution.timed_out,
            resource_usage: execution.resource_usage,
        })
    }

    fn artifact_path(&self, _spec: &TestSpecification, workspace: &Path) -> PathBuf {
        workspace.join("context.tar.gz")
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sandbox
    }
}
