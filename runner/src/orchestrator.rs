//! Drives one test specification through validation, backend selection,
//! the retry loop, classification, and cleanup.
//!
//! Ordinary test failures never raise; they come back inside
//! [`TestResult`]. Errors are reserved for configuration and
//! infrastructure problems.

use crate::analyzer::{ErrorAnalysis, ErrorKind, TestErrorAnalyzer};
use crate::backend::{
    ExecutionBackend, ExecutionMode, RawExecutionResult, RunnerError, RunnerResult,
};
use crate::local::LocalProcessBackend;
use crate::parse;
use crate::sandboxed::ContainerSandboxBackend;
use crate::spec::{Ecosystem, ExecutionConfig, TestSpecification};
use sandbox::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Root of all per-attempt workspaces inside the target project
const WORKSPACE_ROOT: &str = ".testforge";

/// Coverage sidecars swept from the project after every run
const COVERAGE_SIDECAR_FILES: &[&str] = &[".coverage", "coverage.xml"];

// Millisecond timestamps can collide under concurrent runs; a
// process-wide sequence keeps workspace names unique.
static WORKSPACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Attempt-level aggregate returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// True exactly when the final attempt's exit code was zero
    pub success: bool,
    /// Raw captured output, always preserved
    pub output: String,
    /// Failure text of the final attempt, when it failed
    pub error: Option<String>,
    pub duration: Duration,
    /// Which backend produced the final attempt
    pub mode: ExecutionMode,
    /// Diagnosis of the final failed attempt, absent on success and on
    /// pre-execution rejection by the classifier's pattern table
    pub analysis: Option<ErrorAnalysis>,
    /// Coverage total percentage, when collection was requested
    pub coverage: Option<f32>,
    /// Best-effort resource snapshot from the final attempt
    pub resource_usage: Option<ResourceUsage>,
    /// Transient artifact of the final attempt, for post-mortem inspection
    pub artifact_path: Option<PathBuf>,
    /// Identity for correlating results across concurrent runs
    pub test_name: String,
    /// How many attempts actually ran
    pub attempts: u32,
}

/// Per-attempt workspace, removed when the guard drops
struct WorkspaceGuard {
    path: PathBuf,
}

impl WorkspaceGuard {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Orchestrates test execution against one target project
pub struct TestRunner {
    project_path: PathBuf,
    analyzer: TestErrorAnalyzer,
    backend_override: Option<Arc<dyn ExecutionBackend>>,
}

impl TestRunner {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            analyzer: TestErrorAnalyzer::new(),
            backend_override: None,
        }
    }

    /// Pin the backend instead of selecting one per run. Used by embedders
    /// and tests that need to control execution.
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Run one specification to a final [`TestResult`].
    ///
    /// Validation failures and ordinary test failures return `Ok`; only
    /// configuration and infrastructure problems are errors.
    pub async fn run(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
    ) -> RunnerResult<TestResult> {
        config
            .validate()
            .map_err(|message| RunnerError::InvalidConfig { message })?;

        if !self.project_path.is_dir() {
            return Err(RunnerError::BackendUnavailable {
                reason: format!(
                    "project path '{}' does not exist",
                    self.project_path.display()
                ),
            });
        }

        // Reject before any backend exists; consumes no retry budget.
        if let Err(message) = parse::validate_syntax(&spec.source, spec.ecosystem) {
            tracing::info!(test = %spec.name, "rejected invalid test source before execution");
            return Ok(TestResult {
                success: false,
                output: String::new(),
                error: Some(message.clone()),
                duration: Duration::ZERO,
                mode: ExecutionMode::Local,
                analysis: Some(ErrorAnalysis::syntax_invalid(message)),
                coverage: None,
                resource_usage: None,
                artifact_path: None,
                test_name: spec.name.clone(),
                attempts: 0,
            });
        }

        let backend = self.select_backend(spec, config).await;
        let outcome = self.run_attempts(backend.as_ref(), spec, config).await;

        // Runs start clean: per-attempt workspaces are dropped by their
        // guards, coverage sidecars are swept here, on every path.
        self.sweep_coverage_artifacts();

        outcome
    }

    async fn select_backend(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
    ) -> Arc<dyn ExecutionBackend> {
        if let Some(backend) = &self.backend_override {
            return Arc::clone(backend);
        }

        if config.use_sandbox {
            match ContainerSandboxBackend::connect(&self.project_path, spec.ecosystem, config)
                .await
            {
                Ok(backend) => {
                    let (ok, diagnostics) = backend.validate().await;
                    if ok {
                        return Arc::new(backend);
                    }
                    tracing::warn!(
                        %diagnostics,
                        "sandbox unavailable, falling back to local execution"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "sandbox unavailable, falling back to local execution"
                    );
                }
            }
        }

        Arc::new(LocalProcessBackend::new(self.project_path.clone()))
    }

    async fn run_attempts(
        &self,
        backend: &dyn ExecutionBackend,
        spec: &TestSpecification,
        config: &ExecutionConfig,
    ) -> RunnerResult<TestResult> {
        let mut last: Option<(RawExecutionResult, ErrorAnalysis, PathBuf)> = None;

        for attempt in 1..=config.retries {
            let workspace = self.create_workspace(spec)?;
            let raw = backend.execute(spec, config, workspace.path()).await?;
            let artifact = backend.artifact_path(spec, workspace.path());

            if raw.success {
                tracing::info!(test = %spec.name, attempt, "test passed");
                return Ok(self.finish(spec, config, backend.mode(), raw, None, artifact, attempt));
            }

            let analysis = if raw.timed_out {
                ErrorAnalysis::timeout(config.timeout)
            } else {
                let mut analysis = self.analyzer.classify(spec, &raw.combined_output());
                enrich_dependency_hint(&mut analysis, spec.ecosystem);
                analysis
            };

            tracing::info!(
                test = %spec.name,
                attempt,
                of = config.retries,
                kind = %analysis.kind,
                "attempt failed"
            );

            last = Some((raw, analysis, artifact));
            if attempt < config.retries {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        // The budget is exhausted; surface the final attempt.
        let Some((raw, analysis, artifact)) = last else {
            return Err(RunnerError::InvalidConfig {
                message: "Retry budget must be at least 1".to_string(),
            });
        };
        Ok(self.finish(
            spec,
            config,
            backend.mode(),
            raw,
            Some(analysis),
            artifact,
            config.retries,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        spec: &TestSpecification,
        config: &ExecutionConfig,
        mode: ExecutionMode,
        raw: RawExecutionResult,
        analysis: Option<ErrorAnalysis>,
        artifact: PathBuf,
        attempts: u32,
    ) -> TestResult {
        let output = raw.combined_output();
        let coverage = (config.with_coverage && spec.ecosystem != Ecosystem::Node)
            .then(|| parse_coverage_total(&output))
            .flatten();
        let error = if raw.success {
            None
        } else if raw.stderr.is_empty() {
            Some(output.clone())
        } else {
            Some(raw.stderr.clone())
        };

        TestResult {
            success: raw.success,
            output,
            error,
            duration: raw.duration,
            mode,
            analysis,
            coverage,
            resource_usage: raw.resource_usage,
            artifact_path: Some(artifact),
            test_name: spec.name.clone(),
            attempts,
        }
    }

    fn create_workspace(&self, spec: &TestSpecification) -> RunnerResult<WorkspaceGuard> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let seq = WORKSPACE_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self
            .project_path
            .join(WORKSPACE_ROOT)
            .join(format!("{}_{}_{}", spec.sanitized_name(), stamp, seq));
        std::fs::create_dir_all(&path)?;
        Ok(WorkspaceGuard { path })
    }

    fn sweep_coverage_artifacts(&self) {
        for file in COVERAGE_SIDECAR_FILES {
            let _ = std::fs::remove_file(self.project_path.join(file));
        }
        let _ = std::fs::remove_dir_all(self.project_path.join("htmlcov"));
        // Only succeeds once the last workspace guard has dropped.
        let _ = std::fs::remove_dir(self.project_path.join(WORKSPACE_ROOT));
    }
}

/// Add the ecosystem's install command to a missing-dependency diagnosis.
///
/// Skipped when the classifier already steered towards configuration
/// rather than installation.
fn enrich_dependency_hint(analysis: &mut ErrorAnalysis, ecosystem: Ecosystem) {
    if analysis.kind != ErrorKind::DependencyMissing {
        return;
    }
    let Some(module) = analysis.message.strip_prefix("Missing module: ") else {
        return;
    };

    let hint = format!("Try `{}`.", ecosystem.install_command(module));
    match &mut analysis.suggested_fix {
        Some(fix) if fix.contains("configuration") => {}
        Some(fix) => {
            fix.push(' ');
            fix.push_str(&hint);
        }
        None => analysis.suggested_fix = Some(hint),
    }
}

/// Extract the TOTAL percentage from pytest-cov terminal output
fn parse_coverage_total(output: &str) -> Option<f32> {
    let pattern = regex::Regex::new(r"(?m)^TOTAL\s+\d+\s+\d+\s+(\d+)%").ok()?;
    pattern
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
