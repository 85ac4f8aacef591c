//! End-to-end orchestrator behavior against a controllable backend.
//!
//! The mock stands in for both real backends; it honors the same
//! `ExecutionBackend` contract, so everything here exercises the real
//! validation, retry, classification, and cleanup paths.

use async_trait::async_trait;
use runner::{
    Ecosystem, ErrorKind, ExecutionBackend, ExecutionConfig, ExecutionMode, RawExecutionResult,
    RunnerError, RunnerPool, RunnerResult, TestRunner, TestSpecification,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const VALID_TEST: &str = "def test_ok():\n    assert True\n";
const BROKEN_TEST: &str = "def test_broken(:\n    pass\n";

enum Behavior {
    Pass { output: String, delay: Duration },
    Fail { failure: String },
    PassOnAttempt(usize),
    SleepFor(Duration),
}

struct MockBackend {
    behavior: Behavior,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockBackend {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn pass(output: &str) -> RawExecutionResult {
        RawExecutionResult {
            success: true,
            stdout: output.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            timed_out: false,
            resource_usage: None,
        }
    }

    fn fail(failure: &str) -> RawExecutionResult {
        RawExecutionResult {
            success: false,
            stdout: String::new(),
            stderr: failure.to_string(),
            exit_code: Some(1),
            duration: Duration::from_millis(5),
            timed_out: false,
            resource_usage: None,
        }
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn execute(
        &self,
        _spec: &TestSpecification,
        config: &ExecutionConfig,
        _workspace: &Path,
    ) -> RunnerResult<RawExecutionResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Pass { output, delay } => {
                tokio::time::sleep(*delay).await;
                Self::pass(output)
            }
            Behavior::Fail { failure } => Self::fail(failure),
            Behavior::PassOnAttempt(n) => {
                if call >= *n {
                    Self::pass("passed eventually")
                } else {
                    Self::fail("flaky: connection reset")
                }
            }
            Behavior::SleepFor(wanted) => {
                let start = Instant::now();
                let allowed = (*wanted).min(config.timeout);
                tokio::time::sleep(allowed).await;
                if *wanted >= config.timeout {
                    RawExecutionResult {
                        success: false,
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: None,
                        duration: start.elapsed(),
                        timed_out: true,
                        resource_usage: None,
                    }
                } else {
                    Self::pass("slept and passed")
                }
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }

    fn artifact_path(&self, _spec: &TestSpecification, workspace: &Path) -> PathBuf {
        workspace.join("mock_artifact")
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }
}

fn fast_config() -> ExecutionConfig {
    ExecutionConfig::default()
        .with_retry_delay(Duration::from_millis(10))
        .with_sandbox(false)
}

fn spec(source: &str) -> TestSpecification {
    TestSpecification::new("generated test", source, Ecosystem::Flask)
}

#[tokio::test]
async fn test_syntax_invalid_runs_zero_attempts() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Pass {
        output: "unused".to_string(),
        delay: Duration::ZERO,
    });
    let runner = TestRunner::new(project.path()).with_backend(mock.clone());

    let result = runner.run(&spec(BROKEN_TEST), &fast_config()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 0);
    assert_eq!(mock.calls(), 0);
    assert_eq!(result.analysis.unwrap().kind, ErrorKind::SyntaxInvalid);
    assert!(result.error.unwrap().contains("Syntax error"));
}

#[tokio::test]
async fn test_always_success_single_attempt_ignores_budget() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Pass {
        output: "1 passed".to_string(),
        delay: Duration::ZERO,
    });
    let runner = TestRunner::new(project.path()).with_backend(mock.clone());
    let config = fast_config().with_retries(7);

    let result = runner.run(&spec(VALID_TEST), &config).await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(mock.calls(), 1);
    assert_eq!(result.output, "1 passed");
    // Success carries no diagnosis.
    assert!(result.analysis.is_none());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_always_fail_exhausts_exact_budget() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Fail {
        failure: "AssertionError: expected 200 got 404".to_string(),
    });
    let runner = TestRunner::new(project.path()).with_backend(mock.clone());
    let config = fast_config().with_retries(3);

    let result = runner.run(&spec(VALID_TEST), &config).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(mock.calls(), 3);
    assert_eq!(
        result.analysis.as_ref().unwrap().kind,
        ErrorKind::AssertionFailed
    );
    assert!(result.error.unwrap().contains("AssertionError"));
}

#[tokio::test]
async fn test_flaky_backend_passes_midway() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::PassOnAttempt(2));
    let runner = TestRunner::new(project.path()).with_backend(mock.clone());

    let result = runner.run(&spec(VALID_TEST), &fast_config()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_deterministic_backend_is_idempotent() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Pass {
        output: "2 passed".to_string(),
        delay: Duration::ZERO,
    });
    let runner = TestRunner::new(project.path()).with_backend(mock);

    let first = runner.run(&spec(VALID_TEST), &fast_config()).await.unwrap();
    let second = runner.run(&spec(VALID_TEST), &fast_config()).await.unwrap();

    assert_eq!(first.success, second.success);
    assert_eq!(first.output, second.output);
}

#[tokio::test]
async fn test_timeout_attempt_is_classified_and_bounded() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::SleepFor(Duration::from_secs(5)));
    let runner = TestRunner::new(project.path()).with_backend(mock);
    let config = fast_config()
        .with_timeout(Duration::from_secs(1))
        .with_retries(1);

    let started = Instant::now();
    let result = runner.run(&spec(VALID_TEST), &config).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.analysis.unwrap().kind, ErrorKind::Timeout);
    // The attempt is cut at the deadline, not at the backend's leisure.
    assert!(result.duration < Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_missing_dependency_gets_targeted_install_hint() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Fail {
        failure: "ModuleNotFoundError: No module named 'widgetkit'".to_string(),
    });
    let runner = TestRunner::new(project.path()).with_backend(mock);
    let config = fast_config().with_retries(1);

    let result = runner.run(&spec(VALID_TEST), &config).await.unwrap();

    let analysis = result.analysis.unwrap();
    assert_eq!(analysis.kind, ErrorKind::DependencyMissing);
    assert_eq!(analysis.confidence, 0.9);
    let fix = analysis.suggested_fix.unwrap();
    assert!(fix.contains("widgetkit"));
    assert!(fix.contains("pip install widgetkit"));
}

#[tokio::test]
async fn test_workspaces_are_removed_on_every_path() {
    let project = tempfile::tempdir().unwrap();

    // Passing run
    let mock = MockBackend::new(Behavior::Pass {
        output: "ok".to_string(),
        delay: Duration::ZERO,
    });
    let runner = TestRunner::new(project.path()).with_backend(mock);
    runner.run(&spec(VALID_TEST), &fast_config()).await.unwrap();
    assert!(!project.path().join(".testforge").exists());

    // Failing run
    let mock = MockBackend::new(Behavior::Fail {
        failure: "KeyError: 'x'".to_string(),
    });
    let runner = TestRunner::new(project.path()).with_backend(mock);
    runner
        .run(&spec(VALID_TEST), &fast_config().with_retries(2))
        .await
        .unwrap();
    assert!(!project.path().join(".testforge").exists());
}

#[tokio::test]
async fn test_invalid_config_is_a_configuration_error() {
    let project = tempfile::tempdir().unwrap();
    let runner = TestRunner::new(project.path());
    let config = fast_config().with_retries(0);

    let result = runner.run(&spec(VALID_TEST), &config).await;
    assert!(matches!(result, Err(RunnerError::InvalidConfig { .. })));
}

#[tokio::test]
async fn test_missing_project_is_a_configuration_error() {
    let runner = TestRunner::new("/nonexistent/project/path");
    let result = runner.run(&spec(VALID_TEST), &fast_config()).await;
    assert!(matches!(
        result,
        Err(RunnerError::BackendUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_runs_share_one_runner() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Pass {
        output: "ok".to_string(),
        delay: Duration::from_millis(20),
    });
    let runner = Arc::new(TestRunner::new(project.path()).with_backend(mock));

    let runs = (0..4).map(|i| {
        let runner = Arc::clone(&runner);
        async move {
            let spec = TestSpecification::new(format!("shared_{}", i), VALID_TEST, Ecosystem::Flask);
            runner.run(&spec, &fast_config()).await
        }
    });
    let results = futures::future::join_all(runs).await;

    for result in results {
        assert!(result.unwrap().success);
    }
    assert!(!project.path().join(".testforge").exists());
}

#[tokio::test]
async fn test_pool_caps_concurrent_executions() {
    let project = tempfile::tempdir().unwrap();
    let mock = MockBackend::new(Behavior::Pass {
        output: "ok".to_string(),
        delay: Duration::from_millis(50),
    });
    let runner = TestRunner::new(project.path()).with_backend(mock.clone());
    let pool = RunnerPool::with_runner(runner, 2);

    let specs: Vec<TestSpecification> = (0..6)
        .map(|i| TestSpecification::new(format!("spec_{}", i), VALID_TEST, Ecosystem::Flask))
        .collect();

    let results = pool.run_all(specs, &fast_config()).await;

    assert_eq!(results.len(), 6);
    assert_eq!(mock.calls(), 6);
    assert!(mock.max_active() <= 2, "limiter width exceeded");
    for (i, result) in results.iter().enumerate() {
        let result = result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.test_name, format!("spec_{}", i));
    }
}
