//! Bounded concurrent execution of many specifications.
//!
//! Attempts for a single specification stay strictly sequential; across
//! specifications a counting semaphore caps simultaneously active backend
//! executions to bound host resource pressure. Excess requests queue.

use crate::backend::{RunnerError, RunnerResult};
use crate::orchestrator::{TestResult, TestRunner};
use crate::spec::{ExecutionConfig, TestSpecification};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of simultaneously active backend executions
pub const DEFAULT_POOL_WIDTH: usize = 4;

/// Runs many specifications concurrently against one target project
pub struct RunnerPool {
    runner: Arc<TestRunner>,
    semaphore: Arc<Semaphore>,
}

impl RunnerPool {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self::with_width(project_path, DEFAULT_POOL_WIDTH)
    }

    pub fn with_width(project_path: impl Into<PathBuf>, width: usize) -> Self {
        Self::with_runner(TestRunner::new(project_path), width)
    }

    /// Wrap an existing runner, e.g. one with a pinned backend
    pub fn with_runner(runner: TestRunner, width: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            semaphore: Arc::new(Semaphore::new(width.max(1))),
        }
    }

    /// Run every specification to completion and return results in input
    /// order. Each result carries the test name for correlation, so
    /// callers may also consume them unordered.
    pub async fn run_all(
        &self,
        specs: Vec<TestSpecification>,
        config: &ExecutionConfig,
    ) -> Vec<RunnerResult<TestResult>> {
        let mut config = config.clone();
        if config.with_coverage {
            // The coverage sidecar is process-wide shared state; it is not
            // safe to accumulate under concurrent runs.
            tracing::warn!("coverage collection is disabled under concurrent runs");
            config.with_coverage = false;
        }
        let config = Arc::new(config);

        let total = specs.len();
        let mut tasks = JoinSet::new();
        for (index, spec) in specs.into_iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&self.semaphore);
            let config = Arc::clone(&config);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_closed) => {
                        return (
                            index,
                            Err(RunnerError::PoolFailed {
                                reason: "concurrency limiter closed".to_string(),
                            }),
                        );
                    }
                };
                (index, runner.run(&spec, &config).await)
            });
        }

        let mut results: Vec<Option<RunnerResult<TestResult>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "concurrent run task failed"),
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(RunnerError::PoolFailed {
                        reason: "task ended before reporting a result".to_string(),
                    })
                })
            })
            .collect()
    }
}
