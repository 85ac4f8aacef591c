pub mod analyzer;
pub mod backend;
pub mod local;
pub mod orchestrator;
pub mod parse;
pub mod pool;
pub mod sandboxed;
pub mod spec;

pub use analyzer::{ErrorAnalysis, ErrorKind, SourceLocation, TestErrorAnalyzer};
pub use backend::{
    ExecutionBackend, ExecutionMode, RawExecutionResult, RunnerError, RunnerResult,
};
pub use local::LocalProcessBackend;
pub use orchestrator::{TestResult, TestRunner};
pub use pool::{RunnerPool, DEFAULT_POOL_WIDTH};
pub use sandboxed::ContainerSandboxBackend;
pub use spec::{detect_settings_module, Ecosystem, ExecutionConfig, TestSpecification};
