use thiserror::Error;

/// Comprehensive sandbox operation errors
#[derive(Error, Debug)]
pub enum SandboxError {
    /// No container runtime is available
    #[error("No container runtime available. Please install Podman or Docker to run sandboxed tests.")]
    NoRuntimeAvailable,

    /// Sandbox configuration is not usable
    #[error("Invalid sandbox configuration: {message}")]
    InvalidConfig { message: String },

    /// Container runtime is installed but not reachable
    #[error("Container runtime is not responding: {reason}")]
    ConnectivityFailed { reason: String },

    /// Sandbox image not found and could not be fetched
    #[error("Sandbox image '{image}' not found. {suggestion}")]
    ImageNotFound { image: String, suggestion: String },

    /// Isolated unit could not be created
    #[error("Failed to create sandbox unit '{name}': {reason}")]
    UnitCreateFailed { name: String, reason: String },

    /// Archive injection into the unit failed
    #[error("Failed to inject test archive into unit '{name}': {reason}")]
    InjectFailed { name: String, reason: String },

    /// Isolated unit could not be started
    #[error("Failed to start sandbox unit '{name}': {reason}")]
    UnitStartFailed { name: String, reason: String },

    /// Waiting on the unit failed for a reason other than timeout
    #[error("Failed to wait on sandbox unit '{name}': {reason}")]
    WaitFailed { name: String, reason: String },

    /// Unit removal failed
    #[error("Failed to remove sandbox unit '{name}': {reason}")]
    CleanupFailed { name: String, reason: String },

    /// Context archive could not be built
    #[error("Failed to build test archive: {reason}")]
    ArchiveFailed { reason: String },

    /// Runtime command execution failed
    #[error("Command execution failed: {command}")]
    CommandFailed { command: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
