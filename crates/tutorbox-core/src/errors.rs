//! Error types for the execution broker and its collaborators
//!
//! Errors are grouped by the layer that raises them: configuration and policy
//! problems surface at startup, admission problems (`PayloadTooLarge`, `Busy`)
//! surface before any container exists, and container engine problems are
//! raised by the runtime adapter and folded into an `ExecutionResult` at the
//! broker boundary. A student program exiting non-zero is never an error.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Invalid container spec: {0}")]
    SpecInvalid(String),
    #[error("Invalid execution policy: {0}")]
    PolicyInvalid(String),
    #[error("Container failed to start: {0}")]
    StartFailed(String),
    #[error("execution timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error("Submitted code is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Broker is busy: {limit} executions already in flight")]
    Busy { limit: usize },
    #[error("Failed to remove container {id}: {message}")]
    RemoveFailed { id: String, message: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl SandboxError {
    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Busy { .. })
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::RuntimeUnavailable(_) => "runtime_unavailable",
            SandboxError::SpecInvalid(_) => "spec_invalid",
            SandboxError::PolicyInvalid(_) => "policy_invalid",
            SandboxError::StartFailed(_) => "start_failed",
            SandboxError::TimedOut { .. } => "timed_out",
            SandboxError::PayloadTooLarge { .. } => "payload_too_large",
            SandboxError::Busy { .. } => "busy",
            SandboxError::RemoveFailed { .. } => "remove_failed",
            SandboxError::ConfigError(_) => "config_error",
            SandboxError::IoError(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SandboxError {
    fn from(err: serde_yaml::Error) -> Self {
        SandboxError::ConfigError(format!("Failed to parse YAML config: {}", err))
    }
}
