//! Request and result types exchanged with the lesson layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::SandboxError;

/// Exit code reported when the student process never produced one.
pub const NO_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            lesson_id: None,
            exercise_id: None,
        }
    }

    /// Student code followed by the exercise's test code.
    pub fn with_tests(code: &str, test_code: &str) -> Self {
        Self::new(format!("{}\n\n{}", code, test_code))
    }

    pub fn lesson(mut self, lesson_id: impl Into<String>) -> Self {
        self.lesson_id = Some(lesson_id.into());
        self
    }

    pub fn exercise(mut self, exercise_id: impl Into<String>) -> Self {
        self.exercise_id = Some(exercise_id.into());
        self
    }
}

/// Lifecycle of one broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Starting,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cleaned,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::Created => "created",
            ExecutionState::Starting => "starting",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Failed => "failed",
            ExecutionState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

/// How an execution ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionStatus {
    Completed,
    /// The program ran to completion with a non-zero status. Not a system error.
    NonZeroExit,
    TimedOut,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i64,
    pub execution_time_ms: u64,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
}

impl ExecutionResult {
    /// The process exited on its own; success follows the exit code.
    pub fn exited(stdout: String, stderr: String, exit_code: i64, elapsed: Duration) -> Self {
        let status = if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::NonZeroExit
        };
        Self {
            success: exit_code == 0,
            output: stdout,
            error: stderr,
            exit_code,
            execution_time_ms: elapsed.as_millis() as u64,
            status,
            output_truncated: false,
            lesson_id: None,
            exercise_id: None,
        }
    }

    /// Wall-clock budget exhausted. Whatever stderr was captured follows the
    /// timeout message.
    pub fn timed_out(stdout: String, stderr: String, timeout_ms: u64, elapsed: Duration) -> Self {
        let mut error = SandboxError::TimedOut { timeout_ms }.to_string();
        if !stderr.is_empty() {
            error.push('\n');
            error.push_str(&stderr);
        }
        Self {
            success: false,
            output: stdout,
            error,
            exit_code: NO_EXIT_CODE,
            execution_time_ms: elapsed.as_millis() as u64,
            status: ExecutionStatus::TimedOut,
            output_truncated: false,
            lesson_id: None,
            exercise_id: None,
        }
    }

    pub fn failed(err: &SandboxError, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: err.to_string(),
            exit_code: NO_EXIT_CODE,
            execution_time_ms: elapsed.as_millis() as u64,
            status: ExecutionStatus::Failed {
                reason: err.kind().to_string(),
            },
            output_truncated: false,
            lesson_id: None,
            exercise_id: None,
        }
    }

    /// Copy the opaque correlation ids from the request.
    pub fn correlate(mut self, request: &ExecutionRequest) -> Self {
        self.lesson_id = request.lesson_id.clone();
        self.exercise_id = request.exercise_id.clone();
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }
}
