//! Sandboxed execution of untrusted student code.
//!
//! The [`ContainerRuntime`] trait is the seam between the broker and the host's
//! container engine. [`docker::DockerRuntime`] talks to Docker through bollard;
//! tests substitute an in-memory fake. Every call is a self-contained request to
//! the engine, so one runtime instance is shared by all concurrent executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SandboxError;
use crate::policy::ExecutionPolicy;

pub mod broker;
pub mod docker;
pub mod handle;
pub mod sweeper;
pub mod workspace;

/// Label attached to every container the broker creates.
pub const MANAGED_LABEL: &str = "tutorbox.managed";

pub type ContainerId = String;

/// Everything the engine needs to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Mount point of the workspace inside the container.
    pub working_dir: String,
    /// Host directory holding the injected code, mounted read-only.
    pub workspace: PathBuf,
    pub labels: HashMap<String, String>,
    pub policy: Arc<ExecutionPolicy>,
}

impl ContainerSpec {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.name.is_empty() || !is_valid_container_name(&self.name) {
            return Err(SandboxError::SpecInvalid(format!(
                "invalid container name '{}'",
                self.name
            )));
        }
        if self.image.trim().is_empty() {
            return Err(SandboxError::SpecInvalid("image cannot be empty".to_string()));
        }
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(SandboxError::SpecInvalid("command cannot be empty".to_string()));
        }
        if !Path::new(&self.working_dir).is_absolute() {
            return Err(SandboxError::SpecInvalid(format!(
                "working_dir '{}' must be absolute",
                self.working_dir
            )));
        }
        if !self.workspace.is_dir() {
            return Err(SandboxError::SpecInvalid(format!(
                "workspace {} does not exist",
                self.workspace.display()
            )));
        }
        self.policy
            .validate()
            .map_err(|e| SandboxError::SpecInvalid(e.to_string()))
    }
}

/// Docker accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// True when `name` is a bare file name with no directory parts.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
    /// The runtime dropped output beyond its capture limit.
    pub truncated: bool,
}

/// A container carrying the management label, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: ContainerId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container for `spec`.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Wait for the container to exit, giving up after `timeout`.
    async fn wait_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, SandboxError>;

    async fn logs(&self, id: &str) -> Result<ContainerLogs, SandboxError>;

    /// SIGKILL the container. Already stopped or missing is not an error.
    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Force-remove the container. Idempotent.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;

    /// Containers carrying [`MANAGED_LABEL`] whose name starts with `name_prefix`.
    async fn list_managed(&self, name_prefix: &str) -> Result<Vec<ManagedContainer>, SandboxError>;

    async fn ping(&self) -> Result<(), SandboxError>;

    /// Make sure `image` is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;
}
