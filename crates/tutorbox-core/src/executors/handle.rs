//! Scoped ownership of one live sandbox container.
//!
//! An [`ExecutionHandle`] is created as soon as the engine returns a container
//! id and must end in exactly one of two ways: [`ExecutionHandle::release`]
//! removes the container, or the handle is dropped unreleased (the owning task
//! was cancelled or panicked), in which case `Drop` schedules a background
//! removal and logs the container as orphaned so the sweeper can collect it if
//! that removal never happens.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::workspace::Workspace;
use super::{ContainerId, ContainerRuntime};
use crate::errors::SandboxError;

pub struct ExecutionHandle {
    runtime: Arc<dyn ContainerRuntime>,
    id: ContainerId,
    name: String,
    created_at: DateTime<Utc>,
    deadline: Option<Instant>,
    workspace: Option<Workspace>,
    released: bool,
}

impl ExecutionHandle {
    pub(crate) fn acquire(
        runtime: Arc<dyn ContainerRuntime>,
        id: ContainerId,
        name: String,
        workspace: Workspace,
    ) -> Self {
        log::debug!("Acquired container {} ({})", name, id);
        Self {
            runtime,
            id,
            name,
            created_at: Utc::now(),
            deadline: None,
            workspace: Some(workspace),
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Start the wall-clock budget. Called once the container is running.
    pub fn arm(&mut self, timeout: Duration) -> Instant {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);
        deadline
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when not yet armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Remove the container and its workspace. Consumes the handle.
    pub async fn release(mut self) -> Result<(), SandboxError> {
        self.released = true;
        let result = self.runtime.remove(&self.id).await;
        self.workspace.take();
        match &result {
            Ok(()) => log::debug!("Released container {} ({})", self.name, self.id),
            Err(e) => log::error!(
                "Failed to remove container {} ({}), leaving it to the sweeper: {}",
                self.name,
                self.id,
                e
            ),
        }
        result
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "Container {} ({}) dropped without release; flagged as orphaned",
            self.name,
            self.id
        );
        let runtime = self.runtime.clone();
        let id = self.id.clone();
        let workspace = self.workspace.take();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        log::error!("Background removal of orphan {} failed: {}", id, e);
                    }
                    drop(workspace);
                });
            }
            Err(_) => {
                log::error!("No async runtime to remove orphan {}; the sweeper will collect it", id);
            }
        }
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("deadline", &self.deadline)
            .field("released", &self.released)
            .finish()
    }
}
