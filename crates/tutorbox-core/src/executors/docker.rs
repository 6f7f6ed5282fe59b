// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptionsBuilder, ListContainersOptionsBuilder,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    ContainerId, ContainerLogs, ContainerRuntime, ContainerSpec, ManagedContainer, WaitOutcome,
    MANAGED_LABEL,
};
use crate::errors::SandboxError;

/// Engine call being made, used to classify bollard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Start,
    Wait,
    Logs,
    Kill,
    Remove,
    List,
    Inspect,
    Ping,
    Pull,
}

/// [`ContainerRuntime`] backed by the local Docker engine.
///
/// The bollard client is cheap to clone and safe to share; no container state
/// is cached here.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    output_limit_bytes: usize,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect(output_limit_bytes: usize) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::RuntimeUnavailable(format!(
                "Failed to connect to Docker. Make sure Docker is running: {}",
                e
            ))
        })?;
        Ok(Self::with_client(docker, output_limit_bytes))
    }

    pub fn with_client(docker: Docker, output_limit_bytes: usize) -> Self {
        Self {
            docker,
            output_limit_bytes,
        }
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let policy = &spec.policy;
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), policy.tmpfs_options());

        HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                spec.workspace.display(),
                spec.working_dir
            )]),
            memory: Some(policy.memory_bytes),
            // Equal to memory: no swap on top of the ceiling.
            memory_swap: Some(policy.memory_bytes),
            nano_cpus: Some(policy.nano_cpus()),
            pids_limit: Some(policy.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            user: Some(spec.policy.container_user()),
            env: Some(vec![
                "HOME=/tmp".to_string(),
                "PYTHONDONTWRITEBYTECODE=1".to_string(),
            ]),
            labels: Some(labels),
            network_disabled: Some(true),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        }
    }

    /// Exit code of a stopped container, read back from the engine.
    async fn inspect_exit_code(&self, id: &str) -> Result<i64, SandboxError> {
        let details = self
            .docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await
            .map_err(|e| classify(Operation::Inspect, e))?;
        details
            .state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| {
                SandboxError::RuntimeUnavailable(format!("container {} reported no exit code", id))
            })
    }
}

/// Map a bollard failure onto the broker's error taxonomy.
fn classify(operation: Operation, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match (operation, status_code) {
            (Operation::Create, 404) | (Operation::Pull, 404) => {
                SandboxError::StartFailed(format!("image not found: {}", message))
            }
            (Operation::Create, 400) | (Operation::Create, 409) => {
                SandboxError::SpecInvalid(message)
            }
            (Operation::Start, _) => SandboxError::StartFailed(message),
            (_, code) => SandboxError::RuntimeUnavailable(format!(
                "{:?} failed with HTTP {}: {}",
                operation, code, message
            )),
        },
        other => SandboxError::RuntimeUnavailable(format!("{:?} failed: {}", operation, other)),
    }
}

fn is_missing_or_stopped(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404 | 409 | 304,
            ..
        }
    )
}

/// Append `chunk` to `buf` without growing past `limit`.
fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
    let room = limit.saturating_sub(buf.len());
    if chunk.len() > room {
        *truncated = true;
    }
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, SandboxError> {
        spec.validate()?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let container = self
            .docker
            .create_container(options, Self::container_body(spec))
            .await
            .map_err(|e| classify(Operation::Create, e))?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", spec.name, warning);
        }
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| classify(Operation::Start, e))
    }

    async fn wait_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, SandboxError> {
        let mut wait_stream = self.docker.wait_container(
            id,
            Some(BollardWaitContainerOptionsQuery {
                condition: "not-running".to_string(),
            }),
        );

        let wait_outcome = match tokio::time::timeout(timeout, wait_stream.next()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!("Execution timed out for container {}", id);
                return Ok(WaitOutcome::TimedOut);
            }
        };

        match wait_outcome {
            Some(Ok(response)) => Ok(WaitOutcome::Exited(response.status_code)),
            // bollard reports a non-zero exit status as an error; it is a normal exit here.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                Ok(WaitOutcome::Exited(code))
            }
            Some(Err(e)) => Err(classify(Operation::Wait, e)),
            None => self.inspect_exit_code(id).await.map(WaitOutcome::Exited),
        }
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, SandboxError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut truncated = false;
        while let Some(log_result) = output_stream.next().await {
            match log_result {
                Ok(LogOutput::StdOut { message }) => {
                    push_capped(&mut stdout, &message, self.output_limit_bytes, &mut truncated)
                }
                Ok(LogOutput::StdErr { message }) => {
                    push_capped(&mut stderr, &message, self.output_limit_bytes, &mut truncated)
                }
                Ok(_) => {}
                Err(e) => return Err(classify(Operation::Logs, e)),
            }
        }

        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated,
        })
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let options = KillContainerOptionsBuilder::default().signal("SIGKILL").build();
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_or_stopped(&e) => {
                log::debug!("Container {} already stopped: {}", id, e);
                Ok(())
            }
            Err(e) => Err(classify(Operation::Kill, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_or_stopped(&e) => {
                log::debug!("Container {} already removed: {}", id, e);
                Ok(())
            }
            Err(e) => Err(match classify(Operation::Remove, e) {
                SandboxError::RuntimeUnavailable(message) => SandboxError::RemoveFailed {
                    id: id.to_string(),
                    message,
                },
                other => other,
            }),
        }
    }

    async fn list_managed(&self, name_prefix: &str) -> Result<Vec<ManagedContainer>, SandboxError> {
        let label = format!("{}=true", MANAGED_LABEL);
        let mut filters = HashMap::new();
        filters.insert("label", vec![label.as_str()]);
        filters.insert("name", vec![name_prefix]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(Operation::List, e))?;

        let mut managed = Vec::new();
        for summary in summaries {
            let (Some(id), Some(created)) = (summary.id, summary.created) else {
                continue;
            };
            // The name filter is a substring match; enforce the prefix here.
            let name = summary
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.trim_start_matches('/').to_string())
                .find(|n| n.starts_with(name_prefix));
            let Some(name) = name else {
                continue;
            };
            let Some(created_at) = DateTime::<Utc>::from_timestamp(created, 0) else {
                log::warn!("Container {} has an invalid creation time {}", id, created);
                continue;
            };
            managed.push(ManagedContainer {
                id,
                name,
                created_at,
            });
        }
        Ok(managed)
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| classify(Operation::Ping, e))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling execution image {}...", image);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(options, None, None);
        while let Some(progress) = pull_stream.next().await {
            let info = progress.map_err(|e| classify(Operation::Pull, e))?;
            if let Some(status) = info.status {
                log::debug!("{}: {}", image, status);
            }
        }
        log::info!("Execution image {} is ready", image);
        Ok(())
    }
}
