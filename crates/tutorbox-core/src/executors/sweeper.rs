//! Background removal of orphaned sandbox containers and workspaces.
//!
//! A container is an orphan when it carries the management label, its name
//! starts with the broker's prefix, and it is older than [`orphan_age`]: the
//! longest a broker can hold a container (policy timeout, wait grace and
//! [`ORPHAN_AGE_SLACK`]) multiplied by the safety factor. Age counts from
//! container creation, before the timeout is armed, so the slack covers start
//! latency, the kill and log collection after a timeout, and the engine's
//! one-second timestamp resolution. Host workspaces left behind by a crashed
//! process are matched the same way, by prefix and age.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ContainerRuntime;
use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::policy::ExecutionPolicy;

/// Time a live execution may spend outside its timeout and wait grace.
pub const ORPHAN_AGE_SLACK: Duration = Duration::from_secs(5);

/// Age beyond which a managed container cannot belong to a live execution.
pub fn orphan_age(
    timeout: Duration,
    wait_grace: Duration,
    safety_factor: f64,
) -> Result<Duration, SandboxError> {
    if !safety_factor.is_finite() || safety_factor < 1.0 {
        return Err(SandboxError::ConfigError(format!(
            "sweeper safety factor must be at least 1.0, got {}",
            safety_factor
        )));
    }
    let longest_run = timeout + wait_grace + ORPHAN_AGE_SLACK;
    Duration::try_from_secs_f64(longest_run.as_secs_f64() * safety_factor).map_err(|_| {
        SandboxError::ConfigError(format!(
            "sweeper safety factor {} makes the orphan age overflow",
            safety_factor
        ))
    })
}

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    pub interval: Duration,
    pub safety_factor: f64,
    /// The broker's allowance past the timeout; see [`orphan_age`].
    pub wait_grace: Duration,
    pub name_prefix: String,
    pub workspace_root: PathBuf,
}

impl SweeperSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            interval: config.sweeper.interval(),
            safety_factor: config.sweeper.safety_factor,
            wait_grace: config.broker.wait_grace(),
            name_prefix: config.runtime.name_prefix.clone(),
            workspace_root: config.runtime.workspace_root(),
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub workspaces_removed: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty() && self.workspaces_removed == 0
    }
}

pub struct CleanupSweeper {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SweeperSettings,
    max_age: Duration,
}

impl CleanupSweeper {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<ExecutionPolicy>,
        settings: SweeperSettings,
    ) -> Result<Self, SandboxError> {
        if settings.interval.is_zero() {
            return Err(SandboxError::ConfigError(
                "sweeper interval must be greater than 0".to_string(),
            ));
        }
        let max_age = orphan_age(
            policy.timeout(),
            settings.wait_grace,
            settings.safety_factor,
        )?;
        Ok(Self {
            runtime,
            settings,
            max_age,
        })
    }

    pub fn from_config(
        runtime: Arc<dyn ContainerRuntime>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        Self::new(
            runtime,
            Arc::new(config.policy.clone()),
            SweeperSettings::from_config(config),
        )
    }

    /// Age beyond which a managed container is considered orphaned.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, SandboxError> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass, treating `now` as the current time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, SandboxError> {
        let max_age = self.max_age();
        let containers = self.runtime.list_managed(&self.settings.name_prefix).await?;
        let mut report = SweepReport {
            scanned: containers.len(),
            ..Default::default()
        };

        for container in containers {
            let age = (now - container.created_at).to_std().unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }
            log::warn!(
                "Removing orphaned container {} ({}), age {}s",
                container.name,
                container.id,
                age.as_secs()
            );
            match self.runtime.remove(&container.id).await {
                Ok(()) => report.removed.push(container.id),
                Err(e) => {
                    log::error!("Failed to remove orphan {}: {}", container.id, e);
                    report.failed.push(container.id);
                }
            }
        }

        report.workspaces_removed = self.sweep_workspaces(now, max_age).await;
        Ok(report)
    }

    async fn sweep_workspaces(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let root = &self.settings.workspace_root;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Cannot scan workspace root {}: {}", root.display(), e);
                return 0;
            }
        };
        let now: SystemTime = now.into();

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&self.settings.name_prefix) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    log::warn!("Removed stale workspace {}", entry.path().display());
                    removed += 1;
                }
                Err(e) => log::error!(
                    "Failed to remove stale workspace {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
        removed
    }

    /// Sweep every interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!(
                "Cleanup sweeper started (interval {}s, max age {}s)",
                self.settings.interval.as_secs(),
                self.max_age().as_secs()
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Cleanup sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(report) if report.is_clean() => {
                                log::debug!("Sweep found {} managed containers, nothing to do", report.scanned);
                            }
                            Ok(report) => log::info!(
                                "Sweep removed {} containers and {} workspaces ({} failed)",
                                report.removed.len(),
                                report.workspaces_removed,
                                report.failed.len()
                            ),
                            Err(e) => log::error!("Sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
