//! Resource policy applied to every sandbox container.
//!
//! The policy is loaded once at startup, validated, and then shared read-only
//! (behind an `Arc`) by every broker call. Network isolation is mandatory: the
//! `network` field has no serde default, so a configuration that omits it is
//! rejected instead of silently running with a network.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::SandboxError;

/// Network mode of a sandbox container. Only `Disabled` passes validation;
/// the other variants exist so a misconfiguration parses and is reported
/// with a precise message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Disabled,
    Bridge,
    Host,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkMode::Disabled => "disabled",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        };
        f.write_str(name)
    }
}

/// Smallest CPU quota the engine accepts. A quota that rounds to zero
/// nano-CPUs would mean no limit at all.
pub const MIN_CPU_CORES: f64 = 0.01;

/// Identity the student process runs as inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
}

impl Default for SandboxUser {
    fn default() -> Self {
        // nobody:nogroup
        Self {
            uid: 65534,
            gid: 65534,
        }
    }
}

/// Resource ceiling for a single execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Fraction of host cores, e.g. `0.5` for half a core.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    /// Size of the only writable filesystem (`/tmp`); the root fs is read-only.
    #[serde(default = "default_disk_bytes")]
    pub disk_bytes: i64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    pub network: NetworkMode,
    #[serde(default)]
    pub user: SandboxUser,
    /// Wall-clock budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            memory_bytes: default_memory_bytes(),
            disk_bytes: default_disk_bytes(),
            pids_limit: default_pids_limit(),
            network: NetworkMode::Disabled,
            user: SandboxUser::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ExecutionPolicy {
    /// Reject any policy that would weaken the sandbox.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if !self.cpu_cores.is_finite() || self.cpu_cores < MIN_CPU_CORES {
            return Err(SandboxError::PolicyInvalid(format!(
                "cpu_cores must be at least {}, got {}",
                MIN_CPU_CORES, self.cpu_cores
            )));
        }
        if self.memory_bytes <= 0 {
            return Err(SandboxError::PolicyInvalid(format!(
                "memory_bytes must be greater than 0, got {}",
                self.memory_bytes
            )));
        }
        if self.disk_bytes <= 0 {
            return Err(SandboxError::PolicyInvalid(format!(
                "disk_bytes must be greater than 0, got {}",
                self.disk_bytes
            )));
        }
        if self.pids_limit <= 0 {
            return Err(SandboxError::PolicyInvalid(format!(
                "pids_limit must be greater than 0, got {}",
                self.pids_limit
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SandboxError::PolicyInvalid(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.network != NetworkMode::Disabled {
            return Err(SandboxError::PolicyInvalid(format!(
                "network must be 'disabled', got '{}'",
                self.network
            )));
        }
        if self.user.uid == 0 || self.user.gid == 0 {
            return Err(SandboxError::PolicyInvalid(
                "sandbox user must not be root".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// CPU quota in the unit Docker expects (billionths of a core).
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0).round() as i64
    }

    /// `uid:gid` string for the container `User` field.
    pub fn container_user(&self) -> String {
        format!("{}:{}", self.user.uid, self.user.gid)
    }

    /// Mount options for the size-bounded scratch tmpfs.
    pub fn tmpfs_options(&self) -> String {
        format!("rw,noexec,nosuid,nodev,size={}", self.disk_bytes)
    }
}

fn default_cpu_cores() -> f64 {
    0.5
}

fn default_memory_bytes() -> i64 {
    256 * 1024 * 1024
}

fn default_disk_bytes() -> i64 {
    64 * 1024 * 1024
}

fn default_pids_limit() -> i64 {
    64
}

fn default_timeout_ms() -> u64 {
    10_000
}
