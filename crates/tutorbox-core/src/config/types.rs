//! Configuration types for the execution broker

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SandboxError;
use crate::executors::sweeper::orphan_age;
use crate::executors::{is_plain_file_name, is_valid_container_name};
use crate::policy::ExecutionPolicy;

/// Top-level configuration, usually read from `tutorbox.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub policy: ExecutionPolicy,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container image and layout of the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Interpreter invocation; the path of the code file is appended.
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default = "default_code_file")]
    pub code_file: String,
    /// Naming convention shared by containers and host workspaces.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Where host workspaces are created; the system temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub pull_missing_image: bool,
}

/// Admission limits for the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Extra time the broker allows the runtime's own wait before giving up on it.
    #[serde(default = "default_wait_grace_ms")]
    pub wait_grace_ms: u64,
}

/// Orphan container sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Multiplier on the longest a broker can hold a container
    /// (`policy.timeout_ms` + `broker.wait_grace_ms` + slack).
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            interpreter: default_interpreter(),
            working_dir: default_working_dir(),
            code_file: default_code_file(),
            name_prefix: default_name_prefix(),
            workspace_root: None,
            pull_missing_image: true,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_code_bytes: default_max_code_bytes(),
            max_output_bytes: default_max_output_bytes(),
            wait_grace_ms: default_wait_grace_ms(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            safety_factor: default_safety_factor(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            runtime: RuntimeConfig::default(),
            broker: BrokerConfig::default(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Full command run inside the container.
    pub fn command(&self) -> Vec<String> {
        let mut command = self.interpreter.clone();
        command.push(self.code_path_in_container());
        command
    }

    pub fn code_path_in_container(&self) -> String {
        format!("{}/{}", self.working_dir.trim_end_matches('/'), self.code_file)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl BrokerConfig {
    pub fn wait_grace(&self) -> Duration {
        Duration::from_millis(self.wait_grace_ms)
    }
}

impl SandboxConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandboxError> {
        self.policy.validate()?;

        if self.runtime.image.trim().is_empty() {
            return Err(SandboxError::ConfigError("runtime.image cannot be empty".to_string()));
        }
        if self.runtime.interpreter.is_empty() || self.runtime.interpreter[0].trim().is_empty() {
            return Err(SandboxError::ConfigError(
                "runtime.interpreter cannot be empty".to_string(),
            ));
        }
        if !Path::new(&self.runtime.working_dir).is_absolute() {
            return Err(SandboxError::ConfigError(format!(
                "runtime.working_dir '{}' must be an absolute path",
                self.runtime.working_dir
            )));
        }
        if !is_plain_file_name(&self.runtime.code_file) {
            return Err(SandboxError::ConfigError(format!(
                "runtime.code_file '{}' must be a plain file name",
                self.runtime.code_file
            )));
        }
        if !is_valid_container_name(&self.runtime.name_prefix) {
            return Err(SandboxError::ConfigError(format!(
                "runtime.name_prefix '{}' is not a valid container name prefix",
                self.runtime.name_prefix
            )));
        }

        if self.broker.max_concurrent == 0 {
            return Err(SandboxError::ConfigError(
                "broker.max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.broker.max_code_bytes == 0 {
            return Err(SandboxError::ConfigError(
                "broker.max_code_bytes must be greater than 0".to_string(),
            ));
        }
        if self.broker.max_output_bytes == 0 {
            return Err(SandboxError::ConfigError(
                "broker.max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.sweeper.interval_secs == 0 {
            return Err(SandboxError::ConfigError(
                "sweeper.interval_secs must be greater than 0".to_string(),
            ));
        }
        orphan_age(
            self.policy.timeout(),
            self.broker.wait_grace(),
            self.sweeper.safety_factor,
        )?;

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(SandboxError::ConfigError(format!(
                "logging.level '{}' is not a valid log level",
                self.logging.level
            )));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_interpreter() -> Vec<String> {
    vec!["python3".to_string(), "-u".to_string()]
}

fn default_working_dir() -> String {
    "/sandbox".to_string()
}

fn default_code_file() -> String {
    "main.py".to_string()
}

fn default_name_prefix() -> String {
    "tutorbox-exec-".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_code_bytes() -> usize {
    256 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_wait_grace_ms() -> u64 {
    2000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_safety_factor() -> f64 {
    3.0
}

fn default_log_level() -> String {
    "info".to_string()
}
