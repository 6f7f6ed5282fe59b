//! Configuration loader for YAML files and environment overrides
//!
//! Values are resolved in three layers: built-in defaults, the YAML document,
//! then `TUTORBOX_*` environment variables. The merged result is validated
//! before it is returned, so a loaded configuration is always usable.

use serde_yaml::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

use crate::config::types::SandboxConfig;
use crate::errors::SandboxError;

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandboxConfig, SandboxError> {
        let document: Value = serde_yaml::from_str(content)?;
        Self::require_explicit_network(&document)?;

        let mut config: SandboxConfig = serde_yaml::from_value(document)?;
        Self::resolve_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Built-in defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<SandboxConfig, SandboxError> {
        let mut config = SandboxConfig::default();
        Self::resolve_environment(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// A policy that omits `network` must not parse into a default.
    fn require_explicit_network(document: &Value) -> Result<(), SandboxError> {
        let network = document.get("policy").and_then(|policy| policy.get("network"));
        match network {
            Some(Value::String(_)) => Ok(()),
            Some(other) => Err(SandboxError::PolicyInvalid(format!(
                "policy.network must be the string 'disabled', got {:?}",
                other
            ))),
            None => Err(SandboxError::PolicyInvalid(
                "policy.network must be set explicitly to 'disabled'".to_string(),
            )),
        }
    }

    /// Apply `TUTORBOX_*` environment variables on top of the file values.
    fn resolve_environment(config: &mut SandboxConfig) -> Result<(), SandboxError> {
        if let Some(image) = Self::env_string("TUTORBOX_IMAGE") {
            config.runtime.image = image;
        }
        if let Some(root) = Self::env_string("TUTORBOX_WORKSPACE_ROOT") {
            config.runtime.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(level) = Self::env_string("TUTORBOX_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(timeout_ms) = Self::env_parse("TUTORBOX_TIMEOUT_MS")? {
            config.policy.timeout_ms = timeout_ms;
        }
        if let Some(memory_bytes) = Self::env_parse("TUTORBOX_MEMORY_BYTES")? {
            config.policy.memory_bytes = memory_bytes;
        }
        if let Some(cpu_cores) = Self::env_parse("TUTORBOX_CPU_CORES")? {
            config.policy.cpu_cores = cpu_cores;
        }
        if let Some(max_concurrent) = Self::env_parse("TUTORBOX_MAX_CONCURRENT")? {
            config.broker.max_concurrent = max_concurrent;
        }
        if let Some(enabled) = Self::env_parse("TUTORBOX_SWEEPER_ENABLED")? {
            config.sweeper.enabled = enabled;
        }
        Ok(())
    }

    fn env_string(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    fn env_parse<T>(key: &str) -> Result<Option<T>, SandboxError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::env_string(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                SandboxError::ConfigError(format!("Invalid value '{}' for {}: {}", raw, key, e))
            }),
            None => Ok(None),
        }
    }
}
