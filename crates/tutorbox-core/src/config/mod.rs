//! Configuration module for the execution broker
//!
//! Supports a YAML configuration file with environment overrides and
//! programmatic construction through `Default`.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::SandboxError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
    ConfigLoader::from_file(path).await
}
