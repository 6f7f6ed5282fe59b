//! Sandboxed, ephemeral execution of untrusted student code.
//!
//! This crate runs submitted programs in throwaway Docker containers that are
//! resource-bounded, network-disabled and run as a non-root user, enforces a
//! wall-clock timeout, captures output, and guarantees the container is removed
//! on every exit path.
//!
//! # Architecture Overview
//!
//! - **Resource policy** ([`policy`]): the immutable limits every container gets
//! - **Runtime adapter** ([`executors::ContainerRuntime`], [`executors::docker`]):
//!   create, start, wait, logs, kill and remove against the container engine
//! - **Execution broker** ([`executors::broker`]): one request end to end, with
//!   bounded concurrency and scoped container ownership
//! - **Cleanup sweeper** ([`executors::sweeper`]): removes orphans left behind by
//!   crashed processes
//! - **Configuration** ([`config`]): YAML file plus `TUTORBOX_*` overrides

pub mod config;
pub mod errors;
pub mod executors;
pub mod models;
pub mod policy;

pub use config::{ConfigLoader, SandboxConfig};
pub use errors::SandboxError;
pub use executors::broker::{BrokerSettings, ExecutionBroker};
pub use executors::docker::DockerRuntime;
pub use executors::sweeper::{CleanupSweeper, SweepReport, SweeperSettings};
pub use executors::ContainerRuntime;
pub use models::{ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use policy::{ExecutionPolicy, NetworkMode};

#[cfg(test)]
pub mod test_utils;
