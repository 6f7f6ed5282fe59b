use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::SandboxError;
use crate::executors::{
    ContainerId, ContainerLogs, ContainerRuntime, ContainerSpec, ManagedContainer, WaitOutcome,
};

/// Engine call recorded by [`FakeRuntime`]. Carries the container id, except
/// `Create` which carries the requested name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Start(String),
    Wait(String),
    Logs(String),
    Kill(String),
    Remove(String),
    List(String),
    Ping,
    EnsureImage(String),
}

/// What a fake container does, decided from the submitted code.
#[derive(Debug, Clone)]
pub enum Behavior {
    Exit {
        stdout: String,
        stderr: String,
        code: i64,
    },
    /// Runs until the adapter's timeout elapses.
    Hang,
    /// The adapter's wait never returns at all.
    Stall,
    FailCreate(SandboxError),
    FailStart(SandboxError),
    /// Starts, then the engine's wait endpoint fails.
    FailWait(SandboxError),
    /// Exits 0 but the engine fails to return logs.
    FailLogs(SandboxError),
}

type Script = Box<dyn Fn(&str) -> Behavior + Send + Sync>;

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    containers: HashMap<String, Behavior>,
    managed: Vec<ManagedContainer>,
    remove_failures: HashSet<String>,
    next_id: u64,
}

pub struct FakeRuntime {
    script: Script,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    /// Every container prints its own code and exits 0.
    pub fn new() -> Self {
        Self::scripted(|code| Behavior::Exit {
            stdout: code.to_string(),
            stderr: String::new(),
            code: 0,
        })
    }

    pub fn scripted(script: impl Fn(&str) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Pretend these containers already exist on the engine.
    pub fn with_managed(self, containers: Vec<ManagedContainer>) -> Self {
        self.state.lock().unwrap().managed = containers;
        self
    }

    pub fn fail_remove(&self, id: &str) {
        self.state.lock().unwrap().remove_failures.insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn remove_count(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Remove(removed) if removed == id))
            .count()
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                Call::Start(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn behavior(&self, id: &str) -> Behavior {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .unwrap_or(Behavior::Exit {
                stdout: String::new(),
                stderr: String::new(),
                code: 0,
            })
    }

    fn read_code(spec: &ContainerSpec) -> String {
        let file = spec
            .command
            .last()
            .and_then(|arg| Path::new(arg).file_name())
            .map(|name| spec.workspace.join(name));
        file.and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, SandboxError> {
        self.record(Call::Create(spec.name.clone()));
        spec.validate()?;
        let behavior = (self.script)(&Self::read_code(spec));
        if let Behavior::FailCreate(err) = behavior {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(id.clone(), behavior);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.record(Call::Start(id.to_string()));
        match self.behavior(id) {
            Behavior::FailStart(err) => Err(err),
            _ => Ok(()),
        }
    }

    async fn wait_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, SandboxError> {
        self.record(Call::Wait(id.to_string()));
        match self.behavior(id) {
            Behavior::Exit { code, .. } => Ok(WaitOutcome::Exited(code)),
            Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                Ok(WaitOutcome::TimedOut)
            }
            Behavior::Stall => std::future::pending().await,
            Behavior::FailWait(err) => Err(err),
            _ => Ok(WaitOutcome::Exited(0)),
        }
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, SandboxError> {
        self.record(Call::Logs(id.to_string()));
        match self.behavior(id) {
            Behavior::Exit { stdout, stderr, .. } => Ok(ContainerLogs {
                stdout,
                stderr,
                truncated: false,
            }),
            Behavior::Hang | Behavior::Stall => Ok(ContainerLogs {
                stdout: "partial\n".to_string(),
                stderr: String::new(),
                truncated: false,
            }),
            Behavior::FailLogs(err) => Err(err),
            _ => Ok(ContainerLogs::default()),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.record(Call::Kill(id.to_string()));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.record(Call::Remove(id.to_string()));
        let mut state = self.state.lock().unwrap();
        if state.remove_failures.contains(id) {
            return Err(SandboxError::RemoveFailed {
                id: id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.containers.remove(id);
        state.managed.retain(|c| c.id != id);
        Ok(())
    }

    async fn list_managed(&self, name_prefix: &str) -> Result<Vec<ManagedContainer>, SandboxError> {
        self.record(Call::List(name_prefix.to_string()));
        Ok(self
            .state
            .lock()
            .unwrap()
            .managed
            .iter()
            .filter(|c| c.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.record(Call::Ping);
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.record(Call::EnsureImage(image.to_string()));
        Ok(())
    }
}
