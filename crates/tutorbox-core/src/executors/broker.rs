//! Orchestration of one sandboxed execution, end to end.
//!
//! Each call to [`ExecutionBroker::submit`] walks the states
//! `Created → Starting → Running → (Completed | TimedOut | Failed) → Cleaned`.
//! Admission failures (`PayloadTooLarge`, `Busy`) are returned as errors
//! before any container exists. Past admission every outcome, including
//! engine failures, is reported as an [`ExecutionResult`], and the container
//! is removed through its [`ExecutionHandle`] on every path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use super::handle::ExecutionHandle;
use super::workspace::Workspace;
use super::{ContainerLogs, ContainerRuntime, ContainerSpec, WaitOutcome};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::models::{ExecutionRequest, ExecutionResult, ExecutionState};
use crate::policy::ExecutionPolicy;

/// Per-process settings of the broker, derived from [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub code_file: String,
    pub name_prefix: String,
    pub workspace_root: PathBuf,
    pub max_concurrent: usize,
    pub max_code_bytes: usize,
    pub max_output_bytes: usize,
    pub wait_grace: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            image: config.runtime.image.clone(),
            command: config.runtime.command(),
            working_dir: config.runtime.working_dir.clone(),
            code_file: config.runtime.code_file.clone(),
            name_prefix: config.runtime.name_prefix.clone(),
            workspace_root: config.runtime.workspace_root(),
            max_concurrent: config.broker.max_concurrent,
            max_code_bytes: config.broker.max_code_bytes,
            max_output_bytes: config.broker.max_output_bytes,
            wait_grace: config.broker.wait_grace(),
        }
    }
}

pub struct ExecutionBroker {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<ExecutionPolicy>,
    settings: BrokerSettings,
    slots: Arc<Semaphore>,
}

impl ExecutionBroker {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<ExecutionPolicy>,
        settings: BrokerSettings,
    ) -> Result<Self, SandboxError> {
        policy.validate()?;
        if settings.max_concurrent == 0 {
            return Err(SandboxError::ConfigError(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        let slots = Arc::new(Semaphore::new(settings.max_concurrent));
        Ok(Self {
            runtime,
            policy,
            settings,
            slots,
        })
    }

    pub fn from_config(
        runtime: Arc<dyn ContainerRuntime>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        Self::new(
            runtime,
            Arc::new(config.policy.clone()),
            BrokerSettings::from_config(config),
        )
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Number of executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.settings.max_concurrent - self.slots.available_permits()
    }

    /// Whether the container engine answers.
    pub async fn is_available(&self) -> bool {
        self.runtime.ping().await.is_ok()
    }

    /// Run `request` in a fresh sandbox container.
    ///
    /// Returns `Err` only when the request is not admitted. A full broker
    /// rejects immediately with the retryable [`SandboxError::Busy`].
    pub async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let size = request.code.len();
        if size > self.settings.max_code_bytes {
            return Err(SandboxError::PayloadTooLarge {
                size,
                limit: self.settings.max_code_bytes,
            });
        }

        let _permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            log::warn!(
                "Rejecting execution: {} already in flight",
                self.settings.max_concurrent
            );
            SandboxError::Busy {
                limit: self.settings.max_concurrent,
            }
        })?;

        let result = self.execute(request).await;
        Ok(result.correlate(request))
    }

    /// Run the student code followed by the exercise's test code.
    pub async fn submit_with_tests(
        &self,
        request: &ExecutionRequest,
        test_code: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let combined = ExecutionRequest {
            code: ExecutionRequest::with_tests(&request.code, test_code).code,
            lesson_id: request.lesson_id.clone(),
            exercise_id: request.exercise_id.clone(),
        };
        self.submit(&combined).await
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let name = format!("{}{}", self.settings.name_prefix, Uuid::new_v4());
        let accepted = Instant::now();
        transition(&name, ExecutionState::Created);

        let workspace = match Workspace::prepare(
            &self.settings.workspace_root,
            &self.settings.name_prefix,
            &self.settings.code_file,
            &request.code,
        )
        .await
        {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("{}: could not prepare workspace: {}", name, e);
                transition(&name, ExecutionState::Failed);
                return ExecutionResult::failed(&e, accepted.elapsed());
            }
        };
        let spec = self.build_spec(&name, &workspace, request);

        transition(&name, ExecutionState::Starting);
        let id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("{}: create failed: {}", name, e);
                transition(&name, ExecutionState::Failed);
                return ExecutionResult::failed(&e, accepted.elapsed());
            }
        };
        let mut handle = ExecutionHandle::acquire(self.runtime.clone(), id, name, workspace);

        let (state, result) = self.run(&mut handle).await;
        transition(handle.name(), state);

        let name = handle.name().to_string();
        // Removal failures are logged by the handle and never change the result.
        let _ = handle.release().await;
        transition(&name, ExecutionState::Cleaned);

        result
    }

    async fn run(&self, handle: &mut ExecutionHandle) -> (ExecutionState, ExecutionResult) {
        let clock = Instant::now();
        if let Err(e) = self.runtime.start(handle.id()).await {
            log::error!("{}: start failed: {}", handle.name(), e);
            return (ExecutionState::Failed, ExecutionResult::failed(&e, clock.elapsed()));
        }

        transition(handle.name(), ExecutionState::Running);
        let timeout = self.policy.timeout();
        handle.arm(timeout);

        let bounded_wait = tokio::time::timeout(
            timeout + self.settings.wait_grace,
            self.runtime.wait_with_timeout(handle.id(), timeout),
        );
        let outcome = match bounded_wait.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log::error!("{}: wait failed: {}", handle.name(), e);
                self.kill(handle).await;
                return (ExecutionState::Failed, ExecutionResult::failed(&e, clock.elapsed()));
            }
            Err(_) => {
                log::warn!(
                    "{}: runtime did not report within the grace period, treating as timeout",
                    handle.name()
                );
                WaitOutcome::TimedOut
            }
        };
        let elapsed = clock.elapsed();

        match outcome {
            WaitOutcome::Exited(exit_code) => match self.runtime.logs(handle.id()).await {
                Ok(logs) => {
                    let (stdout, stderr, truncated) = self.cap_output(logs);
                    let mut result = ExecutionResult::exited(stdout, stderr, exit_code, elapsed);
                    result.output_truncated = truncated;
                    log::info!(
                        "{}: exited with code {} in {}ms",
                        handle.name(),
                        exit_code,
                        result.execution_time_ms
                    );
                    (ExecutionState::Completed, result)
                }
                Err(e) => {
                    log::error!("{}: could not collect logs: {}", handle.name(), e);
                    (ExecutionState::Failed, ExecutionResult::failed(&e, elapsed))
                }
            },
            WaitOutcome::TimedOut => {
                self.kill(handle).await;
                let logs = match self.runtime.logs(handle.id()).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        log::warn!("{}: no logs after timeout: {}", handle.name(), e);
                        ContainerLogs::default()
                    }
                };
                let (stdout, stderr, truncated) = self.cap_output(logs);
                let mut result =
                    ExecutionResult::timed_out(stdout, stderr, self.policy.timeout_ms, elapsed);
                result.output_truncated = truncated;
                (ExecutionState::TimedOut, result)
            }
        }
    }

    async fn kill(&self, handle: &ExecutionHandle) {
        if let Err(e) = self.runtime.kill(handle.id()).await {
            log::error!("{}: forced kill failed: {}", handle.name(), e);
        }
    }

    fn build_spec(
        &self,
        name: &str,
        workspace: &Workspace,
        request: &ExecutionRequest,
    ) -> ContainerSpec {
        let mut labels = HashMap::new();
        if let Some(lesson_id) = &request.lesson_id {
            labels.insert("tutorbox.lesson".to_string(), lesson_id.clone());
        }
        if let Some(exercise_id) = &request.exercise_id {
            labels.insert("tutorbox.exercise".to_string(), exercise_id.clone());
        }
        ContainerSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            command: self.settings.command.clone(),
            working_dir: self.settings.working_dir.clone(),
            workspace: workspace.path().to_path_buf(),
            labels,
            policy: self.policy.clone(),
        }
    }

    fn cap_output(&self, logs: ContainerLogs) -> (String, String, bool) {
        let ContainerLogs {
            mut stdout,
            mut stderr,
            truncated,
        } = logs;
        let limit = self.settings.max_output_bytes;
        let cut_stdout = truncate_utf8(&mut stdout, limit);
        let cut_stderr = truncate_utf8(&mut stderr, limit);
        (stdout, stderr, truncated || cut_stdout || cut_stderr)
    }
}

fn transition(name: &str, state: ExecutionState) {
    log::debug!("{}: {}", name, state);
}

/// Cut `text` to at most `limit` bytes on a char boundary.
fn truncate_utf8(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use crate::test_utils::{Behavior, Call, FakeRuntime};

    struct Fixture {
        _root: tempfile::TempDir,
        fake: Arc<FakeRuntime>,
        broker: Arc<ExecutionBroker>,
    }

    fn fixture(fake: FakeRuntime, timeout_ms: u64, max_concurrent: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.policy.timeout_ms = timeout_ms;
        config.runtime.workspace_root = Some(root.path().to_path_buf());
        config.broker.max_concurrent = max_concurrent;
        config.broker.wait_grace_ms = 50;

        let fake = Arc::new(fake);
        let broker = ExecutionBroker::from_config(fake.clone(), &config).unwrap();
        Fixture {
            _root: root,
            fake,
            broker: Arc::new(broker),
        }
    }

    fn exit_with(stdout: &str, stderr: &str, code: i64) -> Behavior {
        Behavior::Exit {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            code,
        }
    }

    #[tokio::test]
    async fn test_successful_run_returns_stdout_exactly() {
        let fx = fixture(FakeRuntime::scripted(|_| exit_with("hi\n", "", 0)), 1000, 4);
        let request = ExecutionRequest::new("print(\"hi\")").lesson("intro").exercise("ex1");

        let result = fx.broker.submit(&request).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output, "hi\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.lesson_id.as_deref(), Some("intro"));
        assert_eq!(result.exercise_id.as_deref(), Some("ex1"));

        let id = fx.fake.created_ids().pop().unwrap();
        assert_eq!(fx.fake.remove_count(&id), 1);
        assert_eq!(fx.fake.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_call_sequence_for_clean_exit() {
        let fx = fixture(FakeRuntime::new(), 1000, 1);
        fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        let calls = fx.fake.calls();
        assert!(matches!(&calls[0], Call::Create(name) if name.starts_with("tutorbox-exec-")));
        assert_eq!(
            &calls[1..],
            &[
                Call::Start("fake-1".into()),
                Call::Wait("fake-1".into()),
                Call::Logs("fake-1".into()),
                Call::Remove("fake-1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_normal_result() {
        let fx = fixture(
            FakeRuntime::scripted(|_| exit_with("", "Traceback: ZeroDivisionError\n", 1)),
            1000,
            4,
        );

        let result = fx.broker.submit(&ExecutionRequest::new("1/0")).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.status, ExecutionStatus::NonZeroExit);
        assert!(result.error.contains("ZeroDivisionError"));
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
    }

    #[tokio::test]
    async fn test_timeout_kills_then_removes() {
        let fx = fixture(FakeRuntime::scripted(|_| Behavior::Hang), 50, 4);

        let result = fx.broker.submit(&ExecutionRequest::new("while True: pass")).await.unwrap();

        assert!(!result.success);
        assert!(result.error.contains("timed out"));
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.output, "partial\n");

        let calls = fx.fake.calls();
        let kill = calls.iter().position(|c| *c == Call::Kill("fake-1".into())).unwrap();
        let logs = calls.iter().position(|c| *c == Call::Logs("fake-1".into())).unwrap();
        let remove = calls.iter().position(|c| *c == Call::Remove("fake-1".into())).unwrap();
        assert!(kill < logs && logs < remove);
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
    }

    #[tokio::test]
    async fn test_stalled_runtime_is_bounded_by_broker() {
        let fx = fixture(FakeRuntime::scripted(|_| Behavior::Stall), 50, 4);

        let started = std::time::Instant::now();
        let result = fx.broker.submit(&ExecutionRequest::new("import time")).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.is_timeout());
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes() {
        let fx = fixture(
            FakeRuntime::scripted(|_| {
                Behavior::FailStart(SandboxError::StartFailed("image missing".into()))
            }),
            1000,
            4,
        );

        let result = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert!(!result.success);
        assert_eq!(
            result.status,
            ExecutionStatus::Failed {
                reason: "start_failed".into()
            }
        );
        assert!(result.error.contains("image missing"));
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
        assert!(!fx.fake.calls().contains(&Call::Wait("fake-1".into())));
    }

    #[tokio::test]
    async fn test_wait_failure_kills_then_removes() {
        let fx = fixture(
            FakeRuntime::scripted(|_| {
                Behavior::FailWait(SandboxError::RuntimeUnavailable("wait stream closed".into()))
            }),
            1000,
            4,
        );

        let result = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert!(!result.success);
        assert_eq!(
            result.status,
            ExecutionStatus::Failed {
                reason: "runtime_unavailable".into()
            }
        );
        assert!(result.error.contains("wait stream closed"));

        let calls = fx.fake.calls();
        let kill = calls.iter().position(|c| *c == Call::Kill("fake-1".into())).unwrap();
        let remove = calls.iter().position(|c| *c == Call::Remove("fake-1".into())).unwrap();
        assert!(kill < remove);
        assert!(!calls.contains(&Call::Logs("fake-1".into())));
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
        assert_eq!(fx.fake.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_has_nothing_to_remove() {
        let fx = fixture(
            FakeRuntime::scripted(|_| {
                Behavior::FailCreate(SandboxError::RuntimeUnavailable("socket closed".into()))
            }),
            1000,
            4,
        );

        let result = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert!(!result.success);
        assert_eq!(
            result.status,
            ExecutionStatus::Failed {
                reason: "runtime_unavailable".into()
            }
        );
        assert!(fx
            .fake
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::Remove(_))));
    }

    #[tokio::test]
    async fn test_logs_failure_is_reported_and_cleaned() {
        let fx = fixture(
            FakeRuntime::scripted(|_| {
                Behavior::FailLogs(SandboxError::RuntimeUnavailable("gone".into()))
            }),
            1000,
            4,
        );

        let result = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert!(!result.success);
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
    }

    #[tokio::test]
    async fn test_remove_failure_does_not_change_result() {
        let fx = fixture(FakeRuntime::scripted(|_| exit_with("ok\n", "", 0)), 1000, 4);
        fx.fake.fail_remove("fake-1");

        let result = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output, "ok\n");
        assert_eq!(fx.fake.remove_count("fake-1"), 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_before_create() {
        let fx = fixture(FakeRuntime::new(), 1000, 4);
        let limit = fx.broker.settings().max_code_bytes;
        let request = ExecutionRequest::new("x".repeat(limit + 1));

        let err = fx.broker.submit(&request).await.unwrap_err();

        assert_eq!(
            err,
            SandboxError::PayloadTooLarge {
                size: limit + 1,
                limit
            }
        );
        assert!(fx.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_busy_when_all_slots_taken() {
        let fx = fixture(FakeRuntime::scripted(|_| Behavior::Hang), 300, 1);

        let broker = fx.broker.clone();
        let first = tokio::spawn(async move {
            broker.submit(&ExecutionRequest::new("while True: pass")).await
        });
        while fx.broker.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Busy { limit: 1 }));
        assert!(err.is_retryable());

        let first = first.await.unwrap().unwrap();
        assert!(first.is_timeout());
        assert_eq!(fx.broker.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_do_not_cross_talk() {
        let fx = fixture(FakeRuntime::new(), 1000, 10);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let broker = fx.broker.clone();
            tasks.push(tokio::spawn(async move {
                let code = format!("print({})", i);
                let result = broker.submit(&ExecutionRequest::new(code.clone())).await.unwrap();
                (code, result)
            }));
        }

        for task in tasks {
            let (code, result) = task.await.unwrap();
            assert!(result.success);
            assert_eq!(result.output, code);
        }

        let created = fx.fake.created_ids();
        assert_eq!(created.len(), 10);
        for id in created {
            assert_eq!(fx.fake.remove_count(&id), 1);
        }
        assert_eq!(fx.fake.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_tests_runs_combined_code() {
        let fx = fixture(FakeRuntime::new(), 1000, 1);
        let request = ExecutionRequest::new("def add(a, b):\n    return a + b").exercise("add");

        let result = fx
            .broker
            .submit_with_tests(&request, "assert add(1, 2) == 3")
            .await
            .unwrap();

        assert_eq!(result.output, "def add(a, b):\n    return a + b\n\nassert add(1, 2) == 3");
        assert_eq!(result.exercise_id.as_deref(), Some("add"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.runtime.workspace_root = Some(root.path().to_path_buf());
        config.broker.max_output_bytes = 4;
        let fake = Arc::new(FakeRuntime::scripted(|_| exit_with("héllo", "", 0)));
        let broker = ExecutionBroker::from_config(fake, &config).unwrap();

        let result = broker.submit(&ExecutionRequest::new("pass")).await.unwrap();

        assert_eq!(result.output, "hél");
        assert!(result.output_truncated);
    }

    #[tokio::test]
    async fn test_workspaces_are_removed_after_run() {
        let fx = fixture(FakeRuntime::new(), 1000, 2);
        fx.broker.submit(&ExecutionRequest::new("pass")).await.unwrap();
        let leftovers = std::fs::read_dir(fx._root.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let mut text = "añb".to_string();
        assert!(truncate_utf8(&mut text, 2));
        assert_eq!(text, "a");

        let mut short = "abc".to_string();
        assert!(!truncate_utf8(&mut short, 3));
        assert_eq!(short, "abc");
    }

    #[test]
    fn test_invalid_policy_is_rejected_at_construction() {
        let policy = ExecutionPolicy {
            timeout_ms: 0,
            ..Default::default()
        };
        let settings = BrokerSettings::from_config(&SandboxConfig::default());
        let result = ExecutionBroker::new(Arc::new(FakeRuntime::new()), Arc::new(policy), settings);
        assert!(matches!(result, Err(SandboxError::PolicyInvalid(_))));
    }
}
