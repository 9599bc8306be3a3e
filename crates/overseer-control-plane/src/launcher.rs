//! Agent launcher seam.
//!
//! A launcher only *starts* an agent; the launched process is responsible
//! for driving its task forward. Launch failure is a normal outcome that the
//! scheduler turns into a `failed` transition.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use overseer_core::{
    AgentId, AgentStatus, EventName, EventPayload, Session, SessionId, SessionStatus, TaskId,
    TaskStatus,
};

use crate::bus::EventBus;
use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::state_machine::{TaskStateMachine, TransitionContext};
use crate::store::Store;

/// Parameters for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
}

/// A successful launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Launched {
    pub session_id: SessionId,
}

/// Starts agent processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched, LaunchError>;
}

/// Launcher used when no agent command is configured.
pub struct DisabledLauncher;

#[async_trait]
impl AgentLauncher for DisabledLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched, LaunchError> {
        Err(LaunchError::new(request.task_id, "no agent launcher configured"))
    }
}

/// Runs one OS process per session.
///
/// The task, agent, session id and model are passed through `OVERSEER_*`
/// environment variables. A supervisor task waits for the process, closes
/// the session when it exits, fails a task the process left `in_progress`,
/// and hands the agent back to the scheduler.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    state_machine: Arc<TaskStateMachine>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        let state_machine = Arc::new(TaskStateMachine::new(store.clone(), bus.clone()));
        Self {
            command: command.into(),
            args: Vec::new(),
            store,
            bus,
            state_machine,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Build the launcher described by `config`, falling back to
    /// [`DisabledLauncher`] when no command is set.
    pub fn from_config(
        config: &LauncherConfig,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
    ) -> Arc<dyn AgentLauncher> {
        match &config.command {
            Some(command) => {
                Arc::new(Self::new(command.clone(), store, bus).with_args(config.args.clone()))
            }
            None => Arc::new(DisabledLauncher),
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched, LaunchError> {
        let session = Session::new(request.task_id.clone(), request.agent_id.clone());

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("OVERSEER_TASK_ID", request.task_id.as_str())
            .env("OVERSEER_AGENT_ID", request.agent_id.as_str())
            .env("OVERSEER_SESSION_ID", session.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(model) = &request.model {
            cmd.env("OVERSEER_MODEL", model);
        }

        let mut child = cmd.spawn().map_err(|e| {
            LaunchError::new(
                request.task_id.clone(),
                format!("failed to spawn '{}': {e}", self.command),
            )
        })?;

        if let Err(e) = self.store.create_session(session.clone()).await {
            if let Err(kill_err) = child.start_kill() {
                warn!(session_id = %session.id, error = %kill_err, "Failed to kill unrecorded agent");
            }
            return Err(LaunchError::new(
                request.task_id,
                format!("failed to record session: {e}"),
            ));
        }

        info!(
            task_id = %request.task_id,
            agent_id = %request.agent_id,
            session_id = %session.id,
            pid = ?child.id(),
            "Agent process started"
        );

        // Recorded before the supervisor starts so an early exit cannot be
        // overwritten by the caller recording the same session.
        if let Err(e) = self
            .store
            .update_agent_status(
                &request.agent_id,
                AgentStatus::Working,
                Some(request.task_id.clone()),
                Some(session.id.clone()),
            )
            .await
        {
            warn!(agent_id = %request.agent_id, error = %e, "Failed to record agent session");
        }

        self.bus.publish(EventName::SessionStarted, session_payload(&session, None));

        let session_id = session.id.clone();
        tokio::spawn(supervise(
            child,
            session,
            request.timeout,
            self.store.clone(),
            self.bus.clone(),
            self.state_machine.clone(),
        ));

        Ok(Launched { session_id })
    }
}

async fn supervise(
    mut child: Child,
    session: Session,
    timeout: Option<Duration>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    state_machine: Arc<TaskStateMachine>,
) {
    let exit = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => Some(result),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(session_id = %session.id, error = %e, "Failed to kill timed out agent");
                }
                None
            }
        },
        None => Some(child.wait().await),
    };

    let (status, event, reason) = match exit {
        Some(Ok(code)) if code.success() => (SessionStatus::Completed, EventName::SessionCompleted, None),
        Some(Ok(code)) => (
            SessionStatus::Failed,
            EventName::SessionFailed,
            Some(format!("agent exited with {code}")),
        ),
        Some(Err(e)) => (
            SessionStatus::Failed,
            EventName::SessionFailed,
            Some(format!("waiting for agent failed: {e}")),
        ),
        None => (
            SessionStatus::Failed,
            EventName::SessionTimeout,
            Some("agent timed out".to_string()),
        ),
    };

    // The reconciler may have closed the session already.
    match store.get_session(&session.id).await {
        Ok(Some(current)) if current.is_running() => {}
        Ok(_) => {
            debug!(session_id = %session.id, "Session already closed; skipping exit update");
            return;
        }
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "Failed to read session on exit");
            return;
        }
    }

    if let Err(e) = store
        .update_session_status(&session.id, status, Some(Utc::now()), reason.clone())
        .await
    {
        warn!(session_id = %session.id, error = %e, "Failed to close session");
        return;
    }

    info!(session_id = %session.id, status = %status, reason = ?reason, "Agent process exited");
    bus.publish(event, session_payload(&session, reason.clone()));

    let reason = reason.unwrap_or_else(|| "agent exited without finishing its task".to_string());
    fail_abandoned_task(&session, &reason, store.as_ref(), &state_machine).await;
    release_agent(&session, store.as_ref(), &bus).await;
}

/// Fail the session's task if the process exited while still owning it.
async fn fail_abandoned_task(
    session: &Session,
    reason: &str,
    store: &dyn Store,
    state_machine: &TaskStateMachine,
) {
    let task = match store.get_task(&session.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(e) => {
            warn!(task_id = %session.task_id, error = %e, "Failed to read task on agent exit");
            return;
        }
    };
    if task.status != TaskStatus::InProgress
        || task.assigned_agent_id.as_ref() != Some(&session.agent_id)
    {
        return;
    }

    let ctx = TransitionContext::new()
        .with_reason(reason)
        .with_metadata("session_id", session.id.as_str());
    if let Err(e) = state_machine
        .transition_task(&session.task_id, TaskStatus::Failed, ctx)
        .await
    {
        warn!(task_id = %session.task_id, error = %e, "Failed to fail task after agent exit");
    }
}

/// Return the agent to `idle` if it is still working on the session's task.
async fn release_agent(session: &Session, store: &dyn Store, bus: &EventBus) {
    match store.get_agent(&session.agent_id).await {
        Ok(Some(agent))
            if agent.is_working() && agent.current_task_id.as_ref() == Some(&session.task_id) => {}
        Ok(_) => return,
        Err(e) => {
            warn!(agent_id = %session.agent_id, error = %e, "Failed to read agent on exit");
            return;
        }
    }

    if let Err(e) = store
        .update_agent_status(&session.agent_id, AgentStatus::Idle, None, None)
        .await
    {
        warn!(agent_id = %session.agent_id, error = %e, "Failed to release agent");
        return;
    }
    if let Err(e) = store.update_heartbeat(&session.agent_id).await {
        warn!(agent_id = %session.agent_id, error = %e, "Failed to refresh heartbeat");
    }

    debug!(agent_id = %session.agent_id, "Agent released after process exit");
    bus.publish(
        EventName::AgentIdle,
        EventPayload::Agent {
            agent_id: session.agent_id.clone(),
            task_id: None,
            heartbeat_age_secs: None,
        },
    );
}

fn session_payload(session: &Session, reason: Option<String>) -> EventPayload {
    EventPayload::Session {
        session_id: session.id.clone(),
        task_id: session.task_id.clone(),
        agent_id: session.agent_id.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{Agent, Task};

    use crate::store::InMemoryStore;

    fn request() -> LaunchRequest {
        LaunchRequest {
            task_id: TaskId::new("T1"),
            agent_id: AgentId::new("A1"),
            model: Some("small".into()),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_disabled_launcher_fails() {
        let err = DisabledLauncher.launch(request()).await.unwrap_err();
        assert_eq!(err.task_id, TaskId::new("T1"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let store = Arc::new(InMemoryStore::new());
        let launcher = ProcessLauncher::new(
            "/nonexistent/overseer-agent",
            store.clone(),
            Arc::new(EventBus::new()),
        );

        let err = launcher.launch(request()).await.unwrap_err();
        assert!(err.message.contains("failed to spawn"));
        assert!(store.get_running_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_session_is_launch_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_session_writes(true);
        let bus = Arc::new(EventBus::new());
        let launcher = ProcessLauncher::new("sh", store.clone(), bus.clone())
            .with_args(vec!["-c".into(), "sleep 5".into()]);

        let err = launcher.launch(request()).await.unwrap_err();

        assert!(err.message.contains("failed to record session"));
        assert_eq!(bus.publish_count(EventName::SessionStarted), 0);
    }

    #[tokio::test]
    async fn test_session_closed_on_clean_exit() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let launcher = ProcessLauncher::new("sh", store.clone(), bus.clone())
            .with_args(vec!["-c".into(), "exit 0".into()]);

        let completed = bus.wait_for(EventName::SessionCompleted, Duration::from_secs(5));
        let launched = launcher.launch(request()).await.unwrap();
        completed.await.unwrap();

        let session = store.get_session(&launched.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_session_failed_on_nonzero_exit() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let launcher = ProcessLauncher::new("sh", store.clone(), bus.clone())
            .with_args(vec!["-c".into(), "exit 3".into()]);

        let failed = bus.wait_for(EventName::SessionFailed, Duration::from_secs(5));
        let launched = launcher.launch(request()).await.unwrap();
        let event = failed.await.unwrap();

        assert_eq!(event.payload.task_id(), Some(&TaskId::new("T1")));
        let session = store.get_session(&launched.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_agent_exit_fails_task_and_frees_agent() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        store
            .insert_task(
                Task::new("FEAT-1", "feature")
                    .with_id("T1")
                    .with_status(TaskStatus::InProgress)
                    .with_assigned_agent("A1"),
            )
            .await;
        store
            .insert_agent(Agent::new("builder", "build").with_id("A1").working_on("T1", None))
            .await;
        let launcher = ProcessLauncher::new("sh", store.clone(), bus.clone())
            .with_args(vec!["-c".into(), "exit 3".into()]);

        let idle = bus.wait_for(EventName::AgentIdle, Duration::from_secs(5));
        let launched = launcher.launch(request()).await.unwrap();
        idle.await.unwrap();

        let task = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let history = store.list_history(&TaskId::new("T1")).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.from_status, TaskStatus::InProgress);
        assert!(last.reason.as_deref().unwrap().contains("exited"));
        assert_eq!(
            last.metadata.get("session_id").map(String::as_str),
            Some(launched.session_id.as_str())
        );

        let agent = store.get_agent(&AgentId::new("A1")).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.current_task_id, None);
    }

    #[tokio::test]
    async fn test_agent_exit_leaves_finished_task_alone() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        store
            .insert_task(
                Task::new("FEAT-1", "feature")
                    .with_id("T1")
                    .with_status(TaskStatus::PendingVerification)
                    .with_assigned_agent("A1"),
            )
            .await;
        store
            .insert_agent(Agent::new("builder", "build").with_id("A1").working_on("T1", None))
            .await;
        let launcher = ProcessLauncher::new("sh", store.clone(), bus.clone())
            .with_args(vec!["-c".into(), "exit 0".into()]);

        let idle = bus.wait_for(EventName::AgentIdle, Duration::from_secs(5));
        launcher.launch(request()).await.unwrap();
        idle.await.unwrap();

        let task = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::PendingVerification);
        assert!(store.list_history(&TaskId::new("T1")).await.unwrap().is_empty());
    }
}
