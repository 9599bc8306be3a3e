//! In-memory reference store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use overseer_core::{
    Agent, AgentId, AgentStatus, Session, SessionId, SessionStatus, StateHistoryEntry, Task,
    TaskId, TaskStatus,
};

use super::{Store, TaskPatch};
use crate::error::StoreError;

/// Initial records loaded into an [`InMemoryStore`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub sessions: Vec<Session>,
}

impl Snapshot {
    /// Read a JSON snapshot from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Backend(format!("parsing {}: {e}", path.display())))
    }
}

/// Store backed by process memory. Records are lost on exit.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    history: RwLock<Vec<StateHistoryEntry>>,

    /// Makes `append_history` fail; exercises the best-effort history path.
    fail_history_writes: AtomicBool,
    fail_session_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from a snapshot.
    pub async fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        for task in snapshot.tasks {
            store.insert_task(task).await;
        }
        for agent in snapshot.agents {
            store.insert_agent(agent).await;
        }
        for session in snapshot.sessions {
            store.insert_session(session).await;
        }
        store
    }

    /// Insert or replace a task record.
    pub async fn insert_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    /// Insert or replace an agent record.
    pub async fn insert_agent(&self, agent: Agent) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    /// Insert or replace a session record.
    pub async fn insert_session(&self, session: Session) {
        self.sessions.write().await.insert(session.id.clone(), session);
    }

    /// All tasks, sorted by id.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Every history entry, in append order.
    pub async fn all_history(&self) -> Vec<StateHistoryEntry> {
        self.history.read().await.clone()
    }

    pub fn set_fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `create_session` fail, as a backend outage would.
    pub fn set_fail_session_writes(&self, fail: bool) {
        self.fail_session_writes.store(fail, Ordering::SeqCst);
    }

    async fn agents_with_status(&self, status: AgentStatus) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        // HashMap order is random; keep selection deterministic.
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        patch.apply(task);
        Ok(task.clone())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn update_agent_status(
        &self,
        id: &AgentId,
        status: AgentStatus,
        task_id: Option<TaskId>,
        session_id: Option<SessionId>,
    ) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| StoreError::AgentNotFound(id.clone()))?;
        agent.status = status;
        agent.current_task_id = task_id;
        agent.current_session_id = session_id;
        Ok(())
    }

    async fn update_heartbeat(&self, id: &AgentId) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| StoreError::AgentNotFound(id.clone()))?;
        agent.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn get_idle_agents(&self) -> Result<Vec<Agent>, StoreError> {
        Ok(self.agents_with_status(AgentStatus::Idle).await)
    }

    async fn get_working_agents(&self) -> Result<Vec<Agent>, StoreError> {
        Ok(self.agents_with_status(AgentStatus::Working).await)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn create_session(&self, session: Session) -> Result<(), StoreError> {
        if self.fail_session_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("session sink unavailable".into()));
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(format!("session {}", session.id)));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_running_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        session.status = status;
        if ended_at.is_some() {
            session.ended_at = ended_at;
        }
        if reason.is_some() {
            session.end_reason = reason;
        }
        Ok(())
    }

    async fn append_history(&self, entry: StateHistoryEntry) -> Result<(), StoreError> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("history sink unavailable".into()));
        }
        self.history.write().await.push(entry);
        Ok(())
    }

    async fn list_history(&self, task_id: &TaskId) -> Result<Vec<StateHistoryEntry>, StoreError> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .filter(|e| &e.task_id == task_id)
            .cloned()
            .collect())
    }
}
