//! Record store seam.
//!
//! The durable store is an external collaborator. The control plane only
//! sees this trait; [`InMemoryStore`] is the reference implementation used
//! by the binary and the tests.

mod memory;

pub use memory::{InMemoryStore, Snapshot};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use overseer_core::{
    Agent, AgentId, AgentStatus, Session, SessionId, SessionStatus, StateHistoryEntry, Task,
    TaskId, TaskStatus,
};

use crate::error::StoreError;

/// Partial task update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the assignment.
    pub assigned_agent_id: Option<Option<AgentId>>,
    pub retry_count: Option<u32>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_assigned_agent(mut self, agent_id: Option<AgentId>) -> Self {
        self.assigned_agent_id = Some(agent_id);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Apply the patch to a task record.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(agent_id) = &self.assigned_agent_id {
            task.assigned_agent_id = agent_id.clone();
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        task.updated_at = Utc::now();
    }
}

/// Read/write access to task, agent, session and history records.
///
/// Reads are eventually consistent snapshots; there is no cross-record
/// transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Apply a patch and return the updated record.
    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError>;

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn update_agent_status(
        &self,
        id: &AgentId,
        status: AgentStatus,
        task_id: Option<TaskId>,
        session_id: Option<SessionId>,
    ) -> Result<(), StoreError>;

    /// Set the agent's heartbeat to now.
    async fn update_heartbeat(&self, id: &AgentId) -> Result<(), StoreError>;

    async fn get_idle_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn get_working_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    async fn create_session(&self, session: Session) -> Result<(), StoreError>;

    async fn get_running_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<(), StoreError>;

    async fn append_history(&self, entry: StateHistoryEntry) -> Result<(), StoreError>;

    /// History for one task, oldest first.
    async fn list_history(&self, task_id: &TaskId) -> Result<Vec<StateHistoryEntry>, StoreError>;
}
