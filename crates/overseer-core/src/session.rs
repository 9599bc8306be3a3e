//! Execution session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, SessionId, SessionStatus, TaskId};

/// One execution attempt binding a Task to an Agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub task_id: TaskId,
    pub agent_id: AgentId,

    #[serde(default)]
    pub status: SessionStatus,

    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Why the session ended, when it was closed by someone other than the agent.
    #[serde(default)]
    pub end_reason: Option<String>,
}

impl Session {
    /// Create a new running Session.
    pub fn new(task_id: TaskId, agent_id: AgentId) -> Self {
        Self {
            id: SessionId::generate(),
            task_id,
            agent_id,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}
