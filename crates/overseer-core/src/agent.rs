//! Agent slot records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, AgentStatus, SessionId, TaskId};

/// A worker slot. Not necessarily backed by a live process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier.
    pub id: AgentId,

    /// Display name.
    pub name: String,

    /// Specialisation (`build`, `spec`, `validation`, `research`, `system`, ...).
    pub agent_type: String,

    #[serde(default)]
    pub status: AgentStatus,

    #[serde(default)]
    pub current_task_id: Option<TaskId>,

    #[serde(default)]
    pub current_session_id: Option<SessionId>,

    /// Last time the agent (or the control plane on its behalf) reported in.
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Create a new idle Agent.
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: AgentId::generate(),
            name: name.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Idle,
            current_task_id: None,
            current_session_id: None,
            last_heartbeat: Utc::now(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to put the agent on a task.
    pub fn working_on(mut self, task_id: impl Into<TaskId>, session_id: Option<SessionId>) -> Self {
        self.status = AgentStatus::Working;
        self.current_task_id = Some(task_id.into());
        self.current_session_id = session_id;
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn is_working(&self) -> bool {
        self.status == AgentStatus::Working
    }

    /// Time since the last heartbeat, measured against `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
    }
}
