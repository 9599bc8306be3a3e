//! Task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, Priority, TaskId, TaskStatus};

/// A Task is a schedulable unit of work with an explicit lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Short human-readable id (e.g. `FEAT-012`).
    pub display_id: String,

    /// One-line description.
    #[serde(default)]
    pub title: String,

    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub priority: Priority,

    /// Free-form category (`feature`, `bug`, `spec`, `research`, ...).
    #[serde(default)]
    pub category: String,

    /// Agent currently responsible for the task.
    #[serde(default)]
    pub assigned_agent_id: Option<AgentId>,

    /// Number of times the task was sent back to `pending` after failing.
    #[serde(default)]
    pub retry_count: u32,

    /// Batch number for parallel execution; lower waves run first.
    #[serde(default)]
    pub wave_number: Option<u32>,

    /// Ordered acceptance criteria checked during QA.
    #[serde(default)]
    pub pass_criteria: Vec<String>,

    /// Tasks that must be `completed` before this one is runnable.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(display_id: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            display_id: display_id.into(),
            title: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            category: category.into(),
            assigned_agent_id: None,
            retry_count: 0,
            wave_number: None,
            pass_criteria: Vec::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_assigned_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.assigned_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_wave(mut self, wave: u32) -> Self {
        self.wave_number = Some(wave);
        self
    }

    /// Builder method to add a pass criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.pass_criteria.push(criterion.into());
        self
    }

    /// Builder method to add a dependency.
    pub fn with_dependency(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
