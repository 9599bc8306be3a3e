//! Bus event catalog and payloads.
//!
//! Event names form a closed catalog namespaced by producer
//! (`task:*`, `agent:*`, `session:*`, `system:*`, `budget:*`, `schedule:*`).
//! Events are in-memory only; persisting them is a subscriber concern.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, CoreError, Priority, SessionId, TaskId, TaskStatus};

/// Name of a bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventName {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskPending,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    TaskReadyForQa,
    TaskQaPassed,
    TaskQaFailed,

    AgentRegistered,
    AgentIdle,
    AgentWorking,
    AgentStuck,
    AgentHeartbeat,
    AgentRateLimited,

    SessionStarted,
    SessionOutput,
    SessionCompleted,
    SessionFailed,
    SessionTimeout,

    SystemStartup,
    SystemShutdown,
    SystemError,
    SystemCpuHigh,
    SystemCpuNormal,
    SystemMemoryHigh,
    SystemMemoryNormal,
    SystemReconciled,

    BudgetWarning,
    BudgetExceeded,
    BudgetReset,

    SchedulePlanningDue,
    ScheduleQaDue,
    ScheduleCleanupDue,
    ScheduleCrownDue,
}

impl EventName {
    /// Every event in the catalog.
    pub const ALL: [EventName; 38] = [
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskDeleted,
        Self::TaskPending,
        Self::TaskAssigned,
        Self::TaskStarted,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskBlocked,
        Self::TaskReadyForQa,
        Self::TaskQaPassed,
        Self::TaskQaFailed,
        Self::AgentRegistered,
        Self::AgentIdle,
        Self::AgentWorking,
        Self::AgentStuck,
        Self::AgentHeartbeat,
        Self::AgentRateLimited,
        Self::SessionStarted,
        Self::SessionOutput,
        Self::SessionCompleted,
        Self::SessionFailed,
        Self::SessionTimeout,
        Self::SystemStartup,
        Self::SystemShutdown,
        Self::SystemError,
        Self::SystemCpuHigh,
        Self::SystemCpuNormal,
        Self::SystemMemoryHigh,
        Self::SystemMemoryNormal,
        Self::SystemReconciled,
        Self::BudgetWarning,
        Self::BudgetExceeded,
        Self::BudgetReset,
        Self::SchedulePlanningDue,
        Self::ScheduleQaDue,
        Self::ScheduleCleanupDue,
        Self::ScheduleCrownDue,
    ];

    /// Wire name, e.g. `task:ready_for_qa`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskDeleted => "task:deleted",
            Self::TaskPending => "task:pending",
            Self::TaskAssigned => "task:assigned",
            Self::TaskStarted => "task:started",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskBlocked => "task:blocked",
            Self::TaskReadyForQa => "task:ready_for_qa",
            Self::TaskQaPassed => "task:qa_passed",
            Self::TaskQaFailed => "task:qa_failed",
            Self::AgentRegistered => "agent:registered",
            Self::AgentIdle => "agent:idle",
            Self::AgentWorking => "agent:working",
            Self::AgentStuck => "agent:stuck",
            Self::AgentHeartbeat => "agent:heartbeat",
            Self::AgentRateLimited => "agent:rate_limited",
            Self::SessionStarted => "session:started",
            Self::SessionOutput => "session:output",
            Self::SessionCompleted => "session:completed",
            Self::SessionFailed => "session:failed",
            Self::SessionTimeout => "session:timeout",
            Self::SystemStartup => "system:startup",
            Self::SystemShutdown => "system:shutdown",
            Self::SystemError => "system:error",
            Self::SystemCpuHigh => "system:cpu_high",
            Self::SystemCpuNormal => "system:cpu_normal",
            Self::SystemMemoryHigh => "system:memory_high",
            Self::SystemMemoryNormal => "system:memory_normal",
            Self::SystemReconciled => "system:reconciled",
            Self::BudgetWarning => "budget:warning",
            Self::BudgetExceeded => "budget:exceeded",
            Self::BudgetReset => "budget:reset",
            Self::SchedulePlanningDue => "schedule:planning_due",
            Self::ScheduleQaDue => "schedule:qa_due",
            Self::ScheduleCleanupDue => "schedule:cleanup_due",
            Self::ScheduleCrownDue => "schedule:crown_due",
        }
    }

    /// Producer namespace (the part before the colon).
    pub fn namespace(&self) -> &'static str {
        let name = self.as_str();
        name.split_once(':').map_or(name, |(ns, _)| ns)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEvent(s.to_string()))
    }
}

/// Repair counts from one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Working agents with no task and a stale heartbeat, reset to idle.
    pub stale_agents_reset: usize,
    /// In-progress tasks without a working agent, sent back to pending.
    pub tasks_requeued: usize,
    /// Agents pointing at a missing or inactive task, reset to idle.
    pub agents_released: usize,
    /// Running sessions closed after repeated misalignment.
    pub sessions_terminated: usize,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.stale_agents_reset + self.tasks_requeued + self.agents_released + self.sessions_terminated
    }
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// A task changed or was otherwise touched.
    Task {
        task_id: TaskId,
        from: Option<TaskStatus>,
        to: Option<TaskStatus>,
        agent_id: Option<AgentId>,
        reason: Option<String>,
    },
    /// A pending task is ready to be scheduled.
    TaskRunnable { task_id: TaskId, priority: Priority },
    /// QA rejected a task.
    QaFailed { task_id: TaskId, failures: Vec<String> },
    Agent {
        agent_id: AgentId,
        task_id: Option<TaskId>,
        heartbeat_age_secs: Option<i64>,
    },
    Session {
        session_id: SessionId,
        task_id: TaskId,
        agent_id: AgentId,
        reason: Option<String>,
    },
    /// Host resource sample crossing a threshold.
    Resource { usage_percent: f32, threshold_percent: f32 },
    Reconciled(ReconcileSummary),
    Schedule { due_at: DateTime<Utc> },
    Message { message: String },
    Empty,
}

impl EventPayload {
    /// Task referenced by the payload, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Task { task_id, .. }
            | Self::TaskRunnable { task_id, .. }
            | Self::QaFailed { task_id, .. }
            | Self::Session { task_id, .. } => Some(task_id),
            Self::Agent { task_id, .. } => task_id.as_ref(),
            _ => None,
        }
    }

    /// Agent referenced by the payload, if any.
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::Agent { agent_id, .. } | Self::Session { agent_id, .. } => Some(agent_id),
            Self::Task { agent_id, .. } => agent_id.as_ref(),
            _ => None,
        }
    }
}

/// A published bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(name: EventName, payload: EventPayload) -> Self {
        Self {
            name,
            payload,
            emitted_at: Utc::now(),
        }
    }
}
