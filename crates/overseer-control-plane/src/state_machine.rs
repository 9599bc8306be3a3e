//! Task lifecycle state machine.
//!
//! The only component that writes task status. Every transition is checked
//! against the adjacency table, written to the store, recorded in history
//! (best effort) and then announced on the bus. The store write always
//! happens before any publish, so subscribers re-reading the store see the
//! new state.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use overseer_core::history::SYSTEM_ACTOR;
use overseer_core::{
    is_valid_transition, ActorType, AgentId, EventName, EventPayload, StateHistoryEntry, Task,
    TaskId, TaskStatus,
};

use crate::bus::EventBus;
use crate::error::TransitionError;
use crate::store::{Store, TaskPatch};

/// Caller-supplied details for a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Agent taking (or holding) the task. Recorded as the assignee.
    pub agent_id: Option<AgentId>,
    /// Actor recorded in history when no agent is given (defaults to `system`).
    pub actor: Option<(String, ActorType)>,
    pub reason: Option<String>,
    /// QA failures, carried by `task:qa_failed`.
    pub failures: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.actor = Some((user.into(), ActorType::User));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_failures(mut self, failures: Vec<String>) -> Self {
        self.failures = failures;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn actor(&self) -> (String, ActorType) {
        if let Some(agent_id) = &self.agent_id {
            return (agent_id.to_string(), ActorType::Agent);
        }
        self.actor
            .clone()
            .unwrap_or_else(|| (SYSTEM_ACTOR.to_string(), ActorType::System))
    }
}

/// A completed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub task: Task,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Validates and applies task status transitions.
pub struct TaskStateMachine {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Move a task to `to`.
    ///
    /// Rejections (`NotFound`, `Invalid`) leave the task, its history and the
    /// bus untouched.
    pub async fn transition_task(
        &self,
        task_id: &TaskId,
        to: TaskStatus,
        ctx: TransitionContext,
    ) -> Result<TaskTransition, TransitionError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(task_id.clone()))?;
        let from = task.status;

        if !is_valid_transition(from, to) {
            warn!(task_id = %task_id, from = %from, to = %to, "Rejected invalid transition");
            return Err(TransitionError::Invalid {
                task_id: task_id.clone(),
                from,
                to,
            });
        }

        let mut patch = TaskPatch::status(to);
        if let Some(agent_id) = &ctx.agent_id {
            patch = patch.with_assigned_agent(Some(agent_id.clone()));
        }
        if from == TaskStatus::Failed && to == TaskStatus::Pending {
            patch = patch.with_retry_count(task.retry_count + 1);
        }

        let task = self.store.update_task(task_id, patch).await?;
        self.record_history(&task, from, to, &ctx).await;

        info!(
            task_id = %task_id,
            display_id = %task.display_id,
            from = %from,
            to = %to,
            agent_id = ?ctx.agent_id,
            "Task transitioned"
        );

        self.publish_transition(&task, from, to, &ctx);

        Ok(TaskTransition { task, from, to })
    }

    /// Return an `in_progress` task to `pending` and clear its assignment.
    ///
    /// This recovery move is outside the adjacency table and is reserved for
    /// the reconciler, which uses it when the task's agent is gone or idle.
    /// Tasks in any other status are rejected with `Invalid`.
    pub async fn requeue_task(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<TaskTransition, TransitionError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(task_id.clone()))?;
        let from = task.status;
        let to = TaskStatus::Pending;

        if from != TaskStatus::InProgress {
            return Err(TransitionError::Invalid {
                task_id: task_id.clone(),
                from,
                to,
            });
        }

        let previous_agent = task.assigned_agent_id.clone();
        let task = self
            .store
            .update_task(task_id, TaskPatch::status(to).with_assigned_agent(None))
            .await?;

        let mut ctx = TransitionContext::new().with_reason(reason);
        if let Some(agent_id) = &previous_agent {
            ctx = ctx.with_metadata("previous_agent_id", agent_id.as_str());
        }
        self.record_history(&task, from, to, &ctx).await;

        warn!(
            task_id = %task_id,
            previous_agent = ?previous_agent,
            reason = ?ctx.reason,
            "Task requeued by recovery"
        );

        self.bus.publish(
            EventName::TaskUpdated,
            EventPayload::Task {
                task_id: task_id.clone(),
                from: Some(from),
                to: Some(to),
                agent_id: previous_agent,
                reason: ctx.reason.clone(),
            },
        );
        self.bus.publish(
            EventName::TaskPending,
            EventPayload::TaskRunnable {
                task_id: task_id.clone(),
                priority: task.priority,
            },
        );

        Ok(TaskTransition { task, from, to })
    }

    async fn record_history(
        &self,
        task: &Task,
        from: TaskStatus,
        to: TaskStatus,
        ctx: &TransitionContext,
    ) {
        let (actor, actor_type) = ctx.actor();
        let mut metadata = ctx.metadata.clone();
        if !ctx.failures.is_empty() {
            metadata.insert("failures".to_string(), ctx.failures.join("; "));
        }
        let entry = StateHistoryEntry::new(task.id.clone(), from, to, actor, actor_type)
            .with_reason(ctx.reason.clone())
            .with_metadata(metadata);

        if let Err(e) = self.store.append_history(entry).await {
            warn!(
                task_id = %task.id,
                from = %from,
                to = %to,
                error = %e,
                "Failed to append state history"
            );
        }
    }

    fn publish_transition(
        &self,
        task: &Task,
        from: TaskStatus,
        to: TaskStatus,
        ctx: &TransitionContext,
    ) {
        let task_payload = || EventPayload::Task {
            task_id: task.id.clone(),
            from: Some(from),
            to: Some(to),
            agent_id: task.assigned_agent_id.clone(),
            reason: ctx.reason.clone(),
        };

        self.bus.publish(EventName::TaskUpdated, task_payload());

        match to {
            TaskStatus::InProgress => {
                if ctx.agent_id.is_some() {
                    self.bus.publish(EventName::TaskAssigned, task_payload());
                }
                self.bus.publish(EventName::TaskStarted, task_payload());
            }
            TaskStatus::PendingVerification => {
                self.bus.publish(EventName::TaskReadyForQa, task_payload());
            }
            TaskStatus::Completed => {
                self.bus.publish(EventName::TaskCompleted, task_payload());
                if from == TaskStatus::PendingVerification {
                    self.bus.publish(EventName::TaskQaPassed, task_payload());
                }
            }
            TaskStatus::Failed => {
                self.bus.publish(EventName::TaskFailed, task_payload());
                if from == TaskStatus::PendingVerification {
                    self.bus.publish(
                        EventName::TaskQaFailed,
                        EventPayload::QaFailed {
                            task_id: task.id.clone(),
                            failures: ctx.failures.clone(),
                        },
                    );
                }
            }
            TaskStatus::Blocked => {
                self.bus.publish(EventName::TaskBlocked, task_payload());
            }
            TaskStatus::Pending => {
                self.bus.publish(
                    EventName::TaskPending,
                    EventPayload::TaskRunnable {
                        task_id: task.id.clone(),
                        priority: task.priority,
                    },
                );
            }
        }
    }
}
