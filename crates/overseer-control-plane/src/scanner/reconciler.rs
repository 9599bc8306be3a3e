//! Drift repair across tasks, agents and sessions.
//!
//! There is no transaction spanning the three record kinds, so every pass
//! reads and then writes one entity at a time and is safe to repeat. A
//! running session that looks orphaned may just be mid-launch, so it is only
//! terminated after it has been misaligned for several consecutive cycles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use overseer_core::{
    AgentId, AgentStatus, EventName, EventPayload, ReconcileSummary, Session, SessionId,
    SessionStatus, TaskStatus,
};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::hysteresis::HysteresisCounter;
use crate::state_machine::TaskStateMachine;
use crate::store::Store;

pub struct Reconciler {
    state: ScannerState,
    store: Arc<dyn Store>,
    state_machine: Arc<TaskStateMachine>,
    bus: Arc<EventBus>,
    stale_after: Duration,
    mismatch_cycles: u32,
    mismatches: Mutex<HysteresisCounter<SessionId>>,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        state_machine: Arc<TaskStateMachine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state: ScannerState::from_config(&config.scanners.reconciler),
            store,
            state_machine,
            bus,
            stale_after: Duration::minutes(config.thresholds.stale_working_minutes),
            mismatch_cycles: config.thresholds.orphan_mismatch_cycles.max(1),
            mismatches: Mutex::new(HysteresisCounter::new()),
        }
    }

    /// Run all four repair passes once.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, ControlPlaneError> {
        let now = Utc::now();
        Ok(ReconcileSummary {
            stale_agents_reset: self.reset_stale_agents(now).await?,
            tasks_requeued: self.requeue_abandoned_tasks().await?,
            agents_released: self.release_misassigned_agents().await?,
            sessions_terminated: self.terminate_orphaned_sessions().await?,
        })
    }

    /// Consecutive misaligned cycles recorded for a session.
    pub fn mismatch_count(&self, session_id: &SessionId) -> u32 {
        self.lock_mismatches().count(session_id)
    }

    fn lock_mismatches(&self) -> std::sync::MutexGuard<'_, HysteresisCounter<SessionId>> {
        self.mismatches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Working agents with no task and a stale heartbeat.
    async fn reset_stale_agents(&self, now: DateTime<Utc>) -> Result<usize, ControlPlaneError> {
        let mut reset = 0;
        for agent in self.store.get_working_agents().await? {
            if agent.current_task_id.is_some() || agent.heartbeat_age(now) <= self.stale_after {
                continue;
            }
            if self
                .release_agent(&agent.id, "working with no task and stale heartbeat")
                .await
            {
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// In-progress tasks whose agent is absent or not working go back to
    /// pending.
    async fn requeue_abandoned_tasks(&self) -> Result<usize, ControlPlaneError> {
        let mut requeued = 0;
        for task in self.store.get_tasks_by_status(TaskStatus::InProgress).await? {
            let reason = match &task.assigned_agent_id {
                None => "in progress with no assigned agent",
                Some(agent_id) => match self.store.get_agent(agent_id).await? {
                    None => "assigned agent no longer exists",
                    Some(agent) if agent.status != AgentStatus::Working => {
                        "assigned agent is not working"
                    }
                    Some(_) => continue,
                },
            };

            match self.state_machine.requeue_task(&task.id, reason).await {
                Ok(_) => requeued += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue task"),
            }
        }
        Ok(requeued)
    }

    /// Agents pointing at a task that is missing or no longer in progress.
    async fn release_misassigned_agents(&self) -> Result<usize, ControlPlaneError> {
        let mut released = 0;
        for agent in self.store.list_agents().await? {
            let Some(task_id) = &agent.current_task_id else {
                continue;
            };
            let reason = match self.store.get_task(task_id).await? {
                None => "current task no longer exists",
                Some(task) if task.status != TaskStatus::InProgress => "current task is not in progress",
                Some(_) => continue,
            };
            if self.release_agent(&agent.id, reason).await {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn terminate_orphaned_sessions(&self) -> Result<usize, ControlPlaneError> {
        let running = self.store.get_running_sessions().await?;

        let mut aligned = Vec::new();
        let mut misaligned = Vec::new();
        for session in running.iter() {
            if self.session_aligned(session).await? {
                aligned.push(session);
            } else {
                misaligned.push(session);
            }
        }

        let due: Vec<&Session> = {
            let mut counter = self.lock_mismatches();
            let present: HashSet<SessionId> = running.iter().map(|s| s.id.clone()).collect();
            counter.prune_absent(&present);
            for session in aligned {
                counter.clear(&session.id);
            }
            let mut due = Vec::new();
            for session in misaligned {
                let count = counter.record_mismatch(&session.id);
                debug!(session_id = %session.id, count, "Session misaligned");
                if count >= self.mismatch_cycles {
                    due.push(session);
                }
            }
            due
        };

        let mut terminated = 0;
        for session in due {
            let result = self
                .store
                .update_session_status(
                    &session.id,
                    SessionStatus::Terminated,
                    Some(Utc::now()),
                    Some("orphaned: task or agent no longer matches session".to_string()),
                )
                .await;
            match result {
                Ok(()) => {
                    self.lock_mismatches().clear(&session.id);
                    warn!(
                        session_id = %session.id,
                        task_id = %session.task_id,
                        agent_id = %session.agent_id,
                        "Orphaned session terminated"
                    );
                    terminated += 1;
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to terminate session"),
            }
        }
        Ok(terminated)
    }

    /// Task in progress, and agent working on exactly this task and session.
    async fn session_aligned(&self, session: &Session) -> Result<bool, ControlPlaneError> {
        let task_aligned = matches!(
            self.store.get_task(&session.task_id).await?,
            Some(task) if task.status == TaskStatus::InProgress
        );
        if !task_aligned {
            return Ok(false);
        }
        Ok(matches!(
            self.store.get_agent(&session.agent_id).await?,
            Some(agent) if agent.status == AgentStatus::Working
                && agent.current_session_id.as_ref() == Some(&session.id)
                && agent.current_task_id.as_ref() == Some(&session.task_id)
        ))
    }

    /// Reset an agent to idle with a fresh heartbeat. Failures are logged.
    async fn release_agent(&self, agent_id: &AgentId, reason: &str) -> bool {
        if let Err(e) = self
            .store
            .update_agent_status(agent_id, AgentStatus::Idle, None, None)
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "Failed to reset agent");
            return false;
        }
        if let Err(e) = self.store.update_heartbeat(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to refresh heartbeat");
        }

        warn!(agent_id = %agent_id, reason, "Agent reset to idle");
        self.bus.publish(
            EventName::AgentIdle,
            EventPayload::Agent {
                agent_id: agent_id.clone(),
                task_id: None,
                heartbeat_age_secs: None,
            },
        );
        true
    }
}

#[async_trait]
impl Scanner for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        let summary = self.reconcile().await?;
        let total = summary.total();
        if total > 0 {
            info!(
                stale_agents_reset = summary.stale_agents_reset,
                tasks_requeued = summary.tasks_requeued,
                agents_released = summary.agents_released,
                sessions_terminated = summary.sessions_terminated,
                "Reconciled state drift"
            );
            self.bus
                .publish(EventName::SystemReconciled, EventPayload::Reconciled(summary));
        }
        Ok(total)
    }
}
