//! Spawn scheduler - matches runnable tasks to idle agents.
//!
//! Requests are kept in a priority queue (FIFO within equal priority) and
//! drained one at a time. Draining is serialized: a drain request that
//! arrives while another drain is running is folded into it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use overseer_core::{
    preferred_agent_type, Agent, AgentId, AgentStatus, EventName, EventPayload, Priority,
    SessionId, Task, TaskId, TaskStatus,
};

use crate::bus::{EventBus, SubscriptionId};
use crate::config::Config;
use crate::launcher::{AgentLauncher, LaunchRequest};
use crate::state_machine::{TaskStateMachine, TransitionContext};
use crate::store::Store;

/// A queued request to launch an agent for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    /// Spawn weight; higher runs first.
    pub priority: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Admission gates. All must be open for a drain to launch anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Enabled,
    Cpu,
    Memory,
    Budget,
}

/// Snapshot of the admission gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub enabled: bool,
    pub cpu_ok: bool,
    pub memory_ok: bool,
    pub budget_ok: bool,
}

impl Admission {
    pub fn is_open(&self) -> bool {
        self.enabled && self.cpu_ok && self.memory_ok && self.budget_ok
    }
}

/// Bus events that flip a gate, and the state they flip it to.
const GATE_EVENTS: [(EventName, Gate, bool); 6] = [
    (EventName::SystemCpuHigh, Gate::Cpu, false),
    (EventName::SystemCpuNormal, Gate::Cpu, true),
    (EventName::SystemMemoryHigh, Gate::Memory, false),
    (EventName::SystemMemoryNormal, Gate::Memory, true),
    (EventName::BudgetExceeded, Gate::Budget, false),
    (EventName::BudgetReset, Gate::Budget, true),
];

/// Choose an idle agent for a task category.
///
/// Preference: matching type, then any `build` agent, then any idle agent.
pub fn choose_agent<'a>(idle: &'a [Agent], category: &str) -> Option<&'a Agent> {
    let preferred = preferred_agent_type(category);
    idle.iter()
        .find(|a| a.agent_type == preferred)
        .or_else(|| idle.iter().find(|a| a.agent_type == "build"))
        .or_else(|| idle.first())
}

/// Priority spawn scheduler with admission control.
pub struct SpawnScheduler {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    state_machine: Arc<TaskStateMachine>,
    launcher: Arc<dyn AgentLauncher>,

    max_concurrent: usize,
    model: Option<String>,
    launch_timeout: Option<Duration>,

    queue: Mutex<VecDeque<SpawnRequest>>,

    enabled: AtomicBool,
    cpu_ok: AtomicBool,
    memory_ok: AtomicBool,
    budget_ok: AtomicBool,

    draining: AtomicBool,
    rerun_requested: AtomicBool,
}

impl SpawnScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        state_machine: Arc<TaskStateMachine>,
        launcher: Arc<dyn AgentLauncher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            bus,
            state_machine,
            launcher,
            max_concurrent: config.max_concurrent,
            model: config.launcher.model.clone(),
            launch_timeout: config.launcher.timeout(),
            queue: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
            cpu_ok: AtomicBool::new(true),
            memory_ok: AtomicBool::new(true),
            budget_ok: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
        }
    }

    /// Subscribe to runnable-task, idle-agent and admission events.
    ///
    /// Handlers hold a weak reference and run the scheduler on the current
    /// tokio runtime, so publishing never waits on a drain.
    pub fn attach(self: &Arc<Self>) -> Vec<SubscriptionId> {
        let mut ids = Vec::with_capacity(GATE_EVENTS.len() + 2);

        let weak = Arc::downgrade(self);
        ids.push(self.bus.subscribe(EventName::TaskPending, move |event| {
            let Some(task_id) = event.payload.task_id().cloned() else {
                return;
            };
            spawn_on(&weak, move |scheduler| async move {
                scheduler.consider_task(&task_id).await;
            });
        }));

        let weak = Arc::downgrade(self);
        ids.push(self.bus.subscribe(EventName::AgentIdle, move |_| {
            spawn_on(&weak, |scheduler| async move {
                scheduler.process_queue().await;
            });
        }));

        for (name, gate, open) in GATE_EVENTS {
            let weak = Arc::downgrade(self);
            ids.push(self.bus.subscribe(name, move |_| {
                spawn_on(&weak, move |scheduler| async move {
                    scheduler.set_gate(gate, open).await;
                });
            }));
        }

        ids
    }

    /// Queue a pending task for launch and attempt a drain.
    ///
    /// Returns true if the task was added to the queue. Tasks that are not
    /// pending, or already queued, are ignored.
    pub async fn consider_task(&self, task_id: &TaskId) -> bool {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, "Ignoring spawn request for unknown task");
                return false;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to load task for spawn request");
                return false;
            }
        };

        if task.status != TaskStatus::Pending {
            debug!(task_id = %task_id, status = %task.status, "Ignoring spawn request for non-pending task");
            return false;
        }

        let enqueued = self.enqueue(&task.id, task.priority);
        if enqueued {
            debug!(task_id = %task_id, priority = %task.priority, "Task queued for spawn");
        }
        self.process_queue().await;
        enqueued
    }

    /// Drain the queue until one agent launches, the queue empties, a gate
    /// closes, capacity runs out, or no idle agent is available. Failed
    /// launches do not end the drain.
    pub async fn process_queue(&self) {
        // Set before checking `draining` so an active drain cannot miss it.
        self.rerun_requested.store(true, Ordering::SeqCst);
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            {
                let _guard = DrainGuard(&self.draining);
                self.rerun_requested.store(false, Ordering::SeqCst);
                self.drain().await;
            }
            if !self.rerun_requested.load(Ordering::SeqCst)
                || self.draining.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
    }

    /// Open or close a gate. Opening a gate triggers a drain.
    pub async fn set_gate(&self, gate: Gate, open: bool) {
        let flag = match gate {
            Gate::Enabled => &self.enabled,
            Gate::Cpu => &self.cpu_ok,
            Gate::Memory => &self.memory_ok,
            Gate::Budget => &self.budget_ok,
        };
        let was_open = flag.swap(open, Ordering::SeqCst);
        if was_open != open {
            info!(gate = ?gate, open, "Spawn admission gate changed");
        }
        if open {
            self.process_queue().await;
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.set_gate(Gate::Enabled, enabled).await;
    }

    pub async fn set_cpu_ok(&self, ok: bool) {
        self.set_gate(Gate::Cpu, ok).await;
    }

    pub async fn set_memory_ok(&self, ok: bool) {
        self.set_gate(Gate::Memory, ok).await;
    }

    pub async fn set_budget_ok(&self, ok: bool) {
        self.set_gate(Gate::Budget, ok).await;
    }

    pub fn admission(&self) -> Admission {
        Admission {
            enabled: self.enabled.load(Ordering::SeqCst),
            cpu_ok: self.cpu_ok.load(Ordering::SeqCst),
            memory_ok: self.memory_ok.load(Ordering::SeqCst),
            budget_ok: self.budget_ok.load(Ordering::SeqCst),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Queued task ids, in drain order.
    pub fn queued_task_ids(&self) -> Vec<TaskId> {
        self.lock_queue().iter().map(|r| r.task_id.clone()).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<SpawnRequest>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, task_id: &TaskId, priority: Priority) -> bool {
        let mut queue = self.lock_queue();
        if queue.iter().any(|r| &r.task_id == task_id) {
            return false;
        }
        queue.push_back(SpawnRequest {
            task_id: task_id.clone(),
            priority: priority.spawn_weight(),
            enqueued_at: Utc::now(),
        });
        // Stable: equal priorities keep arrival order.
        queue
            .make_contiguous()
            .sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    fn peek(&self) -> Option<SpawnRequest> {
        self.lock_queue().front().cloned()
    }

    fn remove(&self, task_id: &TaskId) {
        self.lock_queue().retain(|r| &r.task_id != task_id);
    }

    async fn drain(&self) {
        loop {
            let admission = self.admission();
            if !admission.is_open() {
                debug!(?admission, "Spawn admission closed");
                return;
            }

            let Some(head) = self.peek() else {
                return;
            };

            match self.store.get_working_agents().await {
                Ok(working) if working.len() >= self.max_concurrent => {
                    debug!(
                        working = working.len(),
                        max_concurrent = self.max_concurrent,
                        "Concurrency limit reached"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to count working agents");
                    return;
                }
            }

            let task = match self.store.get_task(&head.task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Pending => task,
                Ok(_) => {
                    debug!(task_id = %head.task_id, "Dropping spawn request for task no longer pending");
                    self.remove(&head.task_id);
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %head.task_id, error = %e, "Failed to load queued task");
                    return;
                }
            };

            let agent = match self.store.get_idle_agents().await {
                Ok(idle) => choose_agent(&idle, &task.category).cloned(),
                Err(e) => {
                    warn!(error = %e, "Failed to list idle agents");
                    return;
                }
            };
            let Some(agent) = agent else {
                debug!(task_id = %task.id, "No idle agent available");
                return;
            };

            self.remove(&task.id);
            if self.dispatch(task, agent).await {
                return;
            }
        }
    }

    /// Returns true once an agent process is running for the task.
    async fn dispatch(&self, task: Task, agent: Agent) -> bool {
        // Heartbeat first so the stuck-agent scanner cannot flag the agent
        // before its process reports in.
        if let Err(e) = self.store.update_heartbeat(&agent.id).await {
            warn!(agent_id = %agent.id, error = %e, "Failed to refresh agent heartbeat");
        }

        if let Err(e) = self
            .state_machine
            .transition_task(
                &task.id,
                TaskStatus::InProgress,
                TransitionContext::new().with_agent(agent.id.clone()),
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "Dropping spawn request");
            return false;
        }

        if let Err(e) = self
            .store
            .update_agent_status(&agent.id, AgentStatus::Working, Some(task.id.clone()), None)
            .await
        {
            warn!(agent_id = %agent.id, error = %e, "Failed to mark agent working");
        }

        let request = LaunchRequest {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            model: self.model.clone(),
            timeout: self.launch_timeout,
        };

        match self.launcher.launch(request).await {
            Ok(launched) => {
                self.record_session(&agent.id, &task.id, &launched.session_id).await;

                info!(
                    task_id = %task.id,
                    display_id = %task.display_id,
                    agent_id = %agent.id,
                    session_id = %launched.session_id,
                    "Agent launched"
                );

                self.bus.publish(
                    EventName::AgentWorking,
                    EventPayload::Agent {
                        agent_id: agent.id.clone(),
                        task_id: Some(task.id.clone()),
                        heartbeat_age_secs: None,
                    },
                );
                true
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    error = %e.message,
                    "Agent launch failed"
                );

                if let Err(e) = self
                    .store
                    .update_agent_status(&agent.id, AgentStatus::Idle, None, None)
                    .await
                {
                    warn!(agent_id = %agent.id, error = %e, "Failed to release agent");
                }

                if let Err(err) = self
                    .state_machine
                    .transition_task(
                        &task.id,
                        TaskStatus::Failed,
                        TransitionContext::new()
                            .with_reason(e.message.clone())
                            .with_metadata("agent_id", agent.id.as_str()),
                    )
                    .await
                {
                    warn!(task_id = %task.id, error = %err, "Failed to mark task failed after launch error");
                }
                false
            }
        }
    }

    /// Record the session on the agent unless the launcher already did, or
    /// the agent has moved on (its process may exit before we get here).
    async fn record_session(&self, agent_id: &AgentId, task_id: &TaskId, session_id: &SessionId) {
        match self.store.get_agent(agent_id).await {
            Ok(Some(agent))
                if agent.is_working()
                    && agent.current_task_id.as_ref() == Some(task_id)
                    && agent.current_session_id.is_none() => {}
            Ok(_) => return,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to read agent after launch");
                return;
            }
        }
        if let Err(e) = self
            .store
            .update_agent_status(
                agent_id,
                AgentStatus::Working,
                Some(task_id.clone()),
                Some(session_id.clone()),
            )
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "Failed to record agent session");
        }
    }
}

/// Clears the draining flag when a drain pass ends, even by panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn spawn_on<F, Fut>(scheduler: &Weak<SpawnScheduler>, f: F)
where
    F: FnOnce(Arc<SpawnScheduler>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(scheduler) = scheduler.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(f(scheduler));
        }
        Err(_) => warn!("No tokio runtime available; dropping scheduler event"),
    }
}
