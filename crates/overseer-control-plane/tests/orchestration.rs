//! End-to-end scenarios across scanners, bus, scheduler and state machine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use overseer_control_plane::error::{ControlPlaneError, LaunchError};
use overseer_control_plane::scanner::{
    PendingTaskScanner, Reconciler, ResourceProbe, ResourceSample, ResourceScanner, Scanner,
};
use overseer_control_plane::{
    AgentLauncher, AppState, Config, EventBus, InMemoryStore, LaunchRequest, Launched, Store,
};
use overseer_core::{
    Agent, AgentStatus, EventName, Priority, Session, Task, TaskId, TaskStatus,
};

const WAIT: Duration = Duration::from_secs(5);

/// Launcher that records requests and either opens a session or fails.
struct ScriptedLauncher {
    store: Arc<InMemoryStore>,
    error: Option<String>,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    fn succeeding(store: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            error: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(store: Arc<InMemoryStore>, error: &str) -> Arc<Self> {
        Arc::new(Self {
            store,
            error: Some(error.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched, LaunchError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(error) = &self.error {
            return Err(LaunchError::new(request.task_id, error.clone()));
        }
        let session = Session::new(request.task_id, request.agent_id);
        let session_id = session.id.clone();
        self.store.create_session(session).await.unwrap();
        Ok(Launched { session_id })
    }
}

struct ScriptedProbe(Mutex<VecDeque<ResourceSample>>);

#[async_trait]
impl ResourceProbe for ScriptedProbe {
    async fn sample(&self) -> Result<ResourceSample, ControlPlaneError> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ControlPlaneError::Probe("no samples left".into()))
    }
}

async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert_task(
            Task::new("FEAT-1", "feature")
                .with_id("T1")
                .with_priority(Priority::P0),
        )
        .await;
    store.insert_agent(Agent::new("builder", "build").with_id("A1")).await;
    store
}

fn wire(store: Arc<InMemoryStore>, launcher: Arc<ScriptedLauncher>) -> Arc<AppState> {
    let state = AppState::with_launcher(
        Config::default(),
        store,
        Arc::new(EventBus::new()),
        launcher,
    );
    state.attach();
    state
}

#[tokio::test]
async fn pending_task_is_launched_on_idle_agent() {
    let store = seeded_store().await;
    let launcher = ScriptedLauncher::succeeding(store.clone());
    let state = wire(store.clone(), launcher.clone());
    let scanner = PendingTaskScanner::new(&state.config, state.store.clone(), state.bus.clone());

    let working = state.bus.wait_for(EventName::AgentWorking, WAIT);
    scanner.scan().await.unwrap();
    working.await.unwrap();

    let t1 = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::InProgress);
    assert_eq!(t1.assigned_agent_id.as_ref().map(|a| a.as_str()), Some("A1"));

    let history = store.list_history(&TaskId::new("T1")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_status, TaskStatus::Pending);
    assert_eq!(history[0].to_status, TaskStatus::InProgress);

    let a1 = store.get_agent(&"A1".into()).await.unwrap().unwrap();
    assert_eq!(a1.status, AgentStatus::Working);
    assert!(a1.current_session_id.is_some());
    assert_eq!(launcher.launches(), 1);
    assert_eq!(state.scheduler.queue_len(), 0);
}

#[tokio::test]
async fn launch_failure_marks_task_failed() {
    let store = seeded_store().await;
    let launcher = ScriptedLauncher::failing(store.clone(), "x");
    let state = wire(store.clone(), launcher.clone());
    let scanner = PendingTaskScanner::new(&state.config, state.store.clone(), state.bus.clone());

    let failed = state.bus.wait_for(EventName::TaskFailed, WAIT);
    scanner.scan().await.unwrap();
    failed.await.unwrap();

    let t1 = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);

    let history = store.list_history(&TaskId::new("T1")).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.from_status, TaskStatus::InProgress);
    assert_eq!(last.to_status, TaskStatus::Failed);
    assert_eq!(last.reason.as_deref(), Some("x"));

    assert!(state.scheduler.queued_task_ids().is_empty());
    let a1 = store.get_agent(&"A1".into()).await.unwrap().unwrap();
    assert_eq!(a1.status, AgentStatus::Idle);
}

#[tokio::test]
async fn crashed_agent_task_is_requeued_and_relaunched() {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert_task(
            Task::new("FEAT-1", "feature")
                .with_id("T1")
                .with_status(TaskStatus::InProgress)
                .with_assigned_agent("A1"),
        )
        .await;
    // The agent died without reporting; it is idle again.
    store.insert_agent(Agent::new("builder", "build").with_id("A1")).await;

    let launcher = ScriptedLauncher::succeeding(store.clone());
    let state = wire(store.clone(), launcher.clone());
    let reconciler = Reconciler::new(
        &state.config,
        state.store.clone(),
        state.state_machine.clone(),
        state.bus.clone(),
    );

    // Requeueing publishes task:pending, which the scheduler picks up directly.
    let working = state.bus.wait_for(EventName::AgentWorking, WAIT);
    assert_eq!(reconciler.cycle().await.unwrap(), 1);
    working.await.unwrap();

    let history = store.list_history(&TaskId::new("T1")).await.unwrap();
    assert_eq!(history[0].from_status, TaskStatus::InProgress);
    assert_eq!(history[0].to_status, TaskStatus::Pending);

    let t1 = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::InProgress);
    assert_eq!(launcher.launches(), 1);

    // Everything is consistent now.
    assert_eq!(reconciler.reconcile().await.unwrap().total(), 0);
}

#[tokio::test]
async fn memory_pressure_holds_launches() {
    let store = seeded_store().await;
    let launcher = ScriptedLauncher::succeeding(store.clone());
    let state = wire(store.clone(), launcher.clone());

    let probe = Arc::new(ScriptedProbe(Mutex::new(
        [(10.0, 95.0), (10.0, 40.0)]
            .into_iter()
            .map(|(cpu_percent, memory_percent)| ResourceSample {
                cpu_percent,
                memory_percent,
            })
            .collect(),
    )));
    let resources = ResourceScanner::new(&state.config, probe, state.bus.clone());
    let pending = PendingTaskScanner::new(&state.config, state.store.clone(), state.bus.clone());

    assert_eq!(resources.cycle().await.unwrap(), 1);
    for _ in 0..50 {
        if !state.scheduler.admission().memory_ok {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!state.scheduler.admission().memory_ok);

    pending.cycle().await.unwrap();
    for _ in 0..50 {
        if state.scheduler.queue_len() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(state.scheduler.queue_len(), 1);
    assert_eq!(launcher.launches(), 0);

    let working = state.bus.wait_for(EventName::AgentWorking, WAIT);
    assert_eq!(resources.cycle().await.unwrap(), 1);
    working.await.unwrap();

    assert_eq!(launcher.launches(), 1);
    assert_eq!(state.scheduler.queue_len(), 0);
}

#[tokio::test]
async fn exited_agent_process_fails_task_and_frees_agent() {
    let store = seeded_store().await;
    let mut config = Config::default();
    config.launcher.command = Some("sh".to_string());
    config.launcher.args = vec!["-c".to_string(), "exit 3".to_string()];
    let state = AppState::new(config, store.clone());
    state.attach();
    let scanner = PendingTaskScanner::new(&state.config, state.store.clone(), state.bus.clone());
    let reconciler = Reconciler::new(
        &state.config,
        state.store.clone(),
        state.state_machine.clone(),
        state.bus.clone(),
    );

    let idle = state.bus.wait_for(EventName::AgentIdle, WAIT);
    scanner.scan().await.unwrap();
    idle.await.unwrap();

    let t1 = store.get_task(&TaskId::new("T1")).await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    let a1 = store.get_agent(&"A1".into()).await.unwrap().unwrap();
    assert_eq!(a1.status, AgentStatus::Idle);
    assert!(store.get_running_sessions().await.unwrap().is_empty());

    assert_eq!(reconciler.reconcile().await.unwrap().total(), 0);
}
