use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use overseer_core::{EventName, EventPayload, Task, TaskId, TaskStatus};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::store::Store;

/// Announces runnable pending tasks with `task:pending`.
///
/// Only runs when at least one agent is idle. Emits at most `batch` tasks per
/// pass (priority, then wave, then age) and re-announces a given task at most
/// once per debounce window.
pub struct PendingTaskScanner {
    state: ScannerState,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    debounce: Duration,
    batch: usize,
    last_emitted: Mutex<HashMap<TaskId, Instant>>,
}

impl PendingTaskScanner {
    pub fn new(config: &Config, store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            state: ScannerState::from_config(&config.scanners.pending_tasks),
            store,
            bus,
            debounce: Duration::from_secs(config.thresholds.pending_debounce_secs),
            batch: config.thresholds.pending_batch,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Tasks currently held in the debounce map.
    pub fn debounced_len(&self) -> usize {
        self.last_emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    async fn dependencies_met(&self, task: &Task) -> Result<bool, ControlPlaneError> {
        for dep in &task.dependencies {
            match self.store.get_task(dep).await? {
                Some(dep_task) if dep_task.status == TaskStatus::Completed => {}
                _ => {
                    debug!(task_id = %task.id, dependency = %dep, "Task waiting on dependency");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Record an emission unless the task was announced within the window.
    fn claim(&self, task_id: &TaskId, now: Instant) -> bool {
        let mut last = self.last_emitted.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = last.get(task_id) {
            if now.duration_since(*at) < self.debounce {
                return false;
            }
        }
        last.insert(task_id.clone(), now);
        true
    }
}

#[async_trait]
impl Scanner for PendingTaskScanner {
    fn name(&self) -> &'static str {
        "pending_tasks"
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        if self.store.get_idle_agents().await?.is_empty() {
            debug!("No idle agents; skipping pending scan");
            return Ok(0);
        }

        let pending = self.store.get_tasks_by_status(TaskStatus::Pending).await?;

        let pending_ids: HashSet<&TaskId> = pending.iter().map(|t| &t.id).collect();
        self.last_emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| pending_ids.contains(id));

        let mut runnable = Vec::with_capacity(pending.len());
        for task in &pending {
            if self.dependencies_met(task).await? {
                runnable.push(task);
            }
        }
        runnable.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| {
                    a.wave_number
                        .unwrap_or(u32::MAX)
                        .cmp(&b.wave_number.unwrap_or(u32::MAX))
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let now = Instant::now();
        let mut emitted = 0;
        for task in runnable {
            if emitted >= self.batch {
                break;
            }
            if !self.claim(&task.id, now) {
                continue;
            }
            self.bus.publish(
                EventName::TaskPending,
                EventPayload::TaskRunnable {
                    task_id: task.id.clone(),
                    priority: task.priority,
                },
            );
            emitted += 1;
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{Agent, Priority};

    use crate::store::InMemoryStore;

    fn collector(bus: &EventBus) -> Arc<Mutex<Vec<TaskId>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventName::TaskPending, move |event| {
            if let Some(id) = event.payload.task_id() {
                sink.lock().unwrap().push(id.clone());
            }
        });
        seen
    }

    async fn setup() -> (Arc<InMemoryStore>, Arc<EventBus>, PendingTaskScanner) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        store.insert_agent(Agent::new("a", "build").with_id("A1")).await;
        let scanner = PendingTaskScanner::new(&Config::default(), store.clone(), bus.clone());
        (store, bus, scanner)
    }

    #[tokio::test]
    async fn test_no_idle_agents_emits_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        store.insert_task(Task::new("FEAT-1", "feature").with_id("T1")).await;
        let scanner = PendingTaskScanner::new(&Config::default(), store, bus.clone());

        assert_eq!(scanner.cycle().await.unwrap(), 0);
        assert_eq!(bus.publish_count(EventName::TaskPending), 0);
    }

    #[tokio::test]
    async fn test_orders_and_limits_batch() {
        let (store, bus, scanner) = setup().await;
        let seen = collector(&bus);
        for i in 0..6 {
            store
                .insert_task(
                    Task::new(format!("FEAT-{i}"), "feature")
                        .with_id(format!("T{i}"))
                        .with_priority(Priority::P2),
                )
                .await;
        }
        store
            .insert_task(Task::new("BUG-1", "bug").with_id("B1").with_priority(Priority::P0))
            .await;
        store
            .insert_task(
                Task::new("FEAT-W", "feature")
                    .with_id("W1")
                    .with_priority(Priority::P2)
                    .with_wave(1),
            )
            .await;

        assert_eq!(scanner.cycle().await.unwrap(), 5);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], TaskId::new("B1"));
        assert_eq!(seen[1], TaskId::new("W1"));
    }

    #[tokio::test]
    async fn test_dependencies_gate_runnable() {
        let (store, bus, scanner) = setup().await;
        let seen = collector(&bus);
        store
            .insert_task(
                Task::new("FEAT-1", "feature")
                    .with_id("T1")
                    .with_status(TaskStatus::InProgress),
            )
            .await;
        store
            .insert_task(Task::new("FEAT-2", "feature").with_id("T2").with_dependency("T1"))
            .await;

        assert_eq!(scanner.cycle().await.unwrap(), 0);

        store
            .update_task(
                &TaskId::new("T1"),
                crate::store::TaskPatch::status(TaskStatus::Completed),
            )
            .await
            .unwrap();
        assert_eq!(scanner.cycle().await.unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![TaskId::new("T2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window() {
        let (store, bus, scanner) = setup().await;
        store.insert_task(Task::new("FEAT-1", "feature").with_id("T1")).await;

        assert_eq!(scanner.cycle().await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(scanner.cycle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(19)).await;
        assert_eq!(scanner.cycle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(scanner.cycle().await.unwrap(), 1);

        assert_eq!(bus.publish_count(EventName::TaskPending), 2);
    }

    #[tokio::test]
    async fn test_debounce_pruned_when_task_leaves_pending() {
        let (store, _bus, scanner) = setup().await;
        store.insert_task(Task::new("FEAT-1", "feature").with_id("T1")).await;

        scanner.cycle().await.unwrap();
        assert_eq!(scanner.debounced_len(), 1);

        store
            .update_task(
                &TaskId::new("T1"),
                crate::store::TaskPatch::status(TaskStatus::Blocked),
            )
            .await
            .unwrap();
        scanner.cycle().await.unwrap();
        assert_eq!(scanner.debounced_len(), 0);
    }
}
