use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use overseer_core::{EventName, EventPayload, TaskStatus};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::store::Store;

/// Re-announces tasks waiting for verification with `task:ready_for_qa`.
pub struct QaScanner {
    state: ScannerState,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    batch: usize,
}

impl QaScanner {
    pub fn new(config: &Config, store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            state: ScannerState::from_config(&config.scanners.qa_verification),
            store,
            bus,
            batch: config.thresholds.qa_batch,
        }
    }
}

#[async_trait]
impl Scanner for QaScanner {
    fn name(&self) -> &'static str {
        "qa_verification"
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        let waiting = self
            .store
            .get_tasks_by_status(TaskStatus::PendingVerification)
            .await?;
        debug!(waiting = waiting.len(), "Tasks awaiting verification");

        let mut emitted = 0;
        for task in waiting.into_iter().take(self.batch) {
            self.bus.publish(
                EventName::TaskReadyForQa,
                EventPayload::Task {
                    task_id: task.id,
                    from: None,
                    to: Some(TaskStatus::PendingVerification),
                    agent_id: task.assigned_agent_id,
                    reason: None,
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
    use overseer_core::Task;

    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_emits_at_most_batch() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        for i in 0..5 {
            store
                .insert_task(
                    Task::new(format!("FEAT-{i}"), "feature")
                        .with_id(format!("T{i}"))
                        .with_status(TaskStatus::PendingVerification),
                )
                .await;
        }
        store.insert_task(Task::new("FEAT-P", "feature").with_id("P")).await;

        let scanner = QaScanner::new(&Config::default(), store, bus.clone());

        assert_eq!(scanner.cycle().await.unwrap(), 3);
        assert_eq!(bus.publish_count(EventName::TaskReadyForQa), 3);
    }

    #[tokio::test]
    async fn test_guard_prevents_overlap() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        store
            .insert_task(
                Task::new("FEAT-1", "feature")
                    .with_id("T1")
                    .with_status(TaskStatus::PendingVerification),
            )
            .await;
        let scanner = QaScanner::new(&Config::default(), store, bus.clone());

        let _held = scanner.state().try_begin().unwrap();
        assert_eq!(
            scanner.scan().await.unwrap(),
            crate::scanner::ScanOutcome::Skipped
        );
        assert_eq!(bus.publish_count(EventName::TaskReadyForQa), 0);
    }
}
