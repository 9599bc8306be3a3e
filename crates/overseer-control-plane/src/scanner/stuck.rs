use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::warn;

use overseer_core::{EventName, EventPayload};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::store::Store;

/// Reports working agents whose heartbeat has gone quiet.
///
/// Detection only: the agent is left as it is.
pub struct StuckAgentScanner {
    state: ScannerState,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    threshold: Duration,
}

impl StuckAgentScanner {
    pub fn new(config: &Config, store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            state: ScannerState::from_config(&config.scanners.stuck_agents),
            store,
            bus,
            threshold: Duration::minutes(config.thresholds.stuck_agent_minutes),
        }
    }
}

#[async_trait]
impl Scanner for StuckAgentScanner {
    fn name(&self) -> &'static str {
        "stuck_agents"
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        let now = Utc::now();
        let mut flagged = 0;

        for agent in self.store.get_working_agents().await? {
            let age = agent.heartbeat_age(now);
            if age <= self.threshold {
                continue;
            }

            warn!(
                agent_id = %agent.id,
                task_id = ?agent.current_task_id,
                heartbeat_age_secs = age.num_seconds(),
                "Agent appears stuck"
            );
            self.bus.publish(
                EventName::AgentStuck,
                EventPayload::Agent {
                    agent_id: agent.id.clone(),
                    task_id: agent.current_task_id.clone(),
                    heartbeat_age_secs: Some(age.num_seconds()),
                },
            );
            flagged += 1;
        }

        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{Agent, AgentStatus};

    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_flags_only_stale_working_agents() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let old = Utc::now() - Duration::minutes(16);

        store
            .insert_agent(
                Agent::new("stale", "build")
                    .with_id("A1")
                    .working_on("T1", None)
                    .with_last_heartbeat(old),
            )
            .await;
        store
            .insert_agent(Agent::new("fresh", "build").with_id("A2").working_on("T2", None))
            .await;
        store
            .insert_agent(Agent::new("idle", "build").with_id("A3").with_last_heartbeat(old))
            .await;

        let scanner = StuckAgentScanner::new(&Config::default(), store.clone(), bus.clone());
        let event = bus.wait_for(EventName::AgentStuck, std::time::Duration::from_secs(1));

        assert_eq!(scanner.cycle().await.unwrap(), 1);
        let event = event.await.unwrap();
        assert_eq!(event.payload.agent_id().map(|a| a.as_str()), Some("A1"));

        // Detection only.
        let agent = store.get_agent(&"A1".into()).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
    }
}
