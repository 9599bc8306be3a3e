use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use overseer_core::{EventName, EventPayload};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::{Config, ScannerConfig};
use crate::error::ControlPlaneError;

/// Fires a coarse `schedule:*` event once per period.
///
/// The first pass after startup only arms the timer, so a restart does not
/// fire immediately.
pub struct PeriodicTrigger {
    name: &'static str,
    state: ScannerState,
    event: EventName,
    period: Duration,
    bus: Arc<EventBus>,
    last_fired: Mutex<Option<Instant>>,
}

impl PeriodicTrigger {
    pub fn new(
        name: &'static str,
        event: EventName,
        schedule: &ScannerConfig,
        check_interval: Duration,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            name,
            state: ScannerState::new(schedule.enabled, check_interval),
            event,
            period: schedule.interval(),
            bus,
            last_fired: Mutex::new(None),
        }
    }

    /// Hourly planning trigger.
    pub fn planning(config: &Config, bus: Arc<EventBus>) -> Self {
        Self::new(
            "planning",
            EventName::SchedulePlanningDue,
            &config.scanners.planning,
            Duration::from_secs(config.scanners.trigger_check_secs),
            bus,
        )
    }

    /// Daily cleanup trigger.
    pub fn cleanup(config: &Config, bus: Arc<EventBus>) -> Self {
        Self::new(
            "cleanup",
            EventName::ScheduleCleanupDue,
            &config.scanners.cleanup,
            Duration::from_secs(config.scanners.trigger_check_secs),
            bus,
        )
    }
}

#[async_trait]
impl Scanner for PeriodicTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        let now = Instant::now();
        {
            let mut last = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                None => {
                    *last = Some(now);
                    debug!(trigger = self.name, "Trigger armed");
                    return Ok(0);
                }
                Some(at) if now.duration_since(at) < self.period => return Ok(0),
                Some(_) => *last = Some(now),
            }
        }

        info!(trigger = self.name, event = %self.event, "Schedule due");
        self.bus
            .publish(self.event, EventPayload::Schedule { due_at: Utc::now() });
        Ok(1)
    }
}
