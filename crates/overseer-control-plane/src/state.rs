//! Shared application state.

use std::sync::Arc;

use crate::bus::{attach_event_log, EventBus};
use crate::config::Config;
use crate::launcher::{AgentLauncher, ProcessLauncher};
use crate::scanner::{
    PendingTaskScanner, PeriodicTrigger, QaScanner, Reconciler, ResourceProbe, ResourceScanner,
    Scanner, StuckAgentScanner,
};
use crate::scheduler::SpawnScheduler;
use crate::state_machine::TaskStateMachine;
use crate::store::Store;

/// Wired control plane components.
pub struct AppState {
    pub config: Config,

    pub store: Arc<dyn Store>,

    /// Process-wide event bus.
    pub bus: Arc<EventBus>,

    pub state_machine: Arc<TaskStateMachine>,

    pub launcher: Arc<dyn AgentLauncher>,

    pub scheduler: Arc<SpawnScheduler>,
}

impl AppState {
    /// Create a new AppState with the launcher described by `config`.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let launcher = ProcessLauncher::from_config(&config.launcher, store.clone(), bus.clone());
        Self::with_launcher(config, store, bus, launcher)
    }

    /// Create a new AppState around an existing bus and launcher.
    pub fn with_launcher(
        config: Config,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Arc<Self> {
        let state_machine = Arc::new(TaskStateMachine::new(store.clone(), bus.clone()));
        let scheduler = Arc::new(SpawnScheduler::new(
            store.clone(),
            bus.clone(),
            state_machine.clone(),
            launcher.clone(),
            &config,
        ));

        Arc::new(Self {
            config,
            store,
            bus,
            state_machine,
            launcher,
            scheduler,
        })
    }

    /// Subscribe the scheduler and the event log to the bus.
    pub fn attach(&self) {
        self.scheduler.attach();
        attach_event_log(&self.bus);
    }

    /// Every scanner, configured from `self.config`. Disabled scanners are
    /// included and skip their passes.
    pub fn scanners(&self, probe: Arc<dyn ResourceProbe>) -> Vec<Arc<dyn Scanner>> {
        let config = &self.config;
        vec![
            Arc::new(PendingTaskScanner::new(config, self.store.clone(), self.bus.clone())),
            Arc::new(StuckAgentScanner::new(config, self.store.clone(), self.bus.clone())),
            Arc::new(QaScanner::new(config, self.store.clone(), self.bus.clone())),
            Arc::new(ResourceScanner::new(config, probe, self.bus.clone())),
            Arc::new(Reconciler::new(
                config,
                self.store.clone(),
                self.state_machine.clone(),
                self.bus.clone(),
            )),
            Arc::new(PeriodicTrigger::planning(config, self.bus.clone())),
            Arc::new(PeriodicTrigger::cleanup(config, self.bus.clone())),
        ]
    }
}
