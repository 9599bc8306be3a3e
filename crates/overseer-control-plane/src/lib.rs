//! Overseer Control Plane Library
//!
//! This crate provides the orchestration control loop for Overseer: the
//! event bus, task state machine, spawn scheduler, periodic scanners and
//! state reconciler.

pub mod bus;
pub mod config;
pub mod error;
pub mod hysteresis;
pub mod launcher;
pub mod metrics;
pub mod scanner;
pub mod scheduler;
pub mod state;
pub mod state_machine;
pub mod store;

pub use bus::EventBus;
pub use config::Config;
pub use error::ControlPlaneError;
pub use launcher::{AgentLauncher, LaunchRequest, Launched, ProcessLauncher};
pub use scheduler::SpawnScheduler;
pub use state::AppState;
pub use state_machine::{TaskStateMachine, TransitionContext};
pub use store::{InMemoryStore, Store};
