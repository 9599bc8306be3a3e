//! Overseer Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Storage backends
//! - Agent process management
//!
//! All types here describe the records the control plane reasons about:
//! tasks, agents, sessions, their audit history, and the bus event catalog.

pub mod agent;
pub mod error;
pub mod event;
pub mod history;
pub mod ids;
pub mod session;
pub mod status;
pub mod task;
pub mod transition;

// Re-export commonly used types
pub use agent::Agent;
pub use error::CoreError;
pub use event::{Event, EventName, EventPayload, ReconcileSummary};
pub use history::{ActorType, StateHistoryEntry};
pub use ids::{AgentId, SessionId, TaskId};
pub use session::Session;
pub use status::{AgentStatus, Priority, SessionStatus, TaskStatus};
pub use task::Task;
pub use transition::{allowed_transitions, is_valid_transition, preferred_agent_type};
