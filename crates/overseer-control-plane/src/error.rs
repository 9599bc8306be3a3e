//! Control plane errors.

use std::time::Duration;

use thiserror::Error;

use overseer_core::{AgentId, EventName, SessionId, TaskId, TaskStatus};

/// Errors raised by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Backend failure (I/O, connection, serialization).
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Rejections from the task state machine.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    Invalid {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Store error during transition: {0}")]
    Store(#[from] StoreError),
}

/// Agent launch failure. A normal outcome, not a fault.
#[derive(Debug, Error)]
#[error("Launch failed for task {task_id}: {message}")]
pub struct LaunchError {
    pub task_id: TaskId,
    pub message: String,
}

impl LaunchError {
    pub fn new(task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id,
            message: message.into(),
        }
    }
}

/// Event bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Timed out after {timeout:?} waiting for {name}")]
    Timeout { name: EventName, timeout: Duration },

    #[error("Subscription for {0} dropped before delivery")]
    Closed(EventName),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for control plane operations.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Resource probe failed: {0}")]
    Probe(String),
}
