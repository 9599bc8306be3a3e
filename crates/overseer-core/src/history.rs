//! Append-only task transition audit records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskStatus};

/// Who performed a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Agent,
    System,
}

/// Actor name recorded for control-plane initiated transitions.
pub const SYSTEM_ACTOR: &str = "system";

/// One successful task transition. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,

    /// Agent id, user name, or `system`.
    pub actor: String,
    pub actor_type: ActorType,

    pub reason: Option<String>,

    /// Small free-form context (failure list, launcher error, ...).
    pub metadata: HashMap<String, String>,

    pub recorded_at: DateTime<Utc>,
}

impl StateHistoryEntry {
    /// Create a new history entry stamped with the current time.
    pub fn new(
        task_id: TaskId,
        from_status: TaskStatus,
        to_status: TaskStatus,
        actor: impl Into<String>,
        actor_type: ActorType,
    ) -> Self {
        Self {
            task_id,
            from_status,
            to_status,
            actor: actor.into(),
            actor_type,
            reason: None,
            metadata: HashMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}
