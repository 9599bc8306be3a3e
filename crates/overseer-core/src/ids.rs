//! Record identifiers.
//!
//! Ids are opaque strings. Seeded records keep whatever ids the snapshot
//! gives them; records created at runtime get a prefixed UUID so the kind
//! of id is visible in logs and in the `OVERSEER_*` environment of agent
//! processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// A fresh id of the form `<prefix>-<uuid>`.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

define_id!(
    /// Store key of a task. Distinct from the human-facing `display_id`
    /// (`FEAT-12`), which is not unique across reseeds.
    TaskId,
    "task"
);

define_id!(
    /// Identity of an agent slot. It outlives individual launches: the same
    /// agent works many tasks, one session at a time, and is the actor
    /// recorded in history when it drives a transition.
    AgentId,
    "agent"
);

define_id!(
    /// One launch attempt. Minted by the launcher, handed to the agent
    /// process as `OVERSEER_SESSION_ID`, and compared against the agent's
    /// `current_session_id` when the reconciler checks for orphans.
    SessionId,
    "session"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session-"));
        assert!(AgentId::generate().as_str().starts_with("agent-"));
        assert!(TaskId::generate().as_str().starts_with("task-"));
    }

    #[test]
    fn test_seeded_ids_are_kept_verbatim() {
        let id = AgentId::new("agent-7");
        assert_eq!(id.to_string(), "agent-7");
        assert_eq!(AgentId::from("A1").as_str(), "A1");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = TaskId::new("T1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"T1\"");
    }
}
