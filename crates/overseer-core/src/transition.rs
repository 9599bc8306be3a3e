//! Task lifecycle adjacency table and category routing.

use crate::TaskStatus;

/// Statuses reachable from `from` in a single transition.
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;

    match from {
        Pending => &[InProgress, Blocked],
        InProgress => &[PendingVerification, Failed, Blocked],
        PendingVerification => &[Completed, Failed],
        Completed => &[],
        Failed => &[Pending, Blocked],
        Blocked => &[Pending],
    }
}

/// Returns true if `from -> to` is in the adjacency table.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Agent type best suited for a task category.
pub fn preferred_agent_type(category: &str) -> &'static str {
    match category {
        "feature" | "bug" | "improvement" => "build",
        "spec" => "spec",
        "research" => "research",
        _ => "build",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn test_adjacency_table() {
        let valid = [
            (Pending, InProgress),
            (Pending, Blocked),
            (InProgress, PendingVerification),
            (InProgress, Failed),
            (InProgress, Blocked),
            (PendingVerification, Completed),
            (PendingVerification, Failed),
            (Failed, Pending),
            (Failed, Blocked),
            (Blocked, Pending),
        ];

        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    is_valid_transition(from, to),
                    valid.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_completed_is_terminal() {
        assert!(allowed_transitions(Completed).is_empty());
        assert!(Completed.is_terminal());
    }

    #[test]
    fn test_preferred_agent_type() {
        assert_eq!(preferred_agent_type("bug"), "build");
        assert_eq!(preferred_agent_type("improvement"), "build");
        assert_eq!(preferred_agent_type("spec"), "spec");
        assert_eq!(preferred_agent_type("research"), "research");
        assert_eq!(preferred_agent_type("docs"), "build");
    }
}
