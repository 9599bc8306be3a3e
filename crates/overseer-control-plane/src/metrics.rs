//! Prometheus metrics collection and formatting.
//!
//! This module renders metrics in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;

use overseer_core::{AgentStatus, TaskStatus};

use crate::error::StoreError;
use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &AppState) -> Result<String, StoreError> {
    let mut output = String::new();

    collect_task_metrics(state, &mut output).await?;
    collect_agent_metrics(state, &mut output).await?;
    collect_scheduler_metrics(state, &mut output);
    collect_bus_metrics(state, &mut output);

    Ok(output)
}

/// Collect task metrics by status.
async fn collect_task_metrics(state: &AppState, output: &mut String) -> Result<(), StoreError> {
    writeln!(
        output,
        "# HELP overseer_tasks_total Number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE overseer_tasks_total gauge").ok();
    for status in TaskStatus::ALL {
        let count = state.store.get_tasks_by_status(status).await?.len();
        writeln!(output, "overseer_tasks_total{{status=\"{status}\"}} {count}").ok();
    }
    Ok(())
}

/// Collect agent metrics by status.
async fn collect_agent_metrics(state: &AppState, output: &mut String) -> Result<(), StoreError> {
    let agents = state.store.list_agents().await?;

    let mut idle = 0u64;
    let mut working = 0u64;
    let mut stuck = 0u64;
    for agent in &agents {
        match agent.status {
            AgentStatus::Idle => idle += 1,
            AgentStatus::Working => working += 1,
            AgentStatus::Stuck => stuck += 1,
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP overseer_agents_total Number of agents by status"
    )
    .ok();
    writeln!(output, "# TYPE overseer_agents_total gauge").ok();
    writeln!(output, "overseer_agents_total{{status=\"idle\"}} {idle}").ok();
    writeln!(output, "overseer_agents_total{{status=\"working\"}} {working}").ok();
    writeln!(output, "overseer_agents_total{{status=\"stuck\"}} {stuck}").ok();
    Ok(())
}

fn collect_scheduler_metrics(state: &AppState, output: &mut String) {
    let admission = state.scheduler.admission();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP overseer_spawn_queue_depth Spawn requests waiting for an agent"
    )
    .ok();
    writeln!(output, "# TYPE overseer_spawn_queue_depth gauge").ok();
    writeln!(
        output,
        "overseer_spawn_queue_depth {}",
        state.scheduler.queue_len()
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP overseer_spawn_gate_open Admission gate state (1 = open)"
    )
    .ok();
    writeln!(output, "# TYPE overseer_spawn_gate_open gauge").ok();
    for (gate, open) in [
        ("enabled", admission.enabled),
        ("cpu", admission.cpu_ok),
        ("memory", admission.memory_ok),
        ("budget", admission.budget_ok),
    ] {
        writeln!(
            output,
            "overseer_spawn_gate_open{{gate=\"{gate}\"}} {}",
            u8::from(open)
        )
        .ok();
    }
}

fn collect_bus_metrics(state: &AppState, output: &mut String) {
    let published: BTreeMap<_, _> = state.bus.stats().published;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP overseer_events_published_total Events published on the bus"
    )
    .ok();
    writeln!(output, "# TYPE overseer_events_published_total counter").ok();
    for (name, count) in published {
        writeln!(
            output,
            "overseer_events_published_total{{event=\"{name}\"}} {count}"
        )
        .ok();
    }
}
