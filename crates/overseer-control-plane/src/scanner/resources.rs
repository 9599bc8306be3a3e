use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sysinfo::System;
use tracing::{info, warn};

use overseer_core::{EventName, EventPayload};

use super::{Scanner, ScannerState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ControlPlaneError;

/// Host utilisation, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of resource samples.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample, ControlPlaneError>;
}

/// Samples the local host through `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first sample
/// after startup may read low.
pub struct SystemProbe {
    system: Arc<Mutex<System>>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn sample(&self) -> Result<ResourceSample, ControlPlaneError> {
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let total = sys.total_memory();
            let memory_percent = if total == 0 {
                0.0
            } else {
                (sys.used_memory() as f64 / total as f64 * 100.0) as f32
            };

            ResourceSample {
                cpu_percent: sys.global_cpu_usage(),
                memory_percent,
            }
        })
        .await
        .map_err(|e| ControlPlaneError::Probe(format!("resource sample task failed: {e}")))
    }
}

/// Publishes `system:{cpu,memory}_{high,normal}` when utilisation crosses
/// the configured thresholds. Edge-triggered: one event per crossing.
pub struct ResourceScanner {
    state: ScannerState,
    probe: Arc<dyn ResourceProbe>,
    bus: Arc<EventBus>,
    cpu_threshold: f32,
    memory_threshold: f32,
    cpu_high: AtomicBool,
    memory_high: AtomicBool,
}

impl ResourceScanner {
    pub fn new(config: &Config, probe: Arc<dyn ResourceProbe>, bus: Arc<EventBus>) -> Self {
        Self {
            state: ScannerState::from_config(&config.scanners.resources),
            probe,
            bus,
            cpu_threshold: config.thresholds.cpu_high_percent,
            memory_threshold: config.thresholds.memory_high_percent,
            cpu_high: AtomicBool::new(false),
            memory_high: AtomicBool::new(false),
        }
    }

    fn edge(
        &self,
        flag: &AtomicBool,
        usage: f32,
        threshold: f32,
        (high, normal): (EventName, EventName),
    ) -> bool {
        let is_high = usage >= threshold;
        if flag.swap(is_high, Ordering::SeqCst) == is_high {
            return false;
        }

        let name = if is_high { high } else { normal };
        if is_high {
            warn!(event = %name, usage_percent = usage, threshold_percent = threshold, "Resource threshold crossed");
        } else {
            info!(event = %name, usage_percent = usage, threshold_percent = threshold, "Resource usage back to normal");
        }
        self.bus.publish(
            name,
            EventPayload::Resource {
                usage_percent: usage,
                threshold_percent: threshold,
            },
        );
        true
    }
}

#[async_trait]
impl Scanner for ResourceScanner {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn state(&self) -> &ScannerState {
        &self.state
    }

    async fn cycle(&self) -> Result<usize, ControlPlaneError> {
        let sample = self.probe.sample().await?;

        let cpu = self.edge(
            &self.cpu_high,
            sample.cpu_percent,
            self.cpu_threshold,
            (EventName::SystemCpuHigh, EventName::SystemCpuNormal),
        );
        let memory = self.edge(
            &self.memory_high,
            sample.memory_percent,
            self.memory_threshold,
            (EventName::SystemMemoryHigh, EventName::SystemMemoryNormal),
        );

        Ok(usize::from(cpu) + usize::from(memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProbe(Mutex<VecDeque<ResourceSample>>);

    impl ScriptedProbe {
        fn new(samples: &[(f32, f32)]) -> Self {
            Self(Mutex::new(
                samples
                    .iter()
                    .map(|&(cpu_percent, memory_percent)| ResourceSample {
                        cpu_percent,
                        memory_percent,
                    })
                    .collect(),
            ))
        }
    }

    #[async_trait]
    impl ResourceProbe for ScriptedProbe {
        async fn sample(&self) -> Result<ResourceSample, ControlPlaneError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ControlPlaneError::Probe("script exhausted".into()))
        }
    }

    #[tokio::test]
    async fn test_edge_triggered_events() {
        let bus = Arc::new(EventBus::new());
        let probe = Arc::new(ScriptedProbe::new(&[
            (10.0, 10.0),
            (95.0, 10.0),
            (97.0, 92.0),
            (40.0, 92.0),
            (40.0, 50.0),
        ]));
        let scanner = ResourceScanner::new(&Config::default(), probe, bus.clone());

        let emitted: Vec<usize> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(scanner.cycle().await.unwrap());
            }
            out
        };

        assert_eq!(emitted, vec![0, 1, 1, 1, 1]);
        assert_eq!(bus.publish_count(EventName::SystemCpuHigh), 1);
        assert_eq!(bus.publish_count(EventName::SystemCpuNormal), 1);
        assert_eq!(bus.publish_count(EventName::SystemMemoryHigh), 1);
        assert_eq!(bus.publish_count(EventName::SystemMemoryNormal), 1);
    }

    #[tokio::test]
    async fn test_probe_error_propagates() {
        let bus = Arc::new(EventBus::new());
        let scanner = ResourceScanner::new(
            &Config::default(),
            Arc::new(ScriptedProbe::new(&[])),
            bus,
        );
        assert!(matches!(
            scanner.cycle().await,
            Err(ControlPlaneError::Probe(_))
        ));
    }

    #[tokio::test]
    async fn test_system_probe_reports_percentages() {
        let sample = SystemProbe::new().sample().await.unwrap();
        assert!(sample.memory_percent >= 0.0);
        assert!(sample.cpu_percent >= 0.0);
    }
}
