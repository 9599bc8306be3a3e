//! Periodic scanners.
//!
//! Each scanner reads a narrow slice of store state on its own interval and
//! publishes bus events. Only the reconciler repairs state. A scanner pass
//! never overlaps with the previous pass of the same scanner.

mod pending;
mod periodic;
mod qa;
mod reconciler;
mod resources;
mod stuck;

pub use pending::PendingTaskScanner;
pub use periodic::PeriodicTrigger;
pub use qa::QaScanner;
pub use reconciler::Reconciler;
pub use resources::{ResourceProbe, ResourceSample, ResourceScanner, SystemProbe};
pub use stuck::StuckAgentScanner;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::bus::panic_message;
use crate::config::ScannerConfig;
use crate::error::ControlPlaneError;

/// Timer bookkeeping shared by every scanner.
#[derive(Debug)]
pub struct ScannerState {
    enabled: AtomicBool,
    interval: Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

impl ScannerState {
    pub fn new(enabled: bool, interval: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            interval,
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.enabled, config.interval())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Takes effect on the next tick; a pass already running completes.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// When the last pass finished.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the scanner for one pass. Returns `None` if disabled or a pass
    /// is already running.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        if !self.is_enabled() {
            return None;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(RunGuard { state: self })
    }
}

/// Held for the duration of one pass.
#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a ScannerState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self
            .state
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.state.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Disabled, or the previous pass was still running.
    Skipped,
    /// The pass ran; `emitted` counts events published (or repairs, for
    /// the reconciler).
    Completed { emitted: usize },
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> &ScannerState;

    /// One pass. Callers go through [`Scanner::scan`].
    async fn cycle(&self) -> Result<usize, ControlPlaneError>;

    async fn scan(&self) -> Result<ScanOutcome, ControlPlaneError> {
        let Some(_guard) = self.state().try_begin() else {
            return Ok(ScanOutcome::Skipped);
        };
        let emitted = self.cycle().await?;
        Ok(ScanOutcome::Completed { emitted })
    }
}

/// Run a scanner on its own interval until `shutdown` flips to true (or its
/// sender is dropped).
///
/// Errors and panics from a pass are logged and the loop carries on with
/// the next tick.
pub fn spawn_scanner(
    scanner: Arc<dyn Scanner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = scanner.name();
        let mut ticker = tokio::time::interval(scanner.state().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            scanner = name,
            interval_secs = scanner.state().interval().as_secs(),
            enabled = scanner.state().is_enabled(),
            "Scanner started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match AssertUnwindSafe(scanner.scan()).catch_unwind().await {
                Ok(Ok(ScanOutcome::Completed { emitted })) => {
                    debug!(scanner = name, emitted, "Scan completed");
                }
                Ok(Ok(ScanOutcome::Skipped)) => {
                    trace!(scanner = name, "Scan skipped");
                }
                Ok(Err(e)) => {
                    error!(scanner = name, error = %e, "Scan failed");
                }
                Err(panic) => {
                    error!(scanner = name, panic = %panic_message(&*panic), "Scan panicked");
                }
            }
        }

        info!(scanner = name, "Scanner stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingScanner {
        state: ScannerState,
        passes: AtomicUsize,
        panic_on_first: bool,
    }

    impl CountingScanner {
        fn new(panic_on_first: bool) -> Self {
            Self {
                state: ScannerState::new(true, Duration::from_secs(10)),
                passes: AtomicUsize::new(0),
                panic_on_first,
            }
        }
    }

    #[async_trait]
    impl Scanner for CountingScanner {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn state(&self) -> &ScannerState {
            &self.state
        }

        async fn cycle(&self) -> Result<usize, ControlPlaneError> {
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && pass == 0 {
                panic!("first pass blew up");
            }
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_scan_skipped_when_disabled() {
        let scanner = CountingScanner::new(false);
        scanner.state().set_enabled(false);

        assert_eq!(scanner.scan().await.unwrap(), ScanOutcome::Skipped);
        assert_eq!(scanner.passes.load(Ordering::SeqCst), 0);
        assert!(scanner.state().last_run().is_none());
    }

    #[tokio::test]
    async fn test_scan_skipped_while_running() {
        let scanner = CountingScanner::new(false);
        let guard = scanner.state().try_begin().unwrap();

        assert_eq!(scanner.scan().await.unwrap(), ScanOutcome::Skipped);
        drop(guard);

        assert_eq!(
            scanner.scan().await.unwrap(),
            ScanOutcome::Completed { emitted: 1 }
        );
        assert!(!scanner.state().is_running());
        assert!(scanner.state().last_run().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_panic_and_stops_on_shutdown() {
        let scanner = Arc::new(CountingScanner::new(true));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scanner(scanner.clone(), rx);

        // First tick is immediate, then every 10s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(scanner.passes.load(Ordering::SeqCst), 3);
        assert!(!scanner.state().is_running());

        tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scanner.passes.load(Ordering::SeqCst), 3);
    }
}
