// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Scheduler sweep — starts maintenance windows that are due and ends the
//! ones that are over.
//!
//! Runs on a timer and opportunistically before each API request. Windows
//! are claimed in the store before any cluster call, so overlapping sweeps
//! never act on the same window twice. A window that fails is logged and
//! left as it was; the next sweep tries it again.
//!
//! [`Sweeper::run_once`] runs the sweep as its own task, so a caller that
//! gives up (a client disconnecting mid-request) does not cut it short.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::controller::{EnableRequest, MaintenanceController, Origin};
use super::store::WindowTransition;
use super::MaintenanceWindow;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub activated: usize,
    pub completed: usize,
    pub missed: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

fn enable_request(window: &MaintenanceWindow) -> EnableRequest {
    EnableRequest {
        notes: window.notes.clone(),
        evacuate: window.migrate_workloads,
        target: window.migration_target.clone(),
        online: window.online_migration,
        exclude_vms: window.exclude_vms.clone(),
        exclude_containers: window.exclude_containers.clone(),
    }
}

/// One pass over the schedule at time `now`
pub async fn sweep(controller: &MaintenanceController, now: DateTime<Utc>) -> SweepReport {
    let store = controller.store();
    let due = store.claim_due(now);
    let mut report = SweepReport::default();
    if due.is_empty() {
        return report;
    }

    for window in &due.missed {
        warn!(
            "Scheduled maintenance {} for {}/{} ({} to {}) ended before it could start",
            window.id, window.cluster_id, window.node,
            window.scheduled_start.to_rfc3339(), window.scheduled_end.to_rfc3339()
        );
        report.missed += 1;
    }

    for claim in due.activate {
        let window = claim.window().clone();
        let result = controller
            .enable_at(&window.cluster_id, &window.node, &enable_request(&window), Origin::schedule(&window.id), now)
            .await;
        match result {
            Ok(outcome) => {
                claim.finish(Some(WindowTransition::Started));
                report.activated += 1;
                info!("Started scheduled maintenance {} on {}/{}", window.id, window.cluster_id, window.node);
                for warning in &outcome.warnings {
                    warn!("Scheduled maintenance {}: {}", window.id, warning);
                }
            }
            Err(e) => {
                claim.finish(None);
                report.failed += 1;
                warn!("Error starting scheduled maintenance {} on {}/{}: {}", window.id, window.cluster_id, window.node, e);
            }
        }
    }

    for claim in due.expire {
        let window = claim.window().clone();
        match controller.disable_at(&window.cluster_id, &window.node, Some(&window.id), now).await {
            Ok(_) => {
                claim.finish(Some(WindowTransition::Completed));
                report.completed += 1;
                info!("Ended scheduled maintenance {} on {}/{}", window.id, window.cluster_id, window.node);
            }
            Err(e) => {
                claim.finish(None);
                report.failed += 1;
                warn!("Error ending scheduled maintenance {} on {}/{}: {}", window.id, window.cluster_id, window.node, e);
            }
        }
    }

    report
}

/// Clears the running flag when the sweep task ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sweeps, at most one at a time per process
pub struct Sweeper {
    controller: Arc<MaintenanceController>,
    running: AtomicBool,
}

impl Sweeper {
    pub fn new(controller: Arc<MaintenanceController>) -> Self {
        Self { controller, running: AtomicBool::new(false) }
    }

    /// Sweep now unless another sweep is in progress
    pub async fn run_once(self: &Arc<Self>) -> Option<SweepReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Sweep already running, skipping");
            return None;
        }
        let sweeper = self.clone();
        let task = tokio::spawn(async move {
            let _running = RunningFlag(&sweeper.running);
            sweep(&sweeper.controller, Utc::now()).await
        });
        match task.await {
            Ok(report) => {
                if !report.is_idle() {
                    info!("Maintenance sweep: {:?}", report);
                }
                Some(report)
            }
            Err(e) => {
                warn!("Maintenance sweep task failed: {}", e);
                None
            }
        }
    }

    /// Fire-and-forget sweep for the request path
    pub fn trigger(self: &Arc<Self>) {
        if self.running.load(Ordering::Acquire) {
            return;
        }
        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.run_once().await;
        });
    }

    /// Background timer; sweeps every `interval`
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) {
        let sweeper = self.clone();
        tokio::spawn(async move {
            // First pass right away: windows may have come due while we were down
            loop {
                sweeper.run_once().await;
                tokio::time::sleep(interval).await;
            }
        });
    }
}
