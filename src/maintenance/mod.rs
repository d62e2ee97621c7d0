// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Node maintenance — take Proxmox nodes out of service, evacuate their
//! guests and run maintenance windows on a schedule.
//!
//! A node is "in maintenance" when its description carries the marker tag
//! (see [`marker`]). The local store only keeps history and schedules.

pub mod controller;
pub mod evacuate;
pub mod marker;
pub mod store;
pub mod sweep;

#[cfg(test)]
pub mod testing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxmox::PveError;

pub use controller::MaintenanceController;
pub use store::MaintenanceStore;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Node '{node}' not found in cluster '{cluster}'")]
    NodeNotFound { cluster: String, node: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid migration target: {0}")]
    InvalidTarget(String),

    #[error("Scheduled maintenance {0} is being processed, try again shortly")]
    ScheduleBusy(String),

    #[error(transparent)]
    Remote(#[from] PveError),
}

/// A scheduled maintenance window for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: String,
    pub cluster_id: String,
    pub node: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    #[serde(default)]
    pub migration_target: Option<String>,
    #[serde(default)]
    pub migrate_workloads: bool,
    #[serde(default)]
    pub online_migration: bool,
    #[serde(default)]
    pub exclude_vms: Vec<u64>,
    #[serde(default)]
    pub exclude_containers: Vec<u64>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub completed: bool,
    /// Window ended before the sweep ever saw it open
    #[serde(default)]
    pub missed: bool,
}

impl MaintenanceWindow {
    pub fn is_for(&self, cluster: &str, node: &str) -> bool {
        self.cluster_id == cluster && self.node == node
    }

    pub fn is_pending(&self) -> bool {
        !self.started && !self.completed
    }

    /// Started but not yet retired
    pub fn is_active(&self) -> bool {
        self.started && !self.completed
    }
}

/// A guest that a migrate call was issued for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedWorkload {
    pub vmid: u64,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDetails {
    pub target_node: String,
    pub online_migration: bool,
    #[serde(default)]
    pub vms: Vec<MigratedWorkload>,
    #[serde(default)]
    pub containers: Vec<MigratedWorkload>,
}

/// One maintenance episode of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub id: String,
    pub cluster_id: String,
    pub node: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub migration_details: Option<MigrationDetails>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl MaintenanceRecord {
    pub fn is_for(&self, cluster: &str, node: &str) -> bool {
        self.cluster_id == cluster && self.node == node
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}
