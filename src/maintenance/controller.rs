// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Maintenance controller — enable/disable maintenance on a node, schedule
//! and cancel maintenance windows, and report history.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::evacuate::{self, MigrationPlan};
use super::marker;
use super::store::{Claim, MaintenanceStore};
use super::{MaintenanceError, MaintenanceRecord, MaintenanceWindow, MigrationDetails};
use crate::clusters::ClusterRegistry;
use crate::proxmox::{ClusterClient, PveGuest, PveNodeStatus, PveNodeSummary};

/// Who asked for a maintenance transition
#[derive(Debug, Clone)]
pub struct Origin {
    pub triggered_by: String,
    pub schedule_id: Option<String>,
}

impl Origin {
    pub fn user(name: &str) -> Self {
        Self { triggered_by: name.to_string(), schedule_id: None }
    }

    pub fn schedule(window_id: &str) -> Self {
        Self { triggered_by: "scheduler".to_string(), schedule_id: Some(window_id.to_string()) }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnableRequest {
    #[serde(default)]
    pub notes: String,
    /// Move guests off the node
    #[serde(default)]
    pub evacuate: bool,
    #[serde(default)]
    pub target: Option<String>,
    /// Live-migrate running guests; without it they stay put
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub exclude_vms: Vec<u64>,
    #[serde(default)]
    pub exclude_containers: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnableOutcome {
    pub record: MaintenanceRecord,
    pub migrated: usize,
    pub warnings: Vec<String>,
    /// The node description already carried a marker
    pub already_marked: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleRequest {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub migrate_workloads: bool,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub online_migration: bool,
    #[serde(default)]
    pub exclude_vms: Vec<u64>,
    #[serde(default)]
    pub exclude_containers: Vec<u64>,
    #[serde(default)]
    pub notes: String,
}

/// Live maintenance view of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeOverview {
    pub cluster_id: String,
    pub node: String,
    pub status: PveNodeStatus,
    pub in_maintenance: bool,
    /// Record id carried by the marker; `None` for the legacy tag
    pub marker_record: Option<String>,
    pub vms: Vec<PveGuest>,
    pub containers: Vec<PveGuest>,
    /// Other online nodes guests could move to
    pub available_targets: Vec<String>,
    /// Next window that has not completed yet
    pub scheduled: Option<MaintenanceWindow>,
    pub open_record: Option<MaintenanceRecord>,
    pub history: Vec<MaintenanceRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterNodes {
    pub cluster_id: String,
    pub nodes: Vec<PveNodeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Maintenance across every cluster
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceOverview {
    pub history: Vec<MaintenanceRecord>,
    pub schedules: Vec<MaintenanceWindow>,
    pub clusters: Vec<ClusterNodes>,
}

pub struct MaintenanceController {
    clusters: Arc<ClusterRegistry>,
    store: Arc<MaintenanceStore>,
}

impl MaintenanceController {
    pub fn new(clusters: Arc<ClusterRegistry>, store: Arc<MaintenanceStore>) -> Self {
        Self { clusters, store }
    }

    pub fn store(&self) -> &MaintenanceStore {
        &self.store
    }

    pub fn clusters(&self) -> &ClusterRegistry {
        &self.clusters
    }

    fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, MaintenanceError> {
        self.clusters.get(cluster).ok_or_else(|| MaintenanceError::ClusterNotFound(cluster.to_string()))
    }

    /// Look up the node live; returns the cluster's node list
    async fn resolve_node(&self, client: &dyn ClusterClient, cluster: &str, node: &str) -> Result<Vec<PveNodeSummary>, MaintenanceError> {
        let nodes = client.list_nodes().await?;
        if !nodes.iter().any(|n| n.node == node) {
            return Err(MaintenanceError::NodeNotFound { cluster: cluster.to_string(), node: node.to_string() });
        }
        Ok(nodes)
    }

    // ─── Enable / disable ───

    pub async fn enable(&self, cluster: &str, node: &str, req: &EnableRequest, origin: Origin) -> Result<EnableOutcome, MaintenanceError> {
        self.enable_at(cluster, node, req, origin, Utc::now()).await
    }

    /// Put `node` into maintenance, evacuating it if asked to.
    ///
    /// Unknown cluster, node or target fail before anything is changed.
    /// Once the marker is written the call succeeds; guest migration
    /// problems come back as warnings.
    pub async fn enable_at(&self, cluster: &str, node: &str, req: &EnableRequest, origin: Origin, now: DateTime<Utc>) -> Result<EnableOutcome, MaintenanceError> {
        let client = self.client(cluster)?;
        let nodes = self.resolve_node(client.as_ref(), cluster, node).await?;

        let mut warnings = Vec::new();
        let target = req.target.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let plan = match (req.evacuate, target) {
            (true, Some(target)) => {
                if target == node {
                    return Err(MaintenanceError::InvalidTarget(format!("cannot evacuate {} onto itself", node)));
                }
                if !nodes.iter().any(|n| n.node == target) {
                    return Err(MaintenanceError::NodeNotFound { cluster: cluster.to_string(), node: target.to_string() });
                }
                Some(MigrationPlan {
                    target: target.to_string(),
                    online: req.online,
                    exclude_vms: req.exclude_vms.clone(),
                    exclude_containers: req.exclude_containers.clone(),
                })
            }
            (true, None) => {
                warnings.push("Evacuation requested without a target node; no guests were moved".to_string());
                None
            }
            (false, _) => None,
        };

        let record_id = uuid::Uuid::new_v4().to_string();
        let description = client.get_node_description(node).await?;
        let already_marked = match marker::add_marker(&description, &record_id) {
            Some(marked) => {
                client.set_node_description(node, &marked).await?;
                false
            }
            None => {
                info!("Node {}/{} already carries a maintenance marker", cluster, node);
                true
            }
        };

        let record = MaintenanceRecord {
            id: record_id.clone(),
            cluster_id: cluster.to_string(),
            node: node.to_string(),
            start_time: now,
            end_time: None,
            scheduled: origin.schedule_id.is_some(),
            schedule_id: origin.schedule_id.clone(),
            triggered_by: origin.triggered_by.clone(),
            migration_details: None,
            warnings: Vec::new(),
            notes: req.notes.clone(),
        };
        for superseded in self.store.open_record(record.clone()) {
            warn!("Closed maintenance record {} of {}/{}: superseded by {}", superseded, cluster, node, record_id);
        }
        info!("Node {}/{} entered maintenance (record {}, by {})", cluster, node, record_id, origin.triggered_by);

        let mut migrated = 0;
        let mut details = None;
        if let Some(plan) = plan {
            let (vms, cts) = tokio::join!(client.list_vms(node), client.list_containers(node));
            let vms = vms.unwrap_or_else(|e| {
                warnings.push(format!("Failed to list VMs on {}: {}", node, e));
                Vec::new()
            });
            let cts = cts.unwrap_or_else(|e| {
                warnings.push(format!("Failed to list containers on {}: {}", node, e));
                Vec::new()
            });

            match evacuate::evacuate(client.as_ref(), node, &plan, &vms, &cts).await {
                Ok(report) => {
                    migrated = report.migrated;
                    warnings.extend(report.errors);
                    details = Some(MigrationDetails {
                        target_node: plan.target.clone(),
                        online_migration: plan.online,
                        vms: report.vms,
                        containers: report.containers,
                    });
                }
                Err(e) => warnings.push(e.to_string()),
            }
        }

        let record = if details.is_some() || !warnings.is_empty() {
            let stored_warnings = warnings.clone();
            self.store.update_record(&record_id, |r| {
                r.migration_details = details;
                r.warnings = stored_warnings;
            }).unwrap_or(record)
        } else {
            record
        };

        Ok(EnableOutcome { record, migrated, warnings, already_marked })
    }

    pub async fn disable(&self, cluster: &str, node: &str) -> Result<Option<MaintenanceRecord>, MaintenanceError> {
        self.disable_at(cluster, node, None, Utc::now()).await
    }

    /// Take `node` out of maintenance and close its open record. The marker
    /// is removed even when there is no record to close.
    pub async fn disable_at(&self, cluster: &str, node: &str, schedule_id: Option<&str>, now: DateTime<Utc>) -> Result<Option<MaintenanceRecord>, MaintenanceError> {
        let client = self.client(cluster)?;
        self.resolve_node(client.as_ref(), cluster, node).await?;

        let description = client.get_node_description(node).await?;
        let stripped = marker::strip_marker(&description);
        if stripped != description {
            client.set_node_description(node, stripped).await?;
        }

        let closed = self.store.close_open_record(cluster, node, schedule_id, now);
        match &closed {
            Some(record) => info!("Node {}/{} left maintenance (record {})", cluster, node, record.id),
            None => warn!("Node {}/{} left maintenance but had no open maintenance record", cluster, node),
        }
        Ok(closed)
    }

    // ─── Schedules ───

    pub async fn schedule(&self, cluster: &str, node: &str, req: &ScheduleRequest, created_by: &str) -> Result<MaintenanceWindow, MaintenanceError> {
        self.schedule_at(cluster, node, req, created_by, Utc::now()).await
    }

    pub async fn schedule_at(&self, cluster: &str, node: &str, req: &ScheduleRequest, created_by: &str, now: DateTime<Utc>) -> Result<MaintenanceWindow, MaintenanceError> {
        let (start, end) = resolve_window(req)?;
        if end <= now {
            return Err(MaintenanceError::InvalidSchedule(format!("window ends in the past ({})", end.to_rfc3339())));
        }
        let target = req.target.as_deref().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
        if req.migrate_workloads && target.as_deref() == Some(node) {
            return Err(MaintenanceError::InvalidTarget(format!("cannot evacuate {} onto itself", node)));
        }

        let client = self.client(cluster)?;
        self.resolve_node(client.as_ref(), cluster, node).await?;

        let window = MaintenanceWindow {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster.to_string(),
            node: node.to_string(),
            scheduled_start: start,
            scheduled_end: end,
            migration_target: target,
            migrate_workloads: req.migrate_workloads,
            online_migration: req.online_migration,
            exclude_vms: req.exclude_vms.clone(),
            exclude_containers: req.exclude_containers.clone(),
            notes: req.notes.clone(),
            created_at: now,
            created_by: created_by.to_string(),
            started: false,
            completed: false,
            missed: false,
        };
        self.store.add_window(window.clone());
        info!("Scheduled maintenance {} for {}/{}: {} to {}", window.id, cluster, node, start.to_rfc3339(), end.to_rfc3339());
        Ok(window)
    }

    pub async fn cancel_schedule(&self, id: &str, cluster: &str, node: &str) -> Result<Option<MaintenanceWindow>, MaintenanceError> {
        self.cancel_schedule_at(id, cluster, node, Utc::now()).await
    }

    /// Remove a window. Unknown ids are a no-op. A window that has started
    /// and not yet ended takes its maintenance down with it.
    pub async fn cancel_schedule_at(&self, id: &str, cluster: &str, node: &str, now: DateTime<Utc>) -> Result<Option<MaintenanceWindow>, MaintenanceError> {
        let claim = match self.store.claim(id, cluster, node) {
            Claim::NotFound => return Ok(None),
            Claim::Busy => return Err(MaintenanceError::ScheduleBusy(id.to_string())),
            Claim::Claimed(claim) => claim,
        };

        // On error, or if this future is dropped, the claim is released
        if claim.window().is_active() {
            self.disable_at(cluster, node, Some(id), now).await?;
        }

        let removed = claim.remove();
        info!("Cancelled scheduled maintenance {} for {}/{}", id, cluster, node);
        Ok(removed)
    }

    // ─── Reporting ───

    pub fn history(&self, cluster: Option<&str>, node: Option<&str>) -> Vec<MaintenanceRecord> {
        self.store.records(cluster, node)
    }

    pub fn pending_schedules(&self, cluster: Option<&str>, node: Option<&str>) -> Vec<MaintenanceWindow> {
        self.store.pending_windows(cluster, node)
    }

    pub async fn node_overview(&self, cluster: &str, node: &str) -> Result<NodeOverview, MaintenanceError> {
        let client = self.client(cluster)?;
        let nodes = self.resolve_node(client.as_ref(), cluster, node).await?;

        let (status, description, vms, cts) = tokio::join!(
            client.get_node_status(node),
            client.get_node_description(node),
            client.list_vms(node),
            client.list_containers(node),
        );

        let available_targets = nodes.into_iter()
            .filter(|n| n.node != node && n.is_online())
            .map(|n| n.node)
            .collect();

        let description = description?;
        Ok(NodeOverview {
            cluster_id: cluster.to_string(),
            node: node.to_string(),
            status: status?,
            in_maintenance: marker::has_marker(&description),
            marker_record: marker::marker_id(&description).map(str::to_string),
            vms: vms?,
            containers: cts?,
            available_targets,
            scheduled: self.store.pending_windows(Some(cluster), Some(node)).into_iter().next(),
            open_record: self.store.open_record_for(cluster, node),
            history: self.store.records(Some(cluster), Some(node)),
        })
    }

    /// Everything at once. Clusters that cannot be reached are reported
    /// with an error instead of failing the whole overview.
    pub async fn overview(&self) -> MaintenanceOverview {
        let mut clusters = Vec::new();
        for (id, client) in self.clusters.all() {
            match client.list_nodes().await {
                Ok(nodes) => clusters.push(ClusterNodes { cluster_id: id, nodes, error: None }),
                Err(e) => {
                    warn!("Maintenance overview: cluster {} unreachable: {}", id, e);
                    clusters.push(ClusterNodes { cluster_id: id, nodes: Vec::new(), error: Some(e.to_string()) });
                }
            }
        }

        MaintenanceOverview {
            history: self.store.records(None, None),
            schedules: self.store.all_windows(None, None),
            clusters,
        }
    }
}

/// Accept RFC 3339, or "YYYY-MM-DD HH:MM" in server local time
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, MaintenanceError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .map_err(|_| MaintenanceError::InvalidSchedule(format!("unrecognised time '{}'", s)))?;
    Local.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| MaintenanceError::InvalidSchedule(format!("'{}' is ambiguous or does not exist in local time", s)))
}

/// Start and end of a requested window, checked for order
fn resolve_window(req: &ScheduleRequest) -> Result<(DateTime<Utc>, DateTime<Utc>), MaintenanceError> {
    let start = parse_timestamp(&req.start)?;
    let end = match (&req.end, req.duration_minutes) {
        (Some(_), Some(_)) => {
            return Err(MaintenanceError::InvalidSchedule("give either an end time or a duration, not both".to_string()));
        }
        (Some(end), None) => parse_timestamp(end)?,
        (None, Some(minutes)) => start + Duration::minutes(i64::from(minutes)),
        (None, None) => {
            return Err(MaintenanceError::InvalidSchedule("an end time or a duration is required".to_string()));
        }
    };
    if start >= end {
        return Err(MaintenanceError::InvalidSchedule(format!(
            "start {} is not before end {}", start.to_rfc3339(), end.to_rfc3339()
        )));
    }
    Ok((start, end))
}
