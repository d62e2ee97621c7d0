// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Evacuation — move a node's guests to another node.
//!
//! Running guests are only moved with online migration enabled; without it
//! they are left where they are. Stopped guests are always moved offline.
//! Every guest is tried independently: a failed migrate call is recorded
//! and the loop carries on.

use serde::Serialize;
use tracing::{info, warn};

use super::{MaintenanceError, MigratedWorkload};
use crate::proxmox::{ClusterClient, GuestKind, MigrationRequest, PveGuest};

/// Where and how to move a node's guests
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub target: String,
    pub online: bool,
    pub exclude_vms: Vec<u64>,
    pub exclude_containers: Vec<u64>,
}

impl MigrationPlan {
    fn excludes(&self, guest: &PveGuest) -> bool {
        match guest.kind {
            GuestKind::Qemu => self.exclude_vms.contains(&guest.vmid),
            GuestKind::Lxc => self.exclude_containers.contains(&guest.vmid),
        }
    }

    /// The migrate call to issue for `guest`, or `None` to leave it alone
    pub fn request_for(&self, guest: &PveGuest) -> Option<MigrationRequest> {
        if self.excludes(guest) {
            return None;
        }
        match (guest.is_running(), self.online) {
            (true, true) => Some(MigrationRequest::online(self.target.trim())),
            (true, false) => None,
            (false, _) => Some(MigrationRequest::offline(self.target.trim())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvacuationReport {
    /// Guests a migrate call was accepted for
    pub migrated: usize,
    pub vms: Vec<MigratedWorkload>,
    pub containers: Vec<MigratedWorkload>,
    /// Running guests left behind because online migration was off
    pub skipped_running: Vec<u64>,
    /// One "<kind> <vmid>: <error>" line per failed guest
    pub errors: Vec<String>,
}

/// Issue migrate calls for every guest of `source` the plan covers.
///
/// Only a plan that cannot work at all is an error; failures of individual
/// guests end up in [`EvacuationReport::errors`].
pub async fn evacuate(
    client: &dyn ClusterClient,
    source: &str,
    plan: &MigrationPlan,
    vms: &[PveGuest],
    containers: &[PveGuest],
) -> Result<EvacuationReport, MaintenanceError> {
    let target = plan.target.trim();
    if target.is_empty() {
        return Err(MaintenanceError::InvalidTarget("no target node given".to_string()));
    }
    if target == source {
        return Err(MaintenanceError::InvalidTarget(format!("cannot evacuate {} onto itself", source)));
    }

    let mut report = EvacuationReport::default();

    for guest in vms.iter().chain(containers.iter()) {
        let Some(req) = plan.request_for(guest) else {
            if guest.is_running() && !plan.online && !plan.excludes(guest) {
                report.skipped_running.push(guest.vmid);
            }
            continue;
        };

        let result = match guest.kind {
            GuestKind::Qemu => client.migrate_vm(source, guest.vmid, &req).await,
            GuestKind::Lxc => client.migrate_container(source, guest.vmid, &req).await,
        };

        match result {
            Ok(_) => {
                report.migrated += 1;
                let entry = MigratedWorkload {
                    vmid: guest.vmid,
                    name: guest.display_name(),
                    status: guest.status.clone(),
                };
                match guest.kind {
                    GuestKind::Qemu => report.vms.push(entry),
                    GuestKind::Lxc => report.containers.push(entry),
                }
            }
            Err(e) => {
                warn!("Evacuation of {} {} from {} failed: {}", guest.kind, guest.vmid, source, e);
                report.errors.push(format!("{} {}: {}", guest.kind, guest.vmid, e));
            }
        }
    }

    if !report.skipped_running.is_empty() {
        info!("Left {} running guests on {} (online migration off): {:?}", report.skipped_running.len(), source, report.skipped_running);
    }
    info!("Evacuation {} -> {}: {} migrations started, {} failed", source, target, report.migrated, report.errors.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::testing::{guest, FakeCluster};

    fn plan(online: bool) -> MigrationPlan {
        MigrationPlan { target: "pve2".into(), online, ..Default::default() }
    }

    #[tokio::test]
    async fn test_running_guests_skipped_without_online() {
        let fake = FakeCluster::with_nodes(&["pve1", "pve2"]);
        let vms = vec![
            guest(101, "web", "running", GuestKind::Qemu, "pve1"),
            guest(102, "db", "stopped", GuestKind::Qemu, "pve1"),
        ];
        let cts = vec![guest(200, "dns", "running", GuestKind::Lxc, "pve1")];

        let report = evacuate(&fake, "pve1", &plan(false), &vms, &cts).await.unwrap();

        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped_running, vec![101, 200]);
        let migrations = fake.migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].1, 102);
    }

    #[tokio::test]
    async fn test_stopped_guests_always_move_offline() {
        for online in [true, false] {
            let fake = FakeCluster::with_nodes(&["pve1", "pve2"]);
            let vms = vec![guest(102, "db", "stopped", GuestKind::Qemu, "pve1")];
            let cts = vec![guest(201, "", "stopped", GuestKind::Lxc, "pve1")];

            let report = evacuate(&fake, "pve1", &plan(online), &vms, &cts).await.unwrap();

            assert_eq!(report.migrated, 2);
            for (_, _, req) in fake.migrations() {
                assert_eq!(req, MigrationRequest::offline("pve2"));
                assert!(!req.online);
            }
            assert_eq!(report.containers[0].name, "CT-201");
        }
    }

    #[tokio::test]
    async fn test_running_guests_move_online() {
        let fake = FakeCluster::with_nodes(&["pve1", "pve2"]);
        let vms = vec![guest(101, "web", "running", GuestKind::Qemu, "pve1")];

        let report = evacuate(&fake, "pve1", &plan(true), &vms, &[]).await.unwrap();

        assert_eq!(report.migrated, 1);
        let (kind, vmid, req) = fake.migrations().remove(0);
        assert_eq!((kind, vmid), (GuestKind::Qemu, 101));
        assert!(req.online && req.with_local_disks);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_rest() {
        let fake = FakeCluster::with_nodes(&["pve1", "pve2"]);
        fake.fail_migration(102);
        let vms = vec![
            guest(101, "a", "stopped", GuestKind::Qemu, "pve1"),
            guest(102, "b", "stopped", GuestKind::Qemu, "pve1"),
            guest(103, "c", "stopped", GuestKind::Qemu, "pve1"),
        ];

        let report = evacuate(&fake, "pve1", &plan(true), &vms, &[]).await.unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("VM 102: "));
        assert_eq!(fake.migrations().len(), 3);
        assert_eq!(report.vms.iter().map(|w| w.vmid).collect::<Vec<_>>(), vec![101, 103]);
    }

    #[tokio::test]
    async fn test_excluded_guests_untouched() {
        let fake = FakeCluster::with_nodes(&["pve1", "pve2"]);
        let vms = vec![guest(101, "web", "stopped", GuestKind::Qemu, "pve1")];
        let cts = vec![guest(101, "same-id-ct", "stopped", GuestKind::Lxc, "pve1")];
        let plan = MigrationPlan { exclude_vms: vec![101], ..plan(true) };

        let report = evacuate(&fake, "pve1", &plan, &vms, &cts).await.unwrap();

        assert_eq!(report.migrated, 1);
        assert_eq!(fake.migrations()[0].0, GuestKind::Lxc);
    }

    #[tokio::test]
    async fn test_bad_target_is_structural_error() {
        let fake = FakeCluster::with_nodes(&["pve1"]);
        let vms = vec![guest(101, "web", "stopped", GuestKind::Qemu, "pve1")];

        let same = MigrationPlan { target: "pve1".into(), ..Default::default() };
        assert!(matches!(evacuate(&fake, "pve1", &same, &vms, &[]).await, Err(MaintenanceError::InvalidTarget(_))));

        let empty = MigrationPlan::default();
        assert!(matches!(evacuate(&fake, "pve1", &empty, &vms, &[]).await, Err(MaintenanceError::InvalidTarget(_))));
        assert!(fake.migrations().is_empty());
    }
}
