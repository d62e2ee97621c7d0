// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! In-memory cluster used by the maintenance tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::proxmox::{
    ClusterClient, GuestKind, MigrationRequest, PveError, PveGuest, PveNodeStatus, PveNodeSummary,
};

/// A call the fake received, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListNodes,
    NodeStatus(String),
    GetDescription(String),
    SetDescription(String, String),
    ListVms(String),
    ListContainers(String),
    Migrate { kind: GuestKind, node: String, vmid: u64, req: MigrationRequest },
}

#[derive(Default)]
struct FakeState {
    nodes: Vec<PveNodeSummary>,
    descriptions: HashMap<String, String>,
    guests: Vec<PveGuest>,
    failing_vmids: HashSet<u64>,
    fail_descriptions: bool,
    description_delay: Option<Duration>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

pub fn guest(vmid: u64, name: &str, status: &str, kind: GuestKind, node: &str) -> PveGuest {
    PveGuest {
        vmid,
        name: name.to_string(),
        status: status.to_string(),
        kind,
        maxmem: 0,
        mem: 0,
        uptime: 0,
        node: node.to_string(),
    }
}

impl FakeCluster {
    /// Cluster with online nodes named `nodes`, each with an empty description
    pub fn with_nodes(nodes: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            for node in nodes {
                state.nodes.push(PveNodeSummary { node: node.to_string(), status: "online".into() });
                state.descriptions.insert(node.to_string(), String::new());
            }
        }
        fake
    }

    pub fn add_guest(&self, guest: PveGuest) {
        self.state.lock().unwrap().guests.push(guest);
    }

    pub fn set_description(&self, node: &str, description: &str) {
        self.state.lock().unwrap().descriptions.insert(node.to_string(), description.to_string());
    }

    pub fn description(&self, node: &str) -> String {
        self.state.lock().unwrap().descriptions.get(node).cloned().unwrap_or_default()
    }

    /// Make every migrate call for `vmid` fail
    pub fn fail_migration(&self, vmid: u64) {
        self.state.lock().unwrap().failing_vmids.insert(vmid);
    }

    /// Make description reads and writes fail
    pub fn fail_descriptions(&self, fail: bool) {
        self.state.lock().unwrap().fail_descriptions = fail;
    }

    /// Make description reads take `delay` before answering
    pub fn delay_descriptions(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().description_delay = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn migrations(&self) -> Vec<(GuestKind, u64, MigrationRequest)> {
        self.calls().into_iter()
            .filter_map(|c| match c {
                Call::Migrate { kind, vmid, req, .. } => Some((kind, vmid, req)),
                _ => None,
            })
            .collect()
    }

    pub fn description_writes(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::SetDescription(..))).count()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn guests(&self, node: &str, kind: GuestKind) -> Vec<PveGuest> {
        self.state.lock().unwrap().guests.iter()
            .filter(|g| g.node == node && g.kind == kind)
            .cloned()
            .collect()
    }

    fn migrate(&self, kind: GuestKind, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        self.record(Call::Migrate { kind, node: node.to_string(), vmid, req: req.clone() });
        if self.state.lock().unwrap().failing_vmids.contains(&vmid) {
            return Err(api_error(&format!("/nodes/{}/{}/{}/migrate", node, kind.api_path(), vmid), "guest is locked"));
        }
        Ok(format!("UPID:{}:{}:migrate", node, vmid))
    }
}

fn api_error(path: &str, body: &str) -> PveError {
    PveError::Api { status: 500, path: path.to_string(), body: body.to_string() }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<PveNodeSummary>, PveError> {
        self.record(Call::ListNodes);
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn get_node_status(&self, node: &str) -> Result<PveNodeStatus, PveError> {
        self.record(Call::NodeStatus(node.to_string()));
        Ok(PveNodeStatus { node: node.to_string(), cpu: 0.1, maxcpu: 8, mem_used: 1, mem_total: 2, uptime: 100 })
    }

    async fn get_node_description(&self, node: &str) -> Result<String, PveError> {
        self.record(Call::GetDescription(node.to_string()));
        let delay = self.state.lock().unwrap().description_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail_descriptions {
            return Err(api_error(&format!("/nodes/{}/config", node), "connection reset"));
        }
        Ok(state.descriptions.get(node).cloned().unwrap_or_default())
    }

    async fn set_node_description(&self, node: &str, description: &str) -> Result<(), PveError> {
        self.record(Call::SetDescription(node.to_string(), description.to_string()));
        let mut state = self.state.lock().unwrap();
        if state.fail_descriptions {
            return Err(api_error(&format!("/nodes/{}/config", node), "connection reset"));
        }
        state.descriptions.insert(node.to_string(), description.to_string());
        Ok(())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuest>, PveError> {
        self.record(Call::ListVms(node.to_string()));
        Ok(self.guests(node, GuestKind::Qemu))
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuest>, PveError> {
        self.record(Call::ListContainers(node.to_string()));
        Ok(self.guests(node, GuestKind::Lxc))
    }

    async fn migrate_vm(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        self.migrate(GuestKind::Qemu, node, vmid, req)
    }

    async fn migrate_container(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        self.migrate(GuestKind::Lxc, node, vmid, req)
    }
}
