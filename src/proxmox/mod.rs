// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Proxmox VE API client
//!
//! Only the slice of the PVE API that maintenance orchestration touches:
//! node listing and status, the node description (where the maintenance
//! marker lives), guest listings and guest migration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PveError {
    #[error("PVE request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("PVE API {status} {path}: {body}")]
    Api { status: u16, path: String, body: String },

    #[error("PVE response for {path}: {reason}")]
    Unexpected { path: String, reason: String },
}

impl PveError {
    fn unexpected(path: &str, reason: &str) -> Self {
        Self::Unexpected { path: path.to_string(), reason: reason.to_string() }
    }
}

/// The two kinds of guest PVE hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    /// Path segment used by the PVE API
    pub fn api_path(&self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Qemu => write!(f, "VM"),
            Self::Lxc => write!(f, "container"),
        }
    }
}

/// A VM or container on a Proxmox node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveGuest {
    pub vmid: u64,
    pub name: String,
    pub status: String,        // "running", "stopped"
    pub kind: GuestKind,
    pub maxmem: u64,           // bytes
    pub mem: u64,              // current usage bytes
    pub uptime: u64,           // seconds
    pub node: String,
}

impl PveGuest {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Name to show for the guest, falling back to "VM-101" / "CT-101"
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.kind {
            GuestKind::Qemu => format!("VM-{}", self.vmid),
            GuestKind::Lxc => format!("CT-{}", self.vmid),
        }
    }
}

/// Entry of the cluster-wide /nodes listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveNodeSummary {
    pub node: String,
    pub status: String,        // "online", "offline", "unknown"
}

impl PveNodeSummary {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// Node-level metrics from PVE API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveNodeStatus {
    pub node: String,
    pub cpu: f32,              // 0.0 - 1.0
    pub maxcpu: u32,
    pub mem_used: u64,
    pub mem_total: u64,
    pub uptime: u64,
}

/// Parameters of a guest migrate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRequest {
    pub target: String,
    pub online: bool,
    pub with_local_disks: bool,
}

impl MigrationRequest {
    pub fn online(target: &str) -> Self {
        Self { target: target.to_string(), online: true, with_local_disks: true }
    }

    pub fn offline(target: &str) -> Self {
        Self { target: target.to_string(), online: false, with_local_disks: true }
    }

    /// Form body for POST .../migrate. `online` is omitted entirely when unset.
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("target", self.target.clone())];
        if self.online {
            form.push(("online", "1".to_string()));
        }
        if self.with_local_disks {
            form.push(("with-local-disks", "1".to_string()));
        }
        form
    }
}

/// The cluster operations maintenance needs. Implemented by [`PveClient`];
/// tests swap in an in-memory cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<PveNodeSummary>, PveError>;
    async fn get_node_status(&self, node: &str) -> Result<PveNodeStatus, PveError>;
    async fn get_node_description(&self, node: &str) -> Result<String, PveError>;
    async fn set_node_description(&self, node: &str, description: &str) -> Result<(), PveError>;
    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuest>, PveError>;
    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuest>, PveError>;
    /// Returns the UPID of the migration task
    async fn migrate_vm(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError>;
    async fn migrate_container(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError>;
}

/// Proxmox VE API client for one cluster
pub struct PveClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    migrate_timeout: Duration,
}

impl PveClient {
    /// Create a new PVE API client
    /// token format: "PVEAPIToken=user@realm!tokenid=uuid" (prefix optional)
    pub fn new(address: &str, port: u16, token: &str, timeout: Duration, migrate_timeout: Duration) -> Result<Self, PveError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true) // PVE often uses self-signed certs
            .build()?;

        Ok(Self::with_client(format!("https://{}:{}", address, port), token, client, migrate_timeout))
    }

    /// Client against an explicit base URL, e.g. a plain-HTTP test server
    pub fn with_client(base_url: String, token: &str, client: reqwest::Client, migrate_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
            migrate_timeout,
        }
    }

    /// Build authorization header
    fn auth_header(&self) -> String {
        // If token already has the prefix, use as-is
        if self.token.starts_with("PVEAPIToken=") {
            self.token.clone()
        } else {
            format!("PVEAPIToken={}", self.token)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.base_url, path)
    }

    /// Turn a PVE response into its `data` payload
    async fn unwrap_data(path: &str, resp: reqwest::Response) -> Result<serde_json::Value, PveError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PveError::Api { status, path: path.to_string(), body });
        }

        let json: serde_json::Value = resp.json().await?;
        Ok(json.get("data").cloned().unwrap_or(json))
    }

    /// GET request to PVE API
    async fn get(&self, path: &str) -> Result<serde_json::Value, PveError> {
        debug!("PVE GET {}", path);
        let resp = self.client.get(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        Self::unwrap_data(path, resp).await
    }

    /// PUT request with a form body
    async fn put_form(&self, path: &str, form: &[(&str, String)]) -> Result<serde_json::Value, PveError> {
        debug!("PVE PUT {}", path);
        let resp = self.client.put(self.url(path))
            .header("Authorization", self.auth_header())
            .form(form)
            .send()
            .await?;
        Self::unwrap_data(path, resp).await
    }

    /// POST request with a form body and its own timeout
    async fn post_form(&self, path: &str, form: &[(&str, String)], timeout: Duration) -> Result<serde_json::Value, PveError> {
        debug!("PVE POST {}", path);
        let resp = self.client.post(self.url(path))
            .header("Authorization", self.auth_header())
            .timeout(timeout)
            .form(form)
            .send()
            .await?;
        Self::unwrap_data(path, resp).await
    }

    /// List guests of one kind on a node
    async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<PveGuest>, PveError> {
        let path = format!("/nodes/{}/{}", node, kind.api_path());
        let data = self.get(&path).await?;
        let arr = data.as_array().ok_or_else(|| PveError::unexpected(&path, "expected array"))?;

        Ok(arr.iter().map(|v| {
            // Name fallback: name -> hostname -> ""
            let name = v.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
                .or_else(|| v.get("hostname").and_then(|v| v.as_str()).filter(|s| !s.is_empty()))
                .unwrap_or("").to_string();
            PveGuest {
                vmid: parse_vmid(v.get("vmid")),
                name,
                status: v.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
                kind,
                maxmem: v.get("maxmem").and_then(|v| v.as_u64()).unwrap_or(0),
                mem: v.get("mem").and_then(|v| v.as_u64()).unwrap_or(0),
                uptime: v.get("uptime").and_then(|v| v.as_u64()).unwrap_or(0),
                node: node.to_string(),
            }
        }).collect())
    }

    async fn migrate(&self, node: &str, kind: GuestKind, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        let path = format!("/nodes/{}/{}/{}/migrate", node, kind.api_path(), vmid);
        let data = self.post_form(&path, &req.form(), self.migrate_timeout).await?;
        let upid = data.as_str().unwrap_or("ok").to_string();
        info!("PVE migrate {} {} on {} -> {} (online={}): {}", kind, vmid, node, req.target, req.online, upid);
        Ok(upid)
    }

    /// Test connectivity — try to reach the PVE API
    pub async fn test_connection(&self) -> Result<String, PveError> {
        let data = self.get("/version").await?;
        let version = data.get("version").and_then(|v| v.as_str()).unwrap_or("unknown");
        let release = data.get("release").and_then(|v| v.as_str()).unwrap_or("");
        Ok(format!("Proxmox VE {} ({})", version, release))
    }
}

/// PVE reports vmid as a number for qemu and sometimes as a string for lxc
fn parse_vmid(v: Option<&serde_json::Value>) -> u64 {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl ClusterClient for PveClient {
    async fn list_nodes(&self) -> Result<Vec<PveNodeSummary>, PveError> {
        let data = self.get("/nodes").await?;
        let arr = data.as_array().ok_or_else(|| PveError::unexpected("/nodes", "expected array"))?;
        Ok(arr.iter()
            .filter_map(|v| {
                let node = v.get("node").and_then(|n| n.as_str())?;
                Some(PveNodeSummary {
                    node: node.to_string(),
                    status: v.get("status").and_then(|s| s.as_str()).unwrap_or("unknown").to_string(),
                })
            })
            .collect())
    }

    async fn get_node_status(&self, node: &str) -> Result<PveNodeStatus, PveError> {
        let data = self.get(&format!("/nodes/{}/status", node)).await?;
        Ok(PveNodeStatus {
            node: node.to_string(),
            cpu: data.get("cpu").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
            maxcpu: data.get("cpuinfo").and_then(|v| v.get("cpus")).and_then(|v| v.as_u64()).unwrap_or(1) as u32,
            mem_used: data.get("memory").and_then(|v| v.get("used")).and_then(|v| v.as_u64()).unwrap_or(0),
            mem_total: data.get("memory").and_then(|v| v.get("total")).and_then(|v| v.as_u64()).unwrap_or(1),
            uptime: data.get("uptime").and_then(|v| v.as_u64()).unwrap_or(0),
        })
    }

    async fn get_node_description(&self, node: &str) -> Result<String, PveError> {
        let data = self.get(&format!("/nodes/{}/config", node)).await?;
        Ok(data.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string())
    }

    async fn set_node_description(&self, node: &str, description: &str) -> Result<(), PveError> {
        self.put_form(&format!("/nodes/{}/config", node), &[("description", description.to_string())]).await?;
        Ok(())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuest>, PveError> {
        self.list_guests(node, GuestKind::Qemu).await
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuest>, PveError> {
        self.list_guests(node, GuestKind::Lxc).await
    }

    async fn migrate_vm(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        self.migrate(node, GuestKind::Qemu, vmid, req).await
    }

    async fn migrate_container(&self, node: &str, vmid: u64, req: &MigrationRequest) -> Result<String, PveError> {
        self.migrate(node, GuestKind::Lxc, vmid, req).await
    }
}
