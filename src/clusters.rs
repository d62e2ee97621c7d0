// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Connection table — one Proxmox API client per configured cluster

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::proxmox::{ClusterClient, PveClient};

pub struct ClusterRegistry {
    clients: RwLock<HashMap<String, Arc<dyn ClusterClient>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Build a client for every configured cluster. Clusters whose client
    /// cannot be constructed are logged and left out.
    pub fn from_config(config: &Config) -> Self {
        let registry = Self::new();
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let migrate_timeout = Duration::from_secs(config.migrate_timeout_secs);

        for cluster in &config.clusters {
            match PveClient::new(&cluster.address, cluster.port, &cluster.token, timeout, migrate_timeout) {
                Ok(client) => {
                    let client = Arc::new(client);
                    let id = cluster.id.clone();
                    let probe = client.clone();
                    // Probe in the background; an unreachable cluster must not block startup
                    tokio::spawn(async move {
                        match probe.test_connection().await {
                            Ok(version) => info!("Cluster {}: {}", id, version),
                            Err(e) => warn!("Cluster {} unreachable: {}", id, e),
                        }
                    });
                    registry.insert(&cluster.id, client);
                }
                Err(e) => warn!("Skipping cluster {}: {}", cluster.id, e),
            }
        }
        registry
    }

    pub fn insert(&self, id: &str, client: Arc<dyn ClusterClient>) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.insert(id.to_string(), client);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ClusterClient>> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.get(id).cloned()
    }

    /// Snapshot of (cluster id, client), sorted by id
    pub fn all(&self) -> Vec<(String, Arc<dyn ClusterClient>)> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = clients.iter().map(|(id, c)| (id.clone(), c.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn ids(&self) -> Vec<String> {
        self.all().into_iter().map(|(id, _)| id).collect()
    }
}
