// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WolfMaint — Node maintenance orchestration for Proxmox VE clusters
//!
//! - Puts nodes into and out of maintenance mode (a marker in the node description)
//! - Evacuates VMs and containers to another node on request
//! - Runs scheduled maintenance windows
//! - Keeps a history of every maintenance period

mod api;
mod auth;
mod clusters;
mod config;
mod maintenance;
mod proxmox;

use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clusters::ClusterRegistry;
use crate::config::Config;
use crate::maintenance::sweep::Sweeper;
use crate::maintenance::{MaintenanceController, MaintenanceStore};

/// WolfMaint — Proxmox node maintenance orchestration
#[derive(Parser)]
#[command(name = "wolfmaint", version, about = "Maintenance mode and scheduled maintenance for Proxmox VE nodes")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8554)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Config file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TLS certificate path (PEM)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long)]
    tls_key: Option<String>,

    /// Print the SHA-256 of an API token for the config's [[users]] and exit
    #[arg(long, value_name = "TOKEN")]
    hash_token: Option<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wolfmaint=info".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    // --hash-token: print digest and exit
    if let Some(token) = cli.hash_token.as_deref() {
        println!("{}", auth::hash_token(token));
        return Ok(());
    }

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let config = Config::load(&cli.config);

    info!("");
    info!("  🛠  WolfMaint v{}", env!("CARGO_PKG_VERSION"));
    info!("  ────────────────────────────────────");
    info!("  Host:      {}", hostname);
    info!("  Config:    {}", cli.config.display());
    info!("  State:     {}", config.state_file);
    info!("  Sweep:     every {}s", config.sweep_interval_secs);

    let registry = Arc::new(ClusterRegistry::from_config(&config));
    let ids = registry.ids();
    if ids.is_empty() {
        tracing::warn!("No clusters configured — add [[clusters]] entries to {}", cli.config.display());
    } else {
        info!("  Clusters:  {}", ids.join(", "));
    }
    info!("");

    let store = Arc::new(MaintenanceStore::open(&config.state_file));
    let controller = Arc::new(MaintenanceController::new(registry, store));
    let sweeper = Arc::new(Sweeper::new(controller.clone()));
    sweeper.spawn_timer(Duration::from_secs(config.sweep_interval_secs));

    let app_state = web::Data::new(api::AppState {
        controller,
        sweeper,
        auth: auth::TokenAuth::new(config.users.clone()),
    });

    // Load TLS with OpenSSL, falling back to HTTP if anything goes wrong
    let tls_paths = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };
    let ssl_builder = tls_paths.as_ref().and_then(|(cert_path, key_path)| {
        use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

        let mut builder = match SslAcceptor::mozilla_intermediate(SslMethod::tls()) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Failed to create SSL acceptor: {} — falling back to HTTP", e);
                return None;
            }
        };

        if let Err(e) = builder.set_certificate_chain_file(cert_path) {
            tracing::warn!("Cannot load TLS cert '{}': {} — falling back to HTTP", cert_path, e);
            return None;
        }

        if let Err(e) = builder.set_private_key_file(key_path, SslFiletype::PEM) {
            tracing::warn!("Cannot load TLS key '{}': {} — falling back to HTTP", key_path, e);
            return None;
        }

        Some(builder)
    });

    let bind = format!("{}:{}", cli.bind, cli.port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::from_fn(api::sweep_on_request))
            .configure(api::configure)
    });

    match ssl_builder {
        Some(ssl_builder) => {
            info!("  🔒 TLS enabled — https://{}", bind);
            server
                .bind_openssl(&bind, ssl_builder)
                .map_err(|e| {
                    tracing::error!("❌ Failed to bind HTTPS on {}: {}", bind, e);
                    e
                })?
                .run()
                .await
        }
        None => {
            if tls_paths.is_some() {
                info!("  ⚠️  TLS certificates failed to load — running HTTP only");
            }
            info!("  ⚡ API: http://{}", bind);
            server.bind(&bind)?.run().await
        }
    }
}
