// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! REST API for node maintenance

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::TokenAuth;
use crate::maintenance::controller::{EnableRequest, Origin, ScheduleRequest};
use crate::maintenance::sweep::Sweeper;
use crate::maintenance::{MaintenanceController, MaintenanceError};

/// Shared application state
pub struct AppState {
    pub controller: Arc<MaintenanceController>,
    pub sweeper: Arc<Sweeper>,
    pub auth: TokenAuth,
}

// ─── Helpers ───

/// Check if request is authenticated; returns username or error response
pub fn require_auth(req: &HttpRequest, state: &web::Data<AppState>) -> Result<String, HttpResponse> {
    state.auth.authenticate(req).map_err(|failure| {
        HttpResponse::Unauthorized().json(serde_json::json!({
            "error": failure.message()
        }))
    })
}

/// Map a maintenance error onto an HTTP status
fn error_response(e: &MaintenanceError) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        MaintenanceError::ClusterNotFound(_) | MaintenanceError::NodeNotFound { .. } => HttpResponse::NotFound().json(body),
        MaintenanceError::InvalidSchedule(_) | MaintenanceError::InvalidTarget(_) => HttpResponse::BadRequest().json(body),
        MaintenanceError::ScheduleBusy(_) => HttpResponse::Conflict().json(body),
        MaintenanceError::Remote(_) => HttpResponse::BadGateway().json(body),
    }
}

/// Middleware: kick off a sweep in the background on every request, so
/// due windows are handled even if the timer lags
pub async fn sweep_on_request(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    if let Some(state) = req.app_data::<web::Data<AppState>>() {
        state.sweeper.trigger();
    }
    next.call(req).await
}

#[derive(Deserialize)]
pub struct NodeFilter {
    pub cluster: Option<String>,
    pub node: Option<String>,
}

// ─── Overview & history ───

/// GET /api/maintenance — every cluster's nodes, schedules and history
pub async fn overview(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    HttpResponse::Ok().json(state.controller.overview().await)
}

/// GET /api/maintenance/history
pub async fn history(req: HttpRequest, state: web::Data<AppState>, query: web::Query<NodeFilter>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    HttpResponse::Ok().json(state.controller.history(query.cluster.as_deref(), query.node.as_deref()))
}

/// GET /api/maintenance/schedules — windows that have not completed
pub async fn schedules(req: HttpRequest, state: web::Data<AppState>, query: web::Query<NodeFilter>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    HttpResponse::Ok().json(state.controller.pending_schedules(query.cluster.as_deref(), query.node.as_deref()))
}

/// POST /api/maintenance/sweep — run the scheduler now
pub async fn sweep_now(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    match state.sweeper.run_once().await {
        Some(report) => HttpResponse::Ok().json(report),
        None => HttpResponse::Conflict().json(serde_json::json!({
            "error": "A maintenance sweep is already running"
        })),
    }
}

// ─── Per-node maintenance ───

/// GET /api/clusters/{cluster}/nodes/{node}/maintenance
pub async fn node_status(req: HttpRequest, state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    let (cluster, node) = path.into_inner();
    match state.controller.node_overview(&cluster, &node).await {
        Ok(overview) => HttpResponse::Ok().json(overview),
        Err(e) => error_response(&e),
    }
}

/// POST /api/clusters/{cluster}/nodes/{node}/maintenance/enable
pub async fn enable(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let user = match require_auth(&req, &state) { Ok(u) => u, Err(resp) => return resp };
    let (cluster, node) = path.into_inner();

    // An empty body means plain maintenance; anything else must parse
    let body: EnableRequest = if body.iter().all(u8::is_ascii_whitespace) {
        EnableRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Invalid request body: {}", e)
            })),
        }
    };

    match state.controller.enable(&cluster, &node, &body, Origin::user(&user)).await {
        Ok(outcome) => {
            let message = match outcome.record.migration_details.as_ref() {
                Some(details) if body.evacuate => format!(
                    "Started migration of {} resources to node {}", outcome.migrated, details.target_node
                ),
                _ => format!("Node {} is now in maintenance mode", node),
            };
            HttpResponse::Ok().json(serde_json::json!({
                "record": outcome.record,
                "migrated": outcome.migrated,
                "warnings": outcome.warnings,
                "message": message,
            }))
        }
        Err(e) => error_response(&e),
    }
}

/// POST /api/clusters/{cluster}/nodes/{node}/maintenance/disable
pub async fn disable(req: HttpRequest, state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    let (cluster, node) = path.into_inner();
    match state.controller.disable(&cluster, &node).await {
        Ok(record) => HttpResponse::Ok().json(serde_json::json!({
            "record": record,
            "message": format!("Node {} is no longer in maintenance mode", node),
        })),
        Err(e) => error_response(&e),
    }
}

/// POST /api/clusters/{cluster}/nodes/{node}/maintenance/schedule
pub async fn schedule(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<ScheduleRequest>,
) -> HttpResponse {
    let user = match require_auth(&req, &state) { Ok(u) => u, Err(resp) => return resp };
    let (cluster, node) = path.into_inner();
    match state.controller.schedule(&cluster, &node, &body, &user).await {
        Ok(window) => HttpResponse::Ok().json(window),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/clusters/{cluster}/nodes/{node}/maintenance/schedule/{id}
pub async fn cancel_schedule(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> HttpResponse {
    if let Err(resp) = require_auth(&req, &state) { return resp; }
    let (cluster, node, id) = path.into_inner();
    match state.controller.cancel_schedule(&id, &cluster, &node).await {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({
            "removed": removed.is_some(),
            "schedule": removed,
        })),
        Err(e) => error_response(&e),
    }
}

/// Configure all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/api/maintenance", web::get().to(overview))
        .route("/api/maintenance/history", web::get().to(history))
        .route("/api/maintenance/schedules", web::get().to(schedules))
        .route("/api/maintenance/sweep", web::post().to(sweep_now))
        .route("/api/clusters/{cluster}/nodes/{node}/maintenance", web::get().to(node_status))
        .route("/api/clusters/{cluster}/nodes/{node}/maintenance/enable", web::post().to(enable))
        .route("/api/clusters/{cluster}/nodes/{node}/maintenance/disable", web::post().to(disable))
        .route("/api/clusters/{cluster}/nodes/{node}/maintenance/schedule", web::post().to(schedule))
        .route("/api/clusters/{cluster}/nodes/{node}/maintenance/schedule/{id}", web::delete().to(cancel_schedule));
}
