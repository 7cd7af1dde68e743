//! Read-only HTTP endpoints for probes and dashboards.

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::debug;

use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub username: String,
    pub color: String,
}

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.room.stats().await)
}

pub async fn session(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let username = path.into_inner();
    debug!("Session lookup for {}", username);

    let handle = state
        .room
        .registry()
        .get_by_username(&username)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no active session for {}", username)))?;

    Ok(HttpResponse::Ok().json(SessionInfo {
        id: handle.id().to_string(),
        username: handle.username().to_string(),
        color: handle.color().to_string(),
    }))
}

/// Mounts every route on an actix `App`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/stats", web::get().to(stats))
        .route("/sessions/{username}", web::get().to(session));
}
