//! Seal plane and system routes.
//!
//! `/v1/seal/*` drives the seal state machine and authenticates with the
//! bootstrap credential (enforced by the middleware). `/v1/sys/*` carries
//! the health probe, the audit-chain acknowledgement, and rotation-job
//! administration.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use usp_core::context::RequestContext;
use usp_core::lease::RotationKind;
use usp_core::seal::SealStateKind;

use crate::error::{ApiError, api};
use crate::routes::authorize;
use crate::state::AppState;

/// Build the `/v1/seal` router.
pub fn seal_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/init", post(init))
        .route("/unseal", post(unseal))
        .route("/seal", post(seal))
        .route("/status", get(status))
}

/// Build the `/v1/sys` router.
pub fn sys_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/audit/ack", post(audit_ack))
        .route("/rotation", get(list_rotation_jobs).post(create_rotation_job))
        .route("/rotation/{id}", axum::routing::delete(delete_rotation_job))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    /// Number of shares to deal. Falls back to the configured default.
    pub shares: Option<u8>,
    /// Recovery threshold. Falls back to the configured default.
    pub threshold: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    /// Base64 KEK shares — shown once.
    pub shares: Vec<String>,
    /// Root API token — shown once.
    pub root_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsealRequest {
    pub share: String,
}

#[derive(Debug, Serialize)]
pub struct UnsealResponse {
    pub state: SealStateKind,
    pub progress: u8,
    pub threshold: u8,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: SealStateKind,
    pub initialized: bool,
    pub sealed: bool,
    pub threshold: u8,
    pub shares: u8,
    pub progress: u8,
    pub audit_chain_broken: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateRotationJobRequest {
    pub kind: RotationKind,
    pub interval_secs: i64,
}

// ── Seal handlers ────────────────────────────────────────────────────

async fn init(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    let shares = body.shares.unwrap_or(state.default_shares);
    let threshold = body.threshold.unwrap_or(state.default_threshold);
    let result = state
        .seal
        .init(&ctx, shares, threshold)
        .await
        .map_err(api(&ctx))?;
    Ok(Json(InitResponse {
        shares: result.shares,
        root_token: result.root_token,
    }))
}

async fn unseal(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<UnsealResponse>, ApiError> {
    let progress = state
        .seal
        .submit_share(&ctx, &body.share)
        .await
        .map_err(api(&ctx))?;

    match progress {
        Some(p) => Ok(Json(UnsealResponse {
            state: SealStateKind::Unsealing,
            progress: p.progress,
            threshold: p.threshold,
        })),
        None => Ok(Json(UnsealResponse {
            state: SealStateKind::Unsealed,
            progress: 0,
            threshold: 0,
        })),
    }
}

async fn seal(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<StatusCode, ApiError> {
    state.seal.seal(&ctx).await.map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.seal.status().await.map_err(api(&ctx))?;
    Ok(Json(StatusResponse {
        state: status.state,
        initialized: status.initialized,
        sealed: status.sealed,
        threshold: status.threshold,
        shares: status.shares,
        progress: status.progress,
        audit_chain_broken: state.audit.is_broken().await,
    }))
}

// ── System handlers ──────────────────────────────────────────────────

/// Health probe: 200 unsealed, 503 sealed, 501 uninitialized. No auth.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.seal.status().await {
        Ok(s) if !s.initialized => (
            StatusCode::NOT_IMPLEMENTED,
            Json(serde_json::json!({"initialized": false, "sealed": true})),
        ),
        Ok(s) if s.sealed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"initialized": true, "sealed": true})),
        ),
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({"initialized": true, "sealed": false})),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "status unavailable"})),
        ),
    }
}

/// Operator acknowledgement of a broken audit chain.
async fn audit_ack(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "sys/audit", None, None).await?;
    state.audit.acknowledge_break().await.map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_rotation_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateRotationJobRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "sudo", "sys/rotation", None, None).await?;
    let job = state
        .lease_manager
        .create_rotation_job(&ctx, body.kind, body.interval_secs)
        .await
        .map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({
        "id": job.id,
        "next_execution_at": job.next_execution_at.to_rfc3339(),
    })))
}

async fn list_rotation_jobs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "sudo", "sys/rotation", None, None).await?;
    let jobs = state
        .lease_manager
        .list_rotation_jobs()
        .await
        .map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({ "jobs": jobs })))
}

async fn delete_rotation_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "sys/rotation", None, None).await?;
    state
        .lease_manager
        .delete_rotation_job(&id)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}
