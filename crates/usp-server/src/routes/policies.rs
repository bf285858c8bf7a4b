//! Policy administration routes. All operations require the `sudo`
//! capability on `policies/<id>` (the built-in root policy grants it to
//! the root role).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use usp_core::context::RequestContext;
use usp_core::policy::{DefaultEffect, PolicyKind, PolicyRecord};

use crate::error::{ApiError, api};
use crate::routes::authorize;
use crate::state::AppState;

/// Build the policies router. Defined with full paths (rather than nested)
/// so the collection route matches `/v1/policies` exactly.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/policies", get(list))
        .route(
            "/v1/policies/{id}",
            get(read).post(write).put(write).delete(delete),
        )
}

#[derive(Debug, Deserialize)]
pub struct PolicyBody {
    pub name: String,
    pub kind: PolicyKind,
    pub body: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_effect")]
    pub effect_default: DefaultEffect,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_effect() -> DefaultEffect {
    DefaultEffect::Deny
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub id: String,
    pub name: String,
    pub kind: PolicyKind,
    pub body: String,
    pub priority: i64,
    pub effect_default: DefaultEffect,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "sudo", "policies", Some("policies".to_owned()), None).await?;
    let ids = state.policies.list().await.map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({"policies": ids})))
}

async fn read(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    authorize(&state, &ctx, "sudo", "policies", Some(format!("policies/{id}")), None).await?;
    let record = state.policies.get(&id).await.map_err(api(&ctx))?;
    Ok(Json(PolicyResponse {
        id: record.id,
        name: record.name,
        kind: record.kind,
        body: record.body,
        priority: record.priority,
        effect_default: record.effect_default,
        active: record.active,
        created_at: record.created_at.to_rfc3339(),
        updated_at: record.updated_at.to_rfc3339(),
    }))
}

async fn write(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<PolicyBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "policies", Some(format!("policies/{id}")), None).await?;

    let created_at = match state.policies.get(&id).await {
        Ok(existing) => existing.created_at,
        Err(_) => Utc::now(),
    };
    state
        .policies
        .put(
            &ctx,
            PolicyRecord {
                id,
                name: body.name,
                kind: body.kind,
                body: body.body,
                priority: body.priority,
                effect_default: body.effect_default,
                active: body.active,
                created_at,
                updated_at: Utc::now(),
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "policies", Some(format!("policies/{id}")), None).await?;
    state.policies.delete(&ctx, &id).await.map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}
