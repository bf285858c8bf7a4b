//! KV v2 routes.
//!
//! - `GET/POST/DELETE /v1/kv/data/{*path}` — read, write, soft-delete
//! - `POST /v1/kv/undelete/{*path}` — clear soft-deletes
//! - `POST /v1/kv/destroy/{*path}` — destroy versions (sudo)
//! - `GET/DELETE /v1/kv/metadata/{*path}` — version map / destroy entity;
//!   `?list=true` lists immediate children instead

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use usp_core::context::RequestContext;
use usp_core::kv::{KvVersionInfo, KvWriteRequest};

use crate::error::{ApiError, api};
use crate::routes::authorize;
use crate::state::AppState;

/// Build the `/v1/kv` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/data/{*path}",
            get(read_secret).post(write_secret).delete(soft_delete),
        )
        .route("/undelete/{*path}", post(undelete))
        .route("/destroy/{*path}", post(destroy))
        .route("/metadata/{*path}", get(metadata).delete(destroy_metadata))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub version: Option<u64>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub cas: Option<u64>,
    pub cas_required: Option<bool>,
    pub max_versions: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionsBody {
    #[serde(default)]
    pub versions: Vec<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataQuery {
    #[serde(default)]
    pub list: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub version: u64,
    pub created_at: String,
    pub soft_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub version: u64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub path: String,
    pub current_version: u64,
    pub max_versions: u32,
    pub cas_required: bool,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
    pub versions: Vec<KvVersionInfo>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub keys: Vec<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn read_secret(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<ReadResponse>, ApiError> {
    authorize(&state, &ctx, "read", "kv", Some(format!("kv/data/{path}")), None).await?;
    if query.include_deleted {
        // Reading through a soft-delete is a privileged recovery path.
        authorize(&state, &ctx, "sudo", "kv", Some(format!("kv/data/{path}")), None).await?;
    }

    let read = state
        .kv
        .read(&ctx, &path, query.version, query.include_deleted)
        .await
        .map_err(api(&ctx))?;
    Ok(Json(ReadResponse {
        data: read.data,
        version: read.version,
        created_at: read.created_at.to_rfc3339(),
        soft_deleted: read.soft_deleted,
    }))
}

async fn write_secret(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<Json<WriteResponse>, ApiError> {
    // First write (cas 0 or absent secret) is a create; later writes are
    // updates. Callers granting both capabilities on a subtree see the
    // Vault-compatible behavior.
    let action = if body.cas == Some(0) { "create" } else { "update" };
    authorize(&state, &ctx, action, "kv", Some(format!("kv/data/{path}")), None).await?;

    let response = state
        .kv
        .write(
            &ctx,
            &path,
            KvWriteRequest {
                data: body.data,
                cas: body.cas,
                cas_required: body.cas_required,
                max_versions: body.max_versions,
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(Json(WriteResponse {
        version: response.version,
        created_at: response.created_at.to_rfc3339(),
    }))
}

async fn soft_delete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    body: Option<Json<VersionsBody>>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "delete", "kv", Some(format!("kv/data/{path}")), None).await?;
    let versions = body.map(|Json(b)| b.versions).unwrap_or_default();
    state
        .kv
        .soft_delete(&ctx, &path, &versions)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn undelete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    Json(body): Json<VersionsBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "update", "kv", Some(format!("kv/data/{path}")), None).await?;
    state
        .kv
        .undelete(&ctx, &path, &body.versions)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    Json(body): Json<VersionsBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "kv", Some(format!("kv/data/{path}")), None).await?;
    state
        .kv
        .destroy(&ctx, &path, &body.versions)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metadata(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
    Query(query): Query<MetadataQuery>,
) -> Result<axum::response::Response, ApiError> {
    use axum::response::IntoResponse;

    if query.list {
        authorize(&state, &ctx, "list", "kv", Some(format!("kv/metadata/{path}")), None).await?;
        let keys = state.kv.list(&ctx, &path).await.map_err(api(&ctx))?;
        return Ok(Json(ListResponse { keys }).into_response());
    }

    authorize(&state, &ctx, "read", "kv", Some(format!("kv/metadata/{path}")), None).await?;
    let (meta, versions) = state.kv.metadata(&ctx, &path).await.map_err(api(&ctx))?;
    Ok(Json(MetadataResponse {
        path: meta.path,
        current_version: meta.current_version,
        max_versions: meta.max_versions,
        cas_required: meta.cas_required,
        deleted: meta.deleted,
        created_at: meta.created_at.to_rfc3339(),
        updated_at: meta.updated_at.to_rfc3339(),
        versions,
    })
    .into_response())
}

async fn destroy_metadata(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "delete", "kv", Some(format!("kv/metadata/{path}")), None).await?;
    state
        .kv
        .destroy_metadata(&ctx, &path)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}
