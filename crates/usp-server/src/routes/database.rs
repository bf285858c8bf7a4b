//! Database engine routes.
//!
//! Lease ids are slash-hierarchical (`database/<config>/<role>/<uuid>`), so
//! the lease endpoints capture a wildcard and split the trailing verb off
//! themselves.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use usp_core::context::RequestContext;
use usp_core::database::{
    ConfigureDatabaseRequest, CreateRoleRequest, DatabaseConfigInfo, DatabaseCredentials,
};

use crate::error::{ApiError, api};
use crate::routes::authorize;
use crate::state::AppState;

/// Build the `/v1/database` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(list_configs))
        .route(
            "/config/{name}",
            post(configure).get(describe_config).delete(delete_config),
        )
        .route("/config/{name}/rotate-root", post(rotate_root))
        .route(
            "/roles/{name}/{role}",
            post(create_role).get(describe_role).delete(delete_role),
        )
        .route("/creds/{name}/{role}", get(credentials))
        .route("/leases/{*rest}", post(lease_action))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConfigureBody {
    pub plugin: String,
    pub connection_url: String,
    pub admin_username: String,
    pub admin_password: String,
    #[serde(default)]
    pub verify_connection: bool,
    pub max_open_connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RoleBody {
    pub creation_statements: Vec<String>,
    #[serde(default)]
    pub revocation_statements: Vec<String>,
    #[serde(default)]
    pub renew_statements: Vec<String>,
    pub default_ttl_secs: i64,
    pub max_ttl_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct RotateRootBody {
    pub statements: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RenewBody {
    pub ttl: i64,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub config: String,
    pub name: String,
    pub creation_statements: Vec<String>,
    pub revocation_statements: Vec<String>,
    pub default_ttl_secs: i64,
    pub max_ttl_secs: i64,
}

// ── Config handlers ──────────────────────────────────────────────────

async fn configure(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<ConfigureBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "database", Some(format!("database/config/{name}")), None)
        .await?;
    state
        .database
        .configure_database(
            &ctx,
            &name,
            ConfigureDatabaseRequest {
                plugin: body.plugin,
                connection_url: body.connection_url,
                admin_username: body.admin_username,
                admin_password: body.admin_password,
                verify_connection: body.verify_connection,
                max_open_connections: body
                    .max_open_connections
                    .or(Some(state.db_pool_default)),
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn describe_config(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<Json<DatabaseConfigInfo>, ApiError> {
    authorize(&state, &ctx, "sudo", "database", Some(format!("database/config/{name}")), None)
        .await?;
    let info = state.database.get_config(&name).await.map_err(api(&ctx))?;
    Ok(Json(info))
}

async fn list_configs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "sudo", "database", Some("database/config".to_owned()), None)
        .await?;
    let names = state.database.list_configs().await.map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({"configs": names})))
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "database", Some(format!("database/config/{name}")), None)
        .await?;
    state
        .database
        .delete_database_config(&ctx, &name)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_root(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<RotateRootBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "sudo", "database", Some(format!("database/config/{name}")), None)
        .await?;
    state
        .database
        .rotate_root_credentials(&ctx, &name, body.statements)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Role handlers ────────────────────────────────────────────────────

async fn create_role(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((name, role)): Path<(String, String)>,
    Json(body): Json<RoleBody>,
) -> Result<StatusCode, ApiError> {
    authorize(
        &state,
        &ctx,
        "sudo",
        "database",
        Some(format!("database/roles/{name}/{role}")),
        None,
    )
    .await?;
    state
        .database
        .create_role(
            &ctx,
            &name,
            &role,
            CreateRoleRequest {
                creation_statements: body.creation_statements,
                revocation_statements: body.revocation_statements,
                renew_statements: body.renew_statements,
                default_ttl_secs: body.default_ttl_secs,
                max_ttl_secs: body.max_ttl_secs,
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn describe_role(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((name, role)): Path<(String, String)>,
) -> Result<Json<RoleResponse>, ApiError> {
    authorize(
        &state,
        &ctx,
        "sudo",
        "database",
        Some(format!("database/roles/{name}/{role}")),
        None,
    )
    .await?;
    let record = state.database.get_role(&name, &role).await.map_err(api(&ctx))?;
    Ok(Json(RoleResponse {
        config: record.config,
        name: record.name,
        creation_statements: record.creation_statements,
        revocation_statements: record.revocation_statements,
        default_ttl_secs: record.default_ttl_secs,
        max_ttl_secs: record.max_ttl_secs,
    }))
}

async fn delete_role(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((name, role)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    authorize(
        &state,
        &ctx,
        "sudo",
        "database",
        Some(format!("database/roles/{name}/{role}")),
        None,
    )
    .await?;
    state
        .database
        .delete_role(&ctx, &name, &role)
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Credential / lease handlers ──────────────────────────────────────

async fn credentials(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((name, role)): Path<(String, String)>,
) -> Result<Json<DatabaseCredentials>, ApiError> {
    authorize(
        &state,
        &ctx,
        "read",
        "database",
        Some(format!("database/creds/{name}/{role}")),
        None,
    )
    .await?;
    let creds = state
        .database
        .generate_credentials(&ctx, &name, &role)
        .await
        .map_err(api(&ctx))?;
    Ok(Json(creds))
}

/// `POST /v1/database/leases/{lease_id}/renew` and `.../revoke`. The lease
/// id itself contains slashes, so the router hands us the whole tail.
async fn lease_action(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(rest): Path<String>,
    body: Option<Json<RenewBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(lease_id) = rest.strip_suffix("/renew") {
        authorize(&state, &ctx, "update", "database", Some(lease_id.to_owned()), None).await?;
        let Some(Json(body)) = body else {
            return Err(ApiError::validation(
                "renew requires a body with a ttl",
                ctx.correlation_id.clone(),
            ));
        };
        let expires_at = state
            .database
            .renew_lease(&ctx, lease_id, body.ttl)
            .await
            .map_err(api(&ctx))?;
        return Ok(Json(serde_json::json!({
            "lease_id": lease_id,
            "expires_at": expires_at.to_rfc3339(),
        })));
    }

    if let Some(lease_id) = rest.strip_suffix("/revoke") {
        authorize(&state, &ctx, "update", "database", Some(lease_id.to_owned()), None).await?;
        state
            .database
            .revoke_lease(&ctx, lease_id)
            .await
            .map_err(api(&ctx))?;
        return Ok(Json(serde_json::json!({
            "lease_id": lease_id,
            "revoked": true,
        })));
    }

    Err(ApiError::validation(
        "expected a trailing /renew or /revoke",
        ctx.correlation_id.clone(),
    ))
}
