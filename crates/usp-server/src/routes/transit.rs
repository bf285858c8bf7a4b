//! Transit routes.
//!
//! Plaintext, context, and sign/verify inputs travel base64-encoded;
//! ciphertexts and signatures use the `vault:v<N>:<base64url>` string form.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use usp_core::context::RequestContext;
use usp_core::transit::{CreateKeyOptions, TransitAlgorithm, TransitKeyInfo, UpdateKeyConfig};

use crate::error::{ApiError, api};
use crate::routes::authorize;
use crate::state::AppState;

/// Build the `/v1/transit` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keys", get(list_keys))
        .route(
            "/keys/{name}",
            post(create_key).get(describe_key).delete(delete_key),
        )
        .route("/keys/{name}/rotate", post(rotate_key))
        .route("/keys/{name}/config", post(update_config))
        .route("/encrypt/{name}", post(encrypt))
        .route("/decrypt/{name}", post(decrypt))
        .route("/sign/{name}", post(sign))
        .route("/verify/{name}", post(verify))
        .route("/export/{name}", get(export_key))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default = "default_algorithm")]
    pub algorithm: TransitAlgorithm,
    #[serde(default)]
    pub exportable: bool,
    #[serde(default)]
    pub deletion_allowed: bool,
}

fn default_algorithm() -> TransitAlgorithm {
    TransitAlgorithm::Aes256Gcm
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigBody {
    pub min_decryption_version: Option<u32>,
    pub deletion_allowed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct EncryptBody {
    /// Base64 plaintext.
    pub plaintext: String,
    /// Base64 derivation context.
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecryptBody {
    pub ciphertext: String,
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignBody {
    /// Base64 digest to sign.
    pub input: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub input: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct CiphertextResponse {
    pub ciphertext: String,
}

#[derive(Debug, Serialize)]
pub struct PlaintextResponse {
    /// Base64 plaintext.
    pub plaintext: String,
}

#[derive(Debug, Serialize)]
pub struct SignatureResponse {
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct KeyListResponse {
    pub keys: Vec<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

fn decode_b64(field: &str, value: &str, ctx: &RequestContext) -> Result<Vec<u8>, ApiError> {
    BASE64.decode(value).map_err(|e| {
        ApiError::validation(format!("{field} is not valid base64: {e}"), &*ctx.correlation_id)
    })
}

fn decode_context(
    context: Option<&String>,
    ctx: &RequestContext,
) -> Result<Option<Vec<u8>>, ApiError> {
    context
        .map(|c| decode_b64("context", c, ctx))
        .transpose()
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<CreateKeyBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "create", "transit", Some(format!("transit/keys/{name}")), None)
        .await?;
    state
        .transit
        .create_key(
            &ctx,
            &name,
            body.algorithm,
            CreateKeyOptions {
                exportable: body.exportable,
                deletion_allowed: body.deletion_allowed,
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn describe_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<Json<TransitKeyInfo>, ApiError> {
    authorize(&state, &ctx, "read", "transit", Some(format!("transit/keys/{name}")), None)
        .await?;
    let info = state.transit.key_info(&name).await.map_err(api(&ctx))?;
    Ok(Json(info))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "delete", "transit", Some(format!("transit/keys/{name}")), None)
        .await?;
    state.transit.delete_key(&ctx, &name).await.map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/keys/{name}")), None)
        .await?;
    let version = state.transit.rotate_key(&ctx, &name).await.map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({"version": version})))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<UpdateConfigBody>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/keys/{name}")), None)
        .await?;
    state
        .transit
        .update_key_config(
            &ctx,
            &name,
            UpdateKeyConfig {
                min_decryption_version: body.min_decryption_version,
                deletion_allowed: body.deletion_allowed,
            },
        )
        .await
        .map_err(api(&ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn encrypt(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<EncryptBody>,
) -> Result<Json<CiphertextResponse>, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/encrypt/{name}")), None)
        .await?;
    let plaintext = decode_b64("plaintext", &body.plaintext, &ctx)?;
    let context = decode_context(body.context.as_ref(), &ctx)?;
    let ciphertext = state
        .transit
        .encrypt(&ctx, &name, &plaintext, context.as_deref())
        .await
        .map_err(api(&ctx))?;
    Ok(Json(CiphertextResponse { ciphertext }))
}

async fn decrypt(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<DecryptBody>,
) -> Result<Json<PlaintextResponse>, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/decrypt/{name}")), None)
        .await?;
    let context = decode_context(body.context.as_ref(), &ctx)?;
    let plaintext = state
        .transit
        .decrypt(&ctx, &name, &body.ciphertext, context.as_deref())
        .await
        .map_err(api(&ctx))?;
    Ok(Json(PlaintextResponse {
        plaintext: BASE64.encode(&plaintext),
    }))
}

async fn sign(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<SignBody>,
) -> Result<Json<SignatureResponse>, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/sign/{name}")), None)
        .await?;
    let input = decode_b64("input", &body.input, &ctx)?;
    let signature = state.transit.sign(&ctx, &name, &input).await.map_err(api(&ctx))?;
    Ok(Json(SignatureResponse { signature }))
}

async fn verify(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerifyResponse>, ApiError> {
    authorize(&state, &ctx, "update", "transit", Some(format!("transit/verify/{name}")), None)
        .await?;
    let input = decode_b64("input", &body.input, &ctx)?;
    let valid = state
        .transit
        .verify(&ctx, &name, &input, &body.signature)
        .await
        .map_err(api(&ctx))?;
    Ok(Json(VerifyResponse { valid }))
}

async fn export_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &ctx, "sudo", "transit", Some(format!("transit/export/{name}")), None)
        .await?;
    let material = state.transit.export_key(&ctx, &name).await.map_err(api(&ctx))?;
    Ok(Json(serde_json::json!({"name": name, "keys": material})))
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<KeyListResponse>, ApiError> {
    authorize(&state, &ctx, "list", "transit", Some("transit/keys".to_owned()), None).await?;
    let keys = state.transit.list_keys().await.map_err(api(&ctx))?;
    Ok(Json(KeyListResponse { keys }))
}
