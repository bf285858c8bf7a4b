//! Decision-preview route. Lets any authenticated caller ask "would this
//! request be permitted?" without performing it. The decision is computed
//! from the caller's own identity; reasons are stripped for non-admins the
//! same way real denials are.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use usp_core::authz::{DecisionRequest, Effect, RequiredAction};
use usp_core::context::RequestContext;

use crate::error::{ApiError, api};
use crate::state::AppState;

/// Build the `/v1/authz` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/check", post(check))
}

#[derive(Debug, Deserialize)]
pub struct CheckBody {
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_attributes: HashMap<String, serde_json::Value>,
    /// Extra environment attributes merged over the edge-derived ones.
    #[serde(default)]
    pub environment_attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub decision: Effect,
    pub reasons: Vec<String>,
    pub required_action: Option<RequiredAction>,
    pub obligations: Vec<String>,
}

async fn check(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CheckBody>,
) -> Result<Json<CheckResponse>, ApiError> {
    let mut environment = ctx.environment_attribute_map();
    environment.extend(body.environment_attributes);

    let request = DecisionRequest {
        subject_id: ctx.principal_id.clone(),
        subject_attributes: ctx.subject_attribute_map(),
        action: body.action,
        resource_type: body.resource_type,
        resource_id: body.resource_id,
        resource_attributes: body.resource_attributes,
        environment_attributes: environment,
    };

    let decision = state.authz.evaluate(&request).await.map_err(api(&ctx))?;
    let is_admin = ctx.roles.iter().any(|r| r == "root");
    Ok(Json(CheckResponse {
        decision: decision.effect,
        reasons: if is_admin { decision.reasons } else { Vec::new() },
        required_action: decision.required_action,
        obligations: decision.obligations,
    }))
}
