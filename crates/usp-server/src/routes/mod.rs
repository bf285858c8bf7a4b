//! HTTP route modules and the shared authorization gate.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use tracing::warn;

use usp_core::audit::{AuditEvent, AuditEventType};
use usp_core::authz::DecisionRequest;
use usp_core::context::RequestContext;

use crate::error::{ApiError, api};
use crate::state::AppState;

pub mod authz;
pub mod database;
pub mod kv;
pub mod policies;
pub mod sys;
pub mod transit;

/// Assemble the full `/v1` API surface.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/v1/seal", sys::seal_router())
        .nest("/v1/sys", sys::sys_router())
        .nest("/v1/kv", kv::router())
        .nest("/v1/transit", transit::router())
        .nest("/v1/database", database::router())
        .merge(policies::router())
        .nest("/v1/authz", authz::router())
}

/// Evaluate the authorization decision for a request and deny with a
/// uniform error when it fails. Denials are recorded in the audit chain;
/// permitted operations are audited by the engines when they take effect.
pub(crate) async fn authorize(
    state: &AppState,
    ctx: &RequestContext,
    action: &str,
    resource_type: &str,
    resource_id: Option<String>,
    parameters: Option<serde_json::Value>,
) -> Result<(), ApiError> {
    let mut resource_attributes = HashMap::new();
    if let Some(parameters) = parameters {
        resource_attributes.insert("parameters".to_owned(), parameters);
    }

    let request = DecisionRequest {
        subject_id: ctx.principal_id.clone(),
        subject_attributes: ctx.subject_attribute_map(),
        action: action.to_owned(),
        resource_type: resource_type.to_owned(),
        resource_id: resource_id.clone(),
        resource_attributes,
        environment_attributes: ctx.environment_attribute_map(),
    };

    let decision = state.authz.evaluate(&request).await.map_err(api(ctx))?;
    if decision.is_permit() {
        return Ok(());
    }

    // A failed denial audit must not mask the denial itself.
    let resource = resource_id.unwrap_or_else(|| resource_type.to_owned());
    if let Err(e) = state
        .audit
        .append(
            AuditEvent::new(AuditEventType::AuthzDecision, ctx, false)
                .resource(resource)
                .action(action)
                .details(serde_json::json!({"reasons": decision.reasons})),
        )
        .await
    {
        warn!(error = %e, "denial audit append failed");
    }

    Err(ApiError::policy_denied(ctx, &decision.reasons))
}
