//! HTTP error mapping.
//!
//! Every error leaving the API carries a stable machine-readable code, a
//! human reason, and the request's correlation id. Internal details —
//! storage failures, crypto failures, connector subcodes — never reach the
//! caller; they are logged and audited server-side.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use usp_core::context::RequestContext;
use usp_core::error::{
    AuditError, DatabaseError, HierarchyError, KvError, PolicyError, SealError, StoreError,
    TokenError, TransitError,
};

/// An API error ready for serialization.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub correlation_id: String,
}

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'a str,
    correlation_id: &'a str,
}

impl ApiError {
    /// Build an error with an explicit status and code.
    #[must_use]
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// 401 for missing/invalid credentials.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            message,
            correlation_id,
        )
    }

    /// 403 for a negative authorization decision. Reasons are only included
    /// for admin callers; everyone else gets the uniform message, so a
    /// denied read of a nonexistent secret is indistinguishable from a
    /// denied read of an existing one.
    #[must_use]
    pub fn policy_denied(ctx: &RequestContext, reasons: &[String]) -> Self {
        let message = if ctx.roles.iter().any(|r| r == "root") && !reasons.is_empty() {
            reasons.join("; ")
        } else {
            "request denied by policy".to_owned()
        };
        Self::new(
            StatusCode::FORBIDDEN,
            "policy_denied",
            message,
            ctx.correlation_id.clone(),
        )
    }

    /// 400 for malformed input detected at the edge.
    #[must_use]
    pub fn validation(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "validation_failure",
            message,
            correlation_id,
        )
    }

    /// Map a core error, attaching the request's correlation id.
    #[must_use]
    pub fn from_core(err: impl Into<CoreError>, correlation_id: &str) -> Self {
        let (status, code, message) = classify(&err.into());
        Self::new(status, code, message, correlation_id)
    }
}

/// Closure factory for terse `map_err(api(&ctx))` chains in handlers.
pub fn api<E: Into<CoreError>>(ctx: &RequestContext) -> impl Fn(E) -> ApiError + '_ {
    move |e| ApiError::from_core(e, &ctx.correlation_id)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: &self.message,
            correlation_id: &self.correlation_id,
        };
        (self.status, axum::Json(&body)).into_response()
    }
}

/// Union of core error types for uniform classification.
#[derive(Debug)]
pub enum CoreError {
    Seal(SealError),
    Kv(KvError),
    Transit(TransitError),
    Database(DatabaseError),
    Policy(PolicyError),
    Token(TokenError),
    Audit(AuditError),
    Store(StoreError),
    Hierarchy(HierarchyError),
}

macro_rules! impl_from_core {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for CoreError {
            fn from(e: $ty) -> Self {
                Self::$variant(e)
            }
        })*
    };
}

impl_from_core!(
    Seal(SealError),
    Kv(KvError),
    Transit(TransitError),
    Database(DatabaseError),
    Policy(PolicyError),
    Token(TokenError),
    Audit(AuditError),
    Store(StoreError),
    Hierarchy(HierarchyError),
);

/// Generic 500 reply. The underlying reason is logged, never returned.
fn internal(err: &dyn std::fmt::Display) -> (StatusCode, &'static str, String) {
    error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal error".to_owned(),
    )
}

fn sealed() -> (StatusCode, &'static str, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "sealed",
        "platform is sealed".to_owned(),
    )
}

fn classify(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::Hierarchy(HierarchyError::Sealed) => sealed(),
        CoreError::Hierarchy(e) => internal(e),

        CoreError::Audit(e) => classify_audit(e),
        CoreError::Store(e) => internal(e),

        CoreError::Seal(e) => classify_seal(e),
        CoreError::Kv(e) => classify_kv(e),
        CoreError::Transit(e) => classify_transit(e),
        CoreError::Database(e) => classify_database(e),
        CoreError::Policy(e) => classify_policy(e),
        CoreError::Token(e) => classify_token(e),
    }
}

fn classify_audit(err: &AuditError) -> (StatusCode, &'static str, String) {
    match err {
        AuditError::ChainBroken { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "chain_broken",
            "audit chain integrity failure; writes refused until acknowledged".to_owned(),
        ),
        AuditError::Hierarchy(HierarchyError::Sealed) => sealed(),
        e => internal(e),
    }
}

fn classify_seal(err: &SealError) -> (StatusCode, &'static str, String) {
    match err {
        SealError::AlreadyInitialized
        | SealError::AlreadyUnsealed
        | SealError::AlreadySealed => (StatusCode::CONFLICT, "conflict", err.to_string()),
        SealError::NotInitialized
        | SealError::InvalidConfig { .. }
        | SealError::InvalidShare(_)
        | SealError::RecoveryFailed { .. } => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            err.to_string(),
        ),
        SealError::Audit(e) => classify_audit(e),
        e @ (SealError::Crypto(_) | SealError::Store(_)) => internal(e),
    }
}

fn classify_kv(err: &KvError) -> (StatusCode, &'static str, String) {
    match err {
        KvError::NotFound { .. } | KvError::VersionNotFound { .. } => {
            (StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        KvError::CasMismatch { .. } => (StatusCode::CONFLICT, "cas_mismatch", err.to_string()),
        KvError::CasRequired { .. }
        | KvError::Validation { .. }
        | KvError::ValueTooLarge { .. } => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            err.to_string(),
        ),
        KvError::Destroyed { .. } => (StatusCode::GONE, "destroyed", err.to_string()),
        KvError::Deleted { .. } => (StatusCode::NOT_FOUND, "deleted", err.to_string()),
        KvError::Hierarchy(HierarchyError::Sealed) => sealed(),
        KvError::Audit(e) => classify_audit(e),
        e => internal(e),
    }
}

fn classify_transit(err: &TransitError) -> (StatusCode, &'static str, String) {
    match err {
        TransitError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        TransitError::AlreadyExists { .. } => {
            (StatusCode::CONFLICT, "conflict", err.to_string())
        }
        TransitError::KeyVersionTooOld { .. } => (
            StatusCode::BAD_REQUEST,
            "key_version_too_old",
            err.to_string(),
        ),
        TransitError::InvalidPayload { .. } | TransitError::InvalidConfig { .. } => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            err.to_string(),
        ),
        TransitError::DeletionForbidden { .. } | TransitError::ExportForbidden { .. } => (
            StatusCode::FORBIDDEN,
            "policy_denied",
            err.to_string(),
        ),
        TransitError::Unsupported { .. } | TransitError::WrongAlgorithm { .. } => (
            StatusCode::NOT_IMPLEMENTED,
            "unsupported",
            err.to_string(),
        ),
        TransitError::Crypto(_) => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            "decryption failed".to_owned(),
        ),
        TransitError::Hierarchy(HierarchyError::Sealed) => sealed(),
        TransitError::Audit(e) => classify_audit(e),
        e => internal(e),
    }
}

fn classify_database(err: &DatabaseError) -> (StatusCode, &'static str, String) {
    match err {
        DatabaseError::ConfigNotFound { .. }
        | DatabaseError::RoleNotFound { .. }
        | DatabaseError::LeaseNotFound { .. } => {
            (StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        DatabaseError::LeaseRevoked { .. } | DatabaseError::LeaseExpired { .. } => {
            (StatusCode::CONFLICT, "conflict", err.to_string())
        }
        DatabaseError::Validation { .. } => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            err.to_string(),
        ),
        DatabaseError::Unsupported { .. } => (
            StatusCode::NOT_IMPLEMENTED,
            "unsupported",
            err.to_string(),
        ),
        // The plugin-specific failure lands in the audit record; callers
        // get a generic reason.
        DatabaseError::Connector(e) => {
            error!(error = %e, "connector failure");
            (
                StatusCode::BAD_GATEWAY,
                "connector_error",
                "database connector failed".to_owned(),
            )
        }
        DatabaseError::Hierarchy(HierarchyError::Sealed) => sealed(),
        DatabaseError::Audit(e) => classify_audit(e),
        e => internal(e),
    }
}

fn classify_policy(err: &PolicyError) -> (StatusCode, &'static str, String) {
    match err {
        PolicyError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        PolicyError::Invalid { .. } | PolicyError::BodyTooLarge { .. } => (
            StatusCode::BAD_REQUEST,
            "validation_failure",
            err.to_string(),
        ),
        PolicyError::BuiltIn { .. } => {
            (StatusCode::FORBIDDEN, "policy_denied", err.to_string())
        }
        PolicyError::Audit(e) => classify_audit(e),
        e => internal(e),
    }
}

fn classify_token(err: &TokenError) -> (StatusCode, &'static str, String) {
    match err {
        TokenError::NotFound | TokenError::Expired { .. } => (
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "invalid or expired token".to_owned(),
        ),
        e => internal(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sealed_maps_to_503() {
        let err = ApiError::from_core(
            KvError::Hierarchy(HierarchyError::Sealed),
            "corr-1",
        );
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "sealed");
        assert_eq!(err.correlation_id, "corr-1");
    }

    #[test]
    fn cas_mismatch_maps_to_conflict() {
        let err = ApiError::from_core(
            KvError::CasMismatch {
                current: 2,
                provided: 1,
            },
            "corr-1",
        );
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "cas_mismatch");
    }

    #[test]
    fn destroyed_maps_to_gone() {
        let err = ApiError::from_core(
            KvError::Destroyed {
                path: "a".to_owned(),
                version: 1,
            },
            "corr-1",
        );
        assert_eq!(err.status, StatusCode::GONE);
        assert_eq!(err.code, "destroyed");
    }

    #[test]
    fn key_version_too_old_is_stable_code() {
        let err = ApiError::from_core(
            TransitError::KeyVersionTooOld { version: 1, min: 2 },
            "corr-1",
        );
        assert_eq!(err.code, "key_version_too_old");
    }

    #[test]
    fn connector_errors_are_generic_to_callers() {
        let err = ApiError::from_core(
            DatabaseError::Connector(usp_core::error::ConnectorError::Statement {
                reason: "ERROR 1045: access denied for user".to_owned(),
            }),
            "corr-1",
        );
        assert_eq!(err.code, "connector_error");
        assert!(!err.message.contains("1045"));
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ApiError::from_core(
            KvError::Internal {
                reason: "sensitive internals".to_owned(),
            },
            "corr-1",
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("sensitive"));
    }

    #[test]
    fn policy_denied_hides_reasons_from_non_admins() {
        let ctx = RequestContext::new("user-1", vec!["engineering".to_owned()]);
        let err = ApiError::policy_denied(&ctx, &["hcl policy 'x' denies".to_owned()]);
        assert_eq!(err.message, "request denied by policy");

        let admin = RequestContext::new("admin", vec!["root".to_owned()]);
        let err = ApiError::policy_denied(&admin, &["hcl policy 'x' denies".to_owned()]);
        assert!(err.message.contains("hcl policy"));
    }
}
