//! Authentication middleware.
//!
//! Builds the [`RequestContext`] for every request and injects it into the
//! request extensions. Three authentication planes:
//!
//! - `/v1/sys/health` — anonymous.
//! - `/v1/seal/init|unseal|seal` — bootstrap credential only, compared in
//!   constant time. API tokens are deliberately refused here.
//! - `/v1/seal/status` — bootstrap credential **or** a valid API token.
//! - everything else — a valid API token via the `x-usp-token` header.
//!
//! Edge-supplied environment signals (network zone, geolocation, device
//! compliance, risk score) arrive as `x-usp-*` headers set by the fronting
//! proxy and flow into the context for the authorization evaluator.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use usp_core::context::RequestContext;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying both API tokens and the bootstrap credential.
pub const TOKEN_HEADER: &str = "x-usp-token";

/// Header echoing the request correlation id on every response.
pub const CORRELATION_HEADER: &str = "x-usp-correlation-id";

/// Authenticate the request and install a [`RequestContext`] extension.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    let correlation_id = correlation_id(req.headers());

    if path == "/v1/sys/health" {
        return run_with_correlation(req, next, correlation_id).await;
    }

    let token = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let is_seal_mutation =
        matches!(path.as_str(), "/v1/seal/init" | "/v1/seal/unseal" | "/v1/seal/seal");
    let is_seal_status = path == "/v1/seal/status";

    let Some(token) = token else {
        return ApiError::unauthenticated(
            format!("missing {TOKEN_HEADER} header"),
            correlation_id,
        )
        .into_response();
    };

    let is_bootstrap = bool::from(
        token
            .as_bytes()
            .ct_eq(state.bootstrap_token.as_bytes()),
    );

    let ctx = if is_seal_mutation {
        // The seal plane only ever accepts the bootstrap credential; a
        // root API token must not be able to seal the platform.
        if !is_bootstrap {
            return ApiError::unauthenticated(
                "seal operations require the bootstrap credential",
                correlation_id,
            )
            .into_response();
        }
        bootstrap_context(req.headers(), correlation_id)
    } else if is_bootstrap {
        if !is_seal_status {
            return ApiError::unauthenticated(
                "the bootstrap credential is valid only on the seal plane",
                correlation_id,
            )
            .into_response();
        }
        bootstrap_context(req.headers(), correlation_id)
    } else {
        match state.tokens.lookup(&token).await {
            Ok(entry) => {
                let mut ctx = RequestContext::new(entry.principal_id, entry.roles);
                ctx.subject_attributes = entry.attributes;
                ctx.correlation_id = correlation_id;
                apply_edge_signals(&mut ctx, req.headers());
                ctx
            }
            Err(e) => {
                return ApiError::from_core(e, &correlation_id).into_response();
            }
        }
    };

    let correlation_id = ctx.correlation_id.clone();
    req.extensions_mut().insert(ctx);
    run_with_correlation(req, next, correlation_id).await
}

async fn run_with_correlation(req: Request, next: Next, correlation_id: String) -> Response {
    let mut response = next.run(req).await;
    if let Ok(value) = correlation_id.parse() {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn bootstrap_context(headers: &HeaderMap, correlation_id: String) -> RequestContext {
    let mut ctx = RequestContext::new("bootstrap", vec!["bootstrap".to_owned()]);
    ctx.correlation_id = correlation_id;
    apply_edge_signals(&mut ctx, headers);
    ctx
}

/// Use the caller-supplied request id when present, else mint one.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn apply_edge_signals(ctx: &mut RequestContext, headers: &HeaderMap) {
    ctx.ip = header_str(headers, "x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned());
    ctx.network_zone = header_str(headers, "x-usp-network-zone").map(str::to_owned);
    ctx.geo_country = header_str(headers, "x-usp-geo-country").map(str::to_owned);
    ctx.user_agent = header_str(headers, "user-agent").map(str::to_owned);
    ctx.device_fingerprint = header_str(headers, "x-usp-device-fingerprint").map(str::to_owned);
    ctx.device_compliant =
        header_str(headers, "x-usp-device-compliant").map(|v| v == "true" || v == "1");
    ctx.risk_score = header_str(headers, "x-usp-risk-score").and_then(|v| v.parse().ok());
    ctx.session_id = header_str(headers, "x-usp-session-id").map(str::to_owned);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn correlation_id_prefers_request_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-123"));
        assert_eq!(correlation_id(&headers), "req-123");
    }

    #[test]
    fn correlation_id_minted_when_absent() {
        let headers = HeaderMap::new();
        let id = correlation_id(&headers);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn edge_signals_flow_into_context() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.2.3, 172.16.0.1"));
        headers.insert("x-usp-network-zone", HeaderValue::from_static("corp"));
        headers.insert("x-usp-geo-country", HeaderValue::from_static("DE"));
        headers.insert("x-usp-device-compliant", HeaderValue::from_static("true"));
        headers.insert("x-usp-risk-score", HeaderValue::from_static("42"));

        let mut ctx = RequestContext::new("user-1", vec![]);
        apply_edge_signals(&mut ctx, &headers);
        assert_eq!(ctx.ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(ctx.network_zone.as_deref(), Some("corp"));
        assert_eq!(ctx.geo_country.as_deref(), Some("DE"));
        assert_eq!(ctx.device_compliant, Some(true));
        assert_eq!(ctx.risk_score, Some(42));
    }
}
