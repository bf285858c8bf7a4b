//! Per-request context for USP.
//!
//! A [`RequestContext`] is constructed once at the edge from the
//! authenticated principal and the request metadata, then passed explicitly
//! into every core operation. No component reads identity from ambient or
//! thread-local state; if it isn't in the context, it doesn't exist.
//!
//! The correlation id ties together every audit record produced while the
//! request is processed and is echoed back to the caller on both success and
//! error responses.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Identity and environment of one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated principal id.
    pub principal_id: String,
    /// Roles attached to the principal.
    pub roles: Vec<String>,
    /// Session identifier, if the edge tracks sessions.
    pub session_id: Option<String>,
    /// Client IP address as observed at the edge.
    pub ip: Option<String>,
    /// Network zone classification supplied by the edge (e.g. `corp`, `vpn`).
    pub network_zone: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Device fingerprint, if the edge computes one.
    pub device_fingerprint: Option<String>,
    /// ISO country code of the client's geolocation.
    pub geo_country: Option<String>,
    /// Whether the device passed compliance checks.
    pub device_compliant: Option<bool>,
    /// Risk score (0..100) computed by the edge's risk evaluator.
    pub risk_score: Option<u8>,
    /// Additional subject attributes (clearance, team, ...).
    pub subject_attributes: HashMap<String, Value>,
    /// Request-scoped correlation id, propagated into every audit record.
    pub correlation_id: String,
    /// Wall-clock instant the request was admitted.
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// Build a context for an authenticated principal.
    #[must_use]
    pub fn new(principal_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            roles,
            session_id: None,
            ip: None,
            network_zone: None,
            user_agent: None,
            device_fingerprint: None,
            geo_country: None,
            device_compliant: None,
            risk_score: None,
            subject_attributes: HashMap::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            now: Utc::now(),
        }
    }

    /// Build a context for an internal background worker (lease manager,
    /// rotation scheduler). Carries a fresh correlation id so background
    /// effects are traceable in the audit chain.
    #[must_use]
    pub fn system(component: &str) -> Self {
        Self::new(format!("system:{component}"), vec!["system".to_owned()])
    }

    /// The subject attributes as seen by the authorization evaluator,
    /// including roles.
    #[must_use]
    pub fn subject_attribute_map(&self) -> HashMap<String, Value> {
        let mut map = self.subject_attributes.clone();
        map.insert(
            "id".to_owned(),
            Value::String(self.principal_id.clone()),
        );
        map.insert(
            "roles".to_owned(),
            Value::Array(self.roles.iter().cloned().map(Value::String).collect()),
        );
        map
    }

    /// The environment attributes as seen by the authorization evaluator.
    #[must_use]
    pub fn environment_attribute_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("now".to_owned(), Value::String(self.now.to_rfc3339()));
        if let Some(ip) = &self.ip {
            map.insert("ip".to_owned(), Value::String(ip.clone()));
        }
        if let Some(zone) = &self.network_zone {
            map.insert("network_zone".to_owned(), Value::String(zone.clone()));
        }
        if let Some(country) = &self.geo_country {
            map.insert("geo_country".to_owned(), Value::String(country.clone()));
        }
        if let Some(compliant) = self.device_compliant {
            map.insert("device_compliant".to_owned(), Value::Bool(compliant));
        }
        if let Some(score) = self.risk_score {
            map.insert("risk_score".to_owned(), Value::from(score));
        }
        map
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_assigns_fresh_correlation_ids() {
        let a = RequestContext::new("user-1", vec![]);
        let b = RequestContext::new("user-1", vec![]);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn system_context_is_marked() {
        let ctx = RequestContext::system("lease-manager");
        assert_eq!(ctx.principal_id, "system:lease-manager");
        assert_eq!(ctx.roles, vec!["system".to_owned()]);
    }

    #[test]
    fn subject_map_includes_roles_and_id() {
        let mut ctx = RequestContext::new("user-1", vec!["engineering".to_owned()]);
        ctx.subject_attributes.insert(
            "clearance".to_owned(),
            Value::String("confidential".to_owned()),
        );

        let map = ctx.subject_attribute_map();
        assert_eq!(map["id"], Value::String("user-1".to_owned()));
        assert_eq!(map["clearance"], Value::String("confidential".to_owned()));
        let roles = map["roles"].as_array().unwrap();
        assert_eq!(roles.len(), 1);
    }

    #[test]
    fn environment_map_carries_edge_signals() {
        let mut ctx = RequestContext::new("user-1", vec![]);
        ctx.network_zone = Some("corp".to_owned());
        ctx.geo_country = Some("DE".to_owned());
        ctx.device_compliant = Some(true);
        ctx.risk_score = Some(42);

        let map = ctx.environment_attribute_map();
        assert_eq!(map["network_zone"], Value::String("corp".to_owned()));
        assert_eq!(map["geo_country"], Value::String("DE".to_owned()));
        assert_eq!(map["device_compliant"], Value::Bool(true));
        assert_eq!(map["risk_score"], Value::from(42u8));
        assert!(map.contains_key("now"));
    }
}
