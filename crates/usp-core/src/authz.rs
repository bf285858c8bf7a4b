//! Authorization evaluator for USP.
//!
//! A single evaluator combines four policy families into one decision:
//!
//! - **RBAC** — roles mapped to `resource:action` permissions, literal or
//!   prefix-`*` matching;
//! - **ABAC** — JSON rule sets with attribute conditions over subject,
//!   resource, and environment;
//! - **HCL** — path-capability documents (`path "pat" { capabilities =
//!   [...] }`) with `*` (one segment), `+` (any segments), and
//!   `${subject.<field>}` templating;
//! - **Context** — time windows, geo and network lists, device compliance,
//!   risk thresholds, impossible-travel detection.
//!
//! Combination order is fixed: context policies first (any denial
//! short-circuits), then risk thresholds, then deny-effect rules, then
//! permit-effect rules, and finally default-deny when nothing matched. Deny
//! always beats permit; ties within one effect go to the higher `priority`,
//! then the lexicographically smaller policy id.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::PolicyError;
use crate::policy::{PolicyKind, PolicyRecord, PolicyStore};

/// The capabilities an HCL rule may grant.
const HCL_CAPABILITIES: [&str; 7] = [
    "create", "read", "update", "delete", "list", "sudo", "deny",
];

/// Final effect of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Permit,
    Deny,
}

/// Step-up requirement attached to a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAction {
    Mfa,
    Approval,
}

/// One authorization question.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    /// The acting subject.
    pub subject_id: String,
    /// Subject attributes, including `roles` as an array.
    pub subject_attributes: HashMap<String, Value>,
    /// The capability being exercised (`read`, `create`, `sudo`, ...).
    pub action: String,
    /// Coarse resource family (`secret`, `transit-key`, `database`, ...).
    pub resource_type: String,
    /// Concrete resource path, when one exists.
    pub resource_id: Option<String>,
    /// Resource attributes (e.g. `parameters` supplied with the request).
    pub resource_attributes: HashMap<String, Value>,
    /// Environment attributes supplied by the edge.
    pub environment_attributes: HashMap<String, Value>,
}

impl DecisionRequest {
    fn resource_path(&self) -> &str {
        self.resource_id.as_deref().unwrap_or(&self.resource_type)
    }

    fn subject_roles(&self) -> Vec<String> {
        self.subject_attributes
            .get("roles")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The evaluator's answer.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// Permit or deny.
    pub effect: Effect,
    /// Human-readable reasons. May name policies; the edge strips these for
    /// non-admin callers.
    pub reasons: Vec<String>,
    /// Step-up requirement (only meaningful on permit).
    pub required_action: Option<RequiredAction>,
    /// Obligations the caller must honor (e.g. masked fields).
    pub obligations: Vec<String>,
}

impl Decision {
    /// Whether the decision is a permit.
    #[must_use]
    pub fn is_permit(&self) -> bool {
        self.effect == Effect::Permit
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            reasons: vec![reason.into()],
            required_action: None,
            obligations: Vec::new(),
        }
    }
}

/// Adaptive risk thresholds (0..100).
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholds {
    /// Scores above this require MFA on an otherwise-permitted request.
    pub mfa_threshold: u8,
    /// Scores above this deny outright.
    pub deny_threshold: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            mfa_threshold: 60,
            deny_threshold: 85,
        }
    }
}

/// The unified authorization evaluator.
pub struct AuthzEvaluator {
    policies: Arc<PolicyStore>,
    risk: RiskThresholds,
}

impl AuthzEvaluator {
    /// Create an evaluator over the given policy store.
    #[must_use]
    pub fn new(policies: Arc<PolicyStore>, risk: RiskThresholds) -> Self {
        Self { policies, risk }
    }

    /// Evaluate a request against all active policies.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if loading policies fails. A policy
    /// whose body no longer parses is skipped with a warning rather than
    /// failing open or closed for everyone.
    pub async fn evaluate(&self, req: &DecisionRequest) -> Result<Decision, PolicyError> {
        let active = self.policies.load_active().await?;
        Ok(evaluate_with_policies(&active, req, self.risk))
    }
}

impl std::fmt::Debug for AuthzEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzEvaluator")
            .field("risk", &self.risk)
            .finish_non_exhaustive()
    }
}

/// A matched rule, kept for tie-breaking.
struct RuleMatch {
    effect: Effect,
    priority: i64,
    policy_id: String,
    reason: String,
}

/// Pure combination over an already-loaded policy set.
#[must_use]
pub fn evaluate_with_policies(
    policies: &[PolicyRecord],
    req: &DecisionRequest,
    risk: RiskThresholds,
) -> Decision {
    let mut requirement: Option<RequiredAction> = None;

    // 1. Context policies: any denial short-circuits.
    for policy in policies.iter().filter(|p| p.kind == PolicyKind::Context) {
        let body = match serde_json::from_str::<ContextBody>(&policy.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(policy = %policy.id, error = %e, "skipping unparseable context policy");
                continue;
            }
        };
        match evaluate_context(&body, &req.environment_attributes) {
            ContextOutcome::Deny(reason) => {
                return Decision::deny(format!("context policy '{}': {reason}", policy.id));
            }
            ContextOutcome::PassWith(action) => {
                requirement = max_requirement(requirement, Some(action));
            }
            ContextOutcome::Pass => {}
        }
    }

    // 2. Adaptive risk thresholds.
    if let Some(score) = req
        .environment_attributes
        .get("risk_score")
        .and_then(Value::as_u64)
    {
        if score > u64::from(risk.deny_threshold) {
            return Decision::deny(format!(
                "risk score {score} exceeds deny threshold {}",
                risk.deny_threshold
            ));
        }
        if score > u64::from(risk.mfa_threshold) {
            requirement = max_requirement(requirement, Some(RequiredAction::Mfa));
        }
    }

    // 3+4. Rule matches across RBAC / ABAC / HCL.
    let mut matches: Vec<RuleMatch> = Vec::new();
    for policy in policies {
        match policy.kind {
            PolicyKind::Rbac => match_rbac(policy, req, &mut matches),
            PolicyKind::Abac => match_abac(policy, req, &mut matches),
            PolicyKind::Hcl => match_hcl(policy, req, &mut matches),
            PolicyKind::Context => {}
        }
    }

    if let Some(winner) = pick(&matches, Effect::Deny) {
        return Decision {
            effect: Effect::Deny,
            reasons: vec![winner.reason.clone()],
            required_action: None,
            obligations: Vec::new(),
        };
    }

    if let Some(winner) = pick(&matches, Effect::Permit) {
        return Decision {
            effect: Effect::Permit,
            reasons: vec![winner.reason.clone()],
            required_action: requirement,
            obligations: Vec::new(),
        };
    }

    // 6. Default deny.
    Decision::deny("no matching policy")
}

/// Highest-priority match of the given effect; policy id breaks ties.
fn pick(matches: &[RuleMatch], effect: Effect) -> Option<&RuleMatch> {
    matches
        .iter()
        .filter(|m| m.effect == effect)
        .min_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.policy_id.cmp(&b.policy_id))
        })
}

fn max_requirement(
    a: Option<RequiredAction>,
    b: Option<RequiredAction>,
) -> Option<RequiredAction> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

// ── RBAC ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RbacBody {
    roles: HashMap<String, Vec<String>>,
}

fn match_rbac(policy: &PolicyRecord, req: &DecisionRequest, out: &mut Vec<RuleMatch>) {
    let body = match serde_json::from_str::<RbacBody>(&policy.body) {
        Ok(body) => body,
        Err(e) => {
            warn!(policy = %policy.id, error = %e, "skipping unparseable rbac policy");
            return;
        }
    };

    let roles = req.subject_roles();
    for role in &roles {
        let Some(permissions) = body.roles.get(role) else {
            continue;
        };
        for permission in permissions {
            if permission_matches(permission, req.resource_path(), &req.action) {
                out.push(RuleMatch {
                    effect: Effect::Permit,
                    priority: policy.priority,
                    policy_id: policy.id.clone(),
                    reason: format!(
                        "rbac policy '{}' grants '{permission}' to role '{role}'",
                        policy.id
                    ),
                });
            }
        }
    }
}

/// Match a `resource:action` permission. Each side matches literally or as a
/// prefix ending in `*`; a bare `*` permission matches everything.
fn permission_matches(permission: &str, resource: &str, action: &str) -> bool {
    if permission == "*" {
        return true;
    }
    let Some((res_pat, act_pat)) = permission.rsplit_once(':') else {
        return wildcard_matches(permission, resource);
    };
    wildcard_matches(res_pat, resource) && wildcard_matches(act_pat, action)
}

/// Literal match, or prefix match when the pattern ends in `*`.
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    pattern.strip_suffix('*').map_or_else(
        || pattern == value,
        |prefix| value.starts_with(prefix),
    )
}

// ── ABAC ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AbacBody {
    rules: Vec<AbacRule>,
}

#[derive(Debug, Deserialize)]
struct AbacRule {
    effect: AbacEffect,
    action: String,
    resource: String,
    #[serde(default)]
    conditions: HashMap<String, AbacCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AbacEffect {
    Allow,
    Deny,
}

#[derive(Debug, Deserialize)]
struct AbacCondition {
    op: String,
    value: Value,
}

fn match_abac(policy: &PolicyRecord, req: &DecisionRequest, out: &mut Vec<RuleMatch>) {
    let body = match serde_json::from_str::<AbacBody>(&policy.body) {
        Ok(body) => body,
        Err(e) => {
            warn!(policy = %policy.id, error = %e, "skipping unparseable abac policy");
            return;
        }
    };

    for (idx, rule) in body.rules.iter().enumerate() {
        if !wildcard_matches(&rule.action, &req.action) {
            continue;
        }
        let resource_ok = wildcard_matches(&rule.resource, &req.resource_type)
            || wildcard_matches(&rule.resource, req.resource_path());
        if !resource_ok {
            continue;
        }
        // Missing attribute makes a condition false.
        let conditions_hold = rule
            .conditions
            .iter()
            .all(|(attr, cond)| condition_holds(req, attr, cond));
        if !conditions_hold {
            continue;
        }

        out.push(RuleMatch {
            effect: match rule.effect {
                AbacEffect::Allow => Effect::Permit,
                AbacEffect::Deny => Effect::Deny,
            },
            priority: policy.priority,
            policy_id: policy.id.clone(),
            reason: format!("abac policy '{}' rule #{idx} matched", policy.id),
        });
    }
}

/// Resolve `subject.x` / `resource.x` / `environment.x` attribute paths.
/// A bare name resolves against the subject.
fn resolve_attribute<'a>(req: &'a DecisionRequest, attr: &str) -> Option<&'a Value> {
    match attr.split_once('.') {
        Some(("subject", rest)) => req.subject_attributes.get(rest),
        Some(("resource", rest)) => req.resource_attributes.get(rest),
        Some(("environment" | "env", rest)) => req.environment_attributes.get(rest),
        _ => req.subject_attributes.get(attr),
    }
}

fn condition_holds(req: &DecisionRequest, attr: &str, cond: &AbacCondition) -> bool {
    let Some(actual) = resolve_attribute(req, attr) else {
        return false;
    };
    match cond.op.as_str() {
        "eq" => values_equal(actual, &cond.value),
        "ne" => !values_equal(actual, &cond.value),
        "in" => cond
            .value
            .as_array()
            .is_some_and(|arr| arr.iter().any(|v| values_equal(actual, v))),
        "contains" => match actual {
            Value::Array(arr) => arr.iter().any(|v| values_equal(v, &cond.value)),
            Value::String(s) => cond.value.as_str().is_some_and(|needle| s.contains(needle)),
            _ => false,
        },
        "gt" => compare(actual, &cond.value).is_some_and(std::cmp::Ordering::is_gt),
        "ge" => compare(actual, &cond.value).is_some_and(std::cmp::Ordering::is_ge),
        "lt" => compare(actual, &cond.value).is_some_and(std::cmp::Ordering::is_lt),
        "le" => compare(actual, &cond.value).is_some_and(std::cmp::Ordering::is_le),
        "cidr-in" | "cidr_in" => {
            let Some(ip) = actual.as_str() else {
                return false;
            };
            match &cond.value {
                Value::String(cidr) => ip_in_cidr(ip, cidr),
                Value::Array(cidrs) => cidrs
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|cidr| ip_in_cidr(ip, cidr)),
                _ => false,
            }
        }
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

/// Numeric comparison when both sides are numbers, else string ordering.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// IPv4/IPv6 CIDR membership.
fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let Some((net, bits)) = cidr.rsplit_once('/') else {
        return ip == cidr;
    };
    let Ok(bits) = bits.parse::<u32>() else {
        return false;
    };
    match (ip.parse::<IpAddr>(), net.parse::<IpAddr>()) {
        (Ok(IpAddr::V4(ip)), Ok(IpAddr::V4(net))) => ipv4_in(ip, net, bits),
        (Ok(IpAddr::V6(ip)), Ok(IpAddr::V6(net))) => ipv6_in(ip, net, bits),
        _ => false,
    }
}

fn ipv4_in(ip: Ipv4Addr, net: Ipv4Addr, bits: u32) -> bool {
    if bits > 32 {
        return false;
    }
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - bits);
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

fn ipv6_in(ip: Ipv6Addr, net: Ipv6Addr, bits: u32) -> bool {
    if bits > 128 {
        return false;
    }
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits);
    (u128::from(ip) & mask) == (u128::from(net) & mask)
}

// ── HCL path-capability ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct HclRule {
    path: String,
    capabilities: Vec<String>,
    required_parameters: Vec<String>,
}

fn match_hcl(policy: &PolicyRecord, req: &DecisionRequest, out: &mut Vec<RuleMatch>) {
    let rules = match parse_hcl(&policy.body) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(policy = %policy.id, error = %e, "skipping unparseable hcl policy");
            return;
        }
    };

    let path = req.resource_path();
    for rule in &rules {
        let pattern = substitute_templates(&rule.path, &req.subject_attributes);
        if !path_pattern_matches(&pattern, path) {
            continue;
        }
        if !required_parameters_present(&rule.required_parameters, &req.resource_attributes) {
            continue;
        }

        if rule.capabilities.iter().any(|c| c == "deny") {
            out.push(RuleMatch {
                effect: Effect::Deny,
                priority: policy.priority,
                policy_id: policy.id.clone(),
                reason: format!("hcl policy '{}' denies path '{}'", policy.id, rule.path),
            });
        } else if rule.capabilities.iter().any(|c| c == &req.action) {
            out.push(RuleMatch {
                effect: Effect::Permit,
                priority: policy.priority,
                policy_id: policy.id.clone(),
                reason: format!(
                    "hcl policy '{}' grants '{}' on path '{}'",
                    policy.id, req.action, rule.path
                ),
            });
        }
    }
}

fn required_parameters_present(
    required: &[String],
    resource_attributes: &HashMap<String, Value>,
) -> bool {
    if required.is_empty() {
        return true;
    }
    let Some(params) = resource_attributes.get("parameters").and_then(Value::as_object) else {
        return false;
    };
    required.iter().all(|p| params.contains_key(p))
}

/// Substitute `${subject.<field>}` templates from subject attributes.
fn substitute_templates(pattern: &str, subject: &HashMap<String, Value>) -> String {
    let mut result = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("${subject.") {
        result.push_str(&rest[..start]);
        let after = &rest[start + "${subject.".len()..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let field = &after[..end];
        match subject.get(field).and_then(Value::as_str) {
            Some(value) => result.push_str(value),
            // An unresolvable template can never match a concrete path.
            None => result.push('\u{0}'),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

/// Segment-wise path matching: `*` is exactly one segment, `+` is any
/// number of segments (including none).
fn path_pattern_matches(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    let Some((head, tail)) = pat.split_first() else {
        return segs.is_empty();
    };
    if *head == "+" {
        return (0..=segs.len()).any(|i| match_segments(tail, &segs[i..]));
    }
    let Some((first, rest)) = segs.split_first() else {
        return false;
    };
    (*head == "*" || head == first) && match_segments(tail, rest)
}

/// Parse an HCL-style path-capability document.
fn parse_hcl(body: &str) -> Result<Vec<HclRule>, String> {
    let mut rules = Vec::new();
    let mut current: Option<HclRule> = None;

    for (lineno, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("path") {
            if current.is_some() {
                return Err(format!("line {}: nested path block", lineno + 1));
            }
            let rest = rest.trim();
            let path = parse_quoted(rest)
                .ok_or_else(|| format!("line {}: expected quoted path pattern", lineno + 1))?;
            if !rest.trim_end().ends_with('{') {
                return Err(format!("line {}: expected '{{' after path pattern", lineno + 1));
            }
            current = Some(HclRule {
                path,
                capabilities: Vec::new(),
                required_parameters: Vec::new(),
            });
        } else if line == "}" {
            let rule = current
                .take()
                .ok_or_else(|| format!("line {}: unmatched '}}'", lineno + 1))?;
            if rule.capabilities.is_empty() {
                return Err(format!(
                    "path '{}' declares no capabilities",
                    rule.path
                ));
            }
            rules.push(rule);
        } else if let Some(rest) = line.strip_prefix("capabilities") {
            let rule = current
                .as_mut()
                .ok_or_else(|| format!("line {}: capabilities outside path block", lineno + 1))?;
            let caps = parse_string_list(rest)
                .ok_or_else(|| format!("line {}: malformed capabilities list", lineno + 1))?;
            for cap in &caps {
                if !HCL_CAPABILITIES.contains(&cap.as_str()) {
                    return Err(format!("unknown capability '{cap}'"));
                }
            }
            rule.capabilities = caps;
        } else if let Some(rest) = line.strip_prefix("required_parameters") {
            let rule = current.as_mut().ok_or_else(|| {
                format!("line {}: required_parameters outside path block", lineno + 1)
            })?;
            rule.required_parameters = parse_string_list(rest)
                .ok_or_else(|| format!("line {}: malformed parameter list", lineno + 1))?;
        } else {
            return Err(format!("line {}: unrecognized directive '{line}'", lineno + 1));
        }
    }

    if current.is_some() {
        return Err("unterminated path block".to_owned());
    }
    if rules.is_empty() {
        return Err("policy declares no path blocks".to_owned());
    }
    Ok(rules)
}

/// Extract the first double-quoted string from `input`.
fn parse_quoted(input: &str) -> Option<String> {
    let start = input.find('"')?;
    let rest = &input[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_owned())
}

/// Parse `= ["a", "b"]` into a list of strings.
fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let eq = input.find('=')?;
    let rest = input[eq + 1..].trim();
    let open = rest.find('[')?;
    let close = rest.rfind(']')?;
    if close < open {
        return None;
    }
    let inner = &rest[open + 1..close];
    let mut items = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let unquoted = part.strip_prefix('"')?.strip_suffix('"')?;
        items.push(unquoted.to_owned());
    }
    Some(items)
}

// ── Context ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ContextBody {
    #[serde(default)]
    time_windows: Vec<TimeWindow>,
    #[serde(default)]
    allowed_countries: Vec<String>,
    #[serde(default)]
    denied_countries: Vec<String>,
    #[serde(default)]
    allowed_zones: Vec<String>,
    #[serde(default)]
    denied_zones: Vec<String>,
    #[serde(default)]
    require_device_compliant: bool,
    #[serde(default)]
    require_mfa: bool,
    #[serde(default)]
    require_approval: bool,
    max_risk_score: Option<u64>,
    mfa_above_risk: Option<u64>,
    impossible_travel: Option<ImpossibleTravel>,
}

#[derive(Debug, Deserialize)]
struct TimeWindow {
    days: Vec<String>,
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct ImpossibleTravel {
    max_speed_kmh: f64,
}

enum ContextOutcome {
    Pass,
    PassWith(RequiredAction),
    Deny(String),
}

fn evaluate_context(body: &ContextBody, env: &HashMap<String, Value>) -> ContextOutcome {
    let now = env
        .get("now")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

    if !body.time_windows.is_empty() {
        let inside = body.time_windows.iter().any(|w| window_contains(w, now));
        if !inside {
            return ContextOutcome::Deny("outside permitted time window".to_owned());
        }
    }

    let country = env.get("geo_country").and_then(Value::as_str);
    if let Some(country) = country {
        if body.denied_countries.iter().any(|c| c == country) {
            return ContextOutcome::Deny(format!("country '{country}' is denied"));
        }
    }
    if !body.allowed_countries.is_empty()
        && !country.is_some_and(|c| body.allowed_countries.iter().any(|a| a == c))
    {
        return ContextOutcome::Deny("request origin outside allowed countries".to_owned());
    }

    let zone = env.get("network_zone").and_then(Value::as_str);
    if let Some(zone) = zone {
        if body.denied_zones.iter().any(|z| z == zone) {
            return ContextOutcome::Deny(format!("network zone '{zone}' is denied"));
        }
    }
    if !body.allowed_zones.is_empty()
        && !zone.is_some_and(|z| body.allowed_zones.iter().any(|a| a == z))
    {
        return ContextOutcome::Deny("request origin outside allowed network zones".to_owned());
    }

    if body.require_device_compliant
        && env.get("device_compliant").and_then(Value::as_bool) != Some(true)
    {
        return ContextOutcome::Deny("device compliance required".to_owned());
    }

    let risk = env.get("risk_score").and_then(Value::as_u64);
    if let (Some(max), Some(score)) = (body.max_risk_score, risk) {
        if score > max {
            return ContextOutcome::Deny(format!("risk score {score} exceeds policy limit {max}"));
        }
    }

    if let Some(travel) = &body.impossible_travel {
        if let Some(speed) = travel_speed_kmh(env, now) {
            if speed > travel.max_speed_kmh {
                return ContextOutcome::Deny(format!(
                    "impossible travel detected ({speed:.0} km/h)"
                ));
            }
        }
    }

    if body.require_approval {
        return ContextOutcome::PassWith(RequiredAction::Approval);
    }
    if body.require_mfa {
        return ContextOutcome::PassWith(RequiredAction::Mfa);
    }
    if let (Some(threshold), Some(score)) = (body.mfa_above_risk, risk) {
        if score > threshold {
            return ContextOutcome::PassWith(RequiredAction::Mfa);
        }
    }

    ContextOutcome::Pass
}

fn window_contains(window: &TimeWindow, now: DateTime<Utc>) -> bool {
    let day_ok = window
        .days
        .iter()
        .filter_map(|d| parse_weekday(d))
        .any(|d| d == now.weekday());
    if !day_ok {
        return false;
    }
    let (Ok(start), Ok(end)) = (
        NaiveTime::parse_from_str(&window.start, "%H:%M"),
        NaiveTime::parse_from_str(&window.end, "%H:%M"),
    ) else {
        return false;
    };
    let t = now.time();
    start <= t && t < end
}

fn parse_weekday(day: &str) -> Option<Weekday> {
    match day.to_ascii_lowercase().get(..3)? {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Observed travel speed between the previous and current sighting, when
/// the edge supplies both. `None` when the inputs are incomplete.
fn travel_speed_kmh(env: &HashMap<String, Value>, now: DateTime<Utc>) -> Option<f64> {
    let lat = env.get("geo_lat").and_then(Value::as_f64)?;
    let lon = env.get("geo_lon").and_then(Value::as_f64)?;
    let last_lat = env.get("last_geo_lat").and_then(Value::as_f64)?;
    let last_lon = env.get("last_geo_lon").and_then(Value::as_f64)?;
    let last_seen = env
        .get("last_seen_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);

    let hours = (now - last_seen).num_seconds().max(1) as f64 / 3600.0;
    let km = haversine_km(lat, lon, last_lat, last_lon);
    Some(km / hours)
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

// ── Body validation (used by the policy store) ───────────────────────

/// Validate a policy body for its declared kind.
///
/// # Errors
///
/// Returns a human-readable reason when the body does not parse.
pub fn validate_policy_body(kind: PolicyKind, body: &str) -> Result<(), String> {
    match kind {
        PolicyKind::Rbac => {
            let parsed: RbacBody =
                serde_json::from_str(body).map_err(|e| format!("rbac body: {e}"))?;
            if parsed.roles.is_empty() {
                return Err("rbac body declares no roles".to_owned());
            }
            Ok(())
        }
        PolicyKind::Abac => {
            let parsed: AbacBody =
                serde_json::from_str(body).map_err(|e| format!("abac body: {e}"))?;
            if parsed.rules.is_empty() {
                return Err("abac body declares no rules".to_owned());
            }
            for rule in &parsed.rules {
                for cond in rule.conditions.values() {
                    const OPS: [&str; 10] = [
                        "eq", "ne", "in", "gt", "ge", "lt", "le", "contains", "cidr-in",
                        "cidr_in",
                    ];
                    if !OPS.contains(&cond.op.as_str()) {
                        return Err(format!("unknown abac operator '{}'", cond.op));
                    }
                }
            }
            Ok(())
        }
        PolicyKind::Hcl => parse_hcl(body).map(|_| ()),
        PolicyKind::Context => {
            let parsed: ContextBody =
                serde_json::from_str(body).map_err(|e| format!("context body: {e}"))?;
            for window in &parsed.time_windows {
                NaiveTime::parse_from_str(&window.start, "%H:%M")
                    .map_err(|e| format!("bad window start '{}': {e}", window.start))?;
                NaiveTime::parse_from_str(&window.end, "%H:%M")
                    .map_err(|e| format!("bad window end '{}': {e}", window.end))?;
                for day in &window.days {
                    parse_weekday(day).ok_or_else(|| format!("unknown weekday '{day}'"))?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::policy::DefaultEffect;

    fn record(id: &str, kind: PolicyKind, body: &str) -> PolicyRecord {
        PolicyRecord {
            id: id.to_owned(),
            name: id.to_owned(),
            kind,
            body: body.to_owned(),
            priority: 0,
            effect_default: DefaultEffect::Deny,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request(action: &str, path: &str) -> DecisionRequest {
        let mut subject = HashMap::new();
        subject.insert(
            "roles".to_owned(),
            serde_json::json!(["engineering"]),
        );
        subject.insert(
            "clearance".to_owned(),
            Value::String("confidential".to_owned()),
        );
        DecisionRequest {
            subject_id: "user-1".to_owned(),
            subject_attributes: subject,
            action: action.to_owned(),
            resource_type: "secret".to_owned(),
            resource_id: Some(path.to_owned()),
            resource_attributes: HashMap::new(),
            environment_attributes: HashMap::new(),
        }
    }

    fn tuesday_10am() -> String {
        // 2026-06-02 is a Tuesday.
        Utc.with_ymd_and_hms(2026, 6, 2, 10, 0, 0)
            .unwrap()
            .to_rfc3339()
    }

    fn saturday_10am() -> String {
        // 2026-06-06 is a Saturday.
        Utc.with_ymd_and_hms(2026, 6, 6, 10, 0, 0)
            .unwrap()
            .to_rfc3339()
    }

    const ABAC_ENGINEERING: &str = r#"{
        "rules": [{
            "effect": "allow",
            "action": "read",
            "resource": "secret",
            "conditions": {
                "subject.roles": {"op": "contains", "value": "engineering"},
                "subject.clearance": {"op": "ge", "value": "confidential"}
            }
        }]
    }"#;

    const HCL_PROD_DENY: &str = "path \"secret/data/prod/*\" {\n  capabilities = [\"deny\"]\n}\n";

    const CONTEXT_BUSINESS_HOURS: &str = r#"{
        "time_windows": [{"days": ["mon","tue","wed","thu","fri"], "start": "09:00", "end": "17:00"}]
    }"#;

    fn combination_policies() -> Vec<PolicyRecord> {
        vec![
            record("abac-eng", PolicyKind::Abac, ABAC_ENGINEERING),
            record("hcl-prod", PolicyKind::Hcl, HCL_PROD_DENY),
            record("ctx-hours", PolicyKind::Context, CONTEXT_BUSINESS_HOURS),
        ]
    }

    #[test]
    fn hcl_deny_beats_abac_permit() {
        let policies = combination_policies();
        let mut req = request("read", "secret/data/prod/db");
        req.environment_attributes
            .insert("now".to_owned(), Value::String(tuesday_10am()));

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn abac_permit_applies_off_the_denied_path() {
        let policies = combination_policies();
        let mut req = request("read", "secret/data/staging/db");
        req.environment_attributes
            .insert("now".to_owned(), Value::String(tuesday_10am()));

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);
    }

    #[test]
    fn context_denies_outside_business_hours() {
        let policies = combination_policies();
        let mut req = request("read", "secret/data/staging/db");
        req.environment_attributes
            .insert("now".to_owned(), Value::String(saturday_10am()));

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn no_matching_policy_is_default_deny() {
        let decision = evaluate_with_policies(
            &[],
            &request("read", "secret/data/x"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.reasons, vec!["no matching policy".to_owned()]);
    }

    #[test]
    fn missing_abac_attribute_makes_condition_false() {
        let policies = vec![record("abac-eng", PolicyKind::Abac, ABAC_ENGINEERING)];
        let mut req = request("read", "secret/data/staging/db");
        req.subject_attributes.remove("clearance");

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn rbac_wildcard_grant_permits() {
        let policies = vec![record(
            "rbac",
            PolicyKind::Rbac,
            r#"{"roles":{"engineering":["secret/data/staging/*:read"]}}"#,
        )];
        let decision = evaluate_with_policies(
            &policies,
            &request("read", "secret/data/staging/db"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Permit);

        let decision = evaluate_with_policies(
            &policies,
            &request("delete", "secret/data/staging/db"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn rbac_star_permission_matches_everything() {
        let policies = vec![record(
            "rbac-root",
            PolicyKind::Rbac,
            r#"{"roles":{"engineering":["*"]}}"#,
        )];
        let decision = evaluate_with_policies(
            &policies,
            &request("sudo", "transit/keys/payments"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Permit);
    }

    #[test]
    fn higher_priority_deny_is_reported() {
        let mut deny_a = record("a-deny", PolicyKind::Hcl, HCL_PROD_DENY);
        deny_a.priority = 1;
        let mut deny_b = record("b-deny", PolicyKind::Hcl, HCL_PROD_DENY);
        deny_b.priority = 9;

        let decision = evaluate_with_policies(
            &[deny_a, deny_b],
            &request("read", "secret/data/prod/db"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Deny);
        assert!(decision.reasons[0].contains("b-deny"));
    }

    #[test]
    fn equal_priority_ties_break_lexicographically() {
        let deny_a = record("a-deny", PolicyKind::Hcl, HCL_PROD_DENY);
        let deny_b = record("b-deny", PolicyKind::Hcl, HCL_PROD_DENY);
        let decision = evaluate_with_policies(
            &[deny_b, deny_a],
            &request("read", "secret/data/prod/db"),
            RiskThresholds::default(),
        );
        assert!(decision.reasons[0].contains("a-deny"));
    }

    #[test]
    fn risk_above_deny_threshold_denies() {
        let policies = vec![record(
            "rbac",
            PolicyKind::Rbac,
            r#"{"roles":{"engineering":["*"]}}"#,
        )];
        let mut req = request("read", "secret/data/x");
        req.environment_attributes
            .insert("risk_score".to_owned(), Value::from(90u64));

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn risk_above_mfa_threshold_annotates_permit() {
        let policies = vec![record(
            "rbac",
            PolicyKind::Rbac,
            r#"{"roles":{"engineering":["*"]}}"#,
        )];
        let mut req = request("read", "secret/data/x");
        req.environment_attributes
            .insert("risk_score".to_owned(), Value::from(70u64));

        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);
        assert_eq!(decision.required_action, Some(RequiredAction::Mfa));
    }

    #[test]
    fn context_device_compliance_required() {
        let ctx = record(
            "ctx-device",
            PolicyKind::Context,
            r#"{"require_device_compliant": true}"#,
        );
        let rbac = record("rbac", PolicyKind::Rbac, r#"{"roles":{"engineering":["*"]}}"#);

        let mut req = request("read", "secret/data/x");
        let decision = evaluate_with_policies(
            &[ctx.clone(), rbac.clone()],
            &req,
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Deny);

        req.environment_attributes
            .insert("device_compliant".to_owned(), Value::Bool(true));
        let decision = evaluate_with_policies(&[ctx, rbac], &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);
    }

    #[test]
    fn context_country_lists() {
        let ctx = record(
            "ctx-geo",
            PolicyKind::Context,
            r#"{"allowed_countries": ["DE", "NL"], "denied_countries": ["KP"]}"#,
        );
        let rbac = record("rbac", PolicyKind::Rbac, r#"{"roles":{"engineering":["*"]}}"#);

        let mut req = request("read", "secret/data/x");
        req.environment_attributes
            .insert("geo_country".to_owned(), Value::String("DE".to_owned()));
        let decision =
            evaluate_with_policies(&[ctx.clone(), rbac.clone()], &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);

        req.environment_attributes
            .insert("geo_country".to_owned(), Value::String("US".to_owned()));
        let decision =
            evaluate_with_policies(&[ctx, rbac], &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn impossible_travel_denies() {
        let ctx = record(
            "ctx-travel",
            PolicyKind::Context,
            r#"{"impossible_travel": {"max_speed_kmh": 900}}"#,
        );
        let rbac = record("rbac", PolicyKind::Rbac, r#"{"roles":{"engineering":["*"]}}"#);

        // Berlin to Sydney in one hour.
        let now = Utc.with_ymd_and_hms(2026, 6, 2, 10, 0, 0).unwrap();
        let mut req = request("read", "secret/data/x");
        req.environment_attributes
            .insert("now".to_owned(), Value::String(now.to_rfc3339()));
        req.environment_attributes
            .insert("geo_lat".to_owned(), Value::from(-33.87));
        req.environment_attributes
            .insert("geo_lon".to_owned(), Value::from(151.21));
        req.environment_attributes
            .insert("last_geo_lat".to_owned(), Value::from(52.52));
        req.environment_attributes
            .insert("last_geo_lon".to_owned(), Value::from(13.40));
        req.environment_attributes.insert(
            "last_seen_at".to_owned(),
            Value::String(
                Utc.with_ymd_and_hms(2026, 6, 2, 9, 0, 0)
                    .unwrap()
                    .to_rfc3339(),
            ),
        );

        let decision = evaluate_with_policies(&[ctx, rbac], &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
        assert!(decision.reasons[0].contains("impossible travel"));
    }

    #[test]
    fn hcl_template_substitution() {
        let body = "path \"kv/data/${subject.team}/*\" {\n  capabilities = [\"read\"]\n}\n";
        let policies = vec![record("hcl-team", PolicyKind::Hcl, body)];

        let mut req = request("read", "kv/data/payments/api-key");
        req.subject_attributes
            .insert("team".to_owned(), Value::String("payments".to_owned()));
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);

        req.subject_attributes
            .insert("team".to_owned(), Value::String("infra".to_owned()));
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn hcl_required_parameters_gate_permits() {
        let body = "path \"kv/data/audited/*\" {\n  capabilities = [\"read\"]\n  required_parameters = [\"reason\"]\n}\n";
        let policies = vec![record("hcl-params", PolicyKind::Hcl, body)];

        let mut req = request("read", "kv/data/audited/x");
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);

        req.resource_attributes.insert(
            "parameters".to_owned(),
            serde_json::json!({"reason": "incident-42"}),
        );
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);
    }

    #[test]
    fn path_pattern_star_is_single_segment() {
        assert!(path_pattern_matches("secret/data/prod/*", "secret/data/prod/db"));
        assert!(!path_pattern_matches(
            "secret/data/prod/*",
            "secret/data/prod/db/extra"
        ));
        assert!(!path_pattern_matches("secret/data/prod/*", "secret/data/prod"));
    }

    #[test]
    fn path_pattern_plus_is_any_depth() {
        assert!(path_pattern_matches("secret/+", "secret/data/prod/db"));
        assert!(path_pattern_matches("secret/+/db", "secret/data/prod/db"));
        assert!(path_pattern_matches("secret/+/db", "secret/db"));
        assert!(!path_pattern_matches("secret/+/db", "secret/data/prod/users"));
    }

    #[test]
    fn cidr_conditions() {
        assert!(ip_in_cidr("10.1.2.3", "10.0.0.0/8"));
        assert!(!ip_in_cidr("11.1.2.3", "10.0.0.0/8"));
        assert!(ip_in_cidr("192.168.1.77", "192.168.1.0/24"));
        assert!(ip_in_cidr("2001:db8::1", "2001:db8::/32"));
        assert!(!ip_in_cidr("2001:db9::1", "2001:db8::/32"));
        assert!(!ip_in_cidr("not-an-ip", "10.0.0.0/8"));
    }

    #[test]
    fn abac_in_and_cidr_operators() {
        let body = r#"{
            "rules": [{
                "effect": "allow",
                "action": "*",
                "resource": "*",
                "conditions": {
                    "subject.clearance": {"op": "in", "value": ["secret", "confidential"]},
                    "environment.ip": {"op": "cidr-in", "value": "10.0.0.0/8"}
                }
            }]
        }"#;
        let policies = vec![record("abac-net", PolicyKind::Abac, body)];

        let mut req = request("read", "secret/data/x");
        req.environment_attributes
            .insert("ip".to_owned(), Value::String("10.20.30.40".to_owned()));
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Permit);

        req.environment_attributes
            .insert("ip".to_owned(), Value::String("8.8.8.8".to_owned()));
        let decision = evaluate_with_policies(&policies, &req, RiskThresholds::default());
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn abac_deny_rule_beats_permit() {
        let body = r#"{
            "rules": [
                {"effect": "allow", "action": "read", "resource": "*"},
                {"effect": "deny", "action": "read", "resource": "secret/data/prod/*"}
            ]
        }"#;
        let policies = vec![record("abac-mixed", PolicyKind::Abac, body)];
        let decision = evaluate_with_policies(
            &policies,
            &request("read", "secret/data/prod/db"),
            RiskThresholds::default(),
        );
        assert_eq!(decision.effect, Effect::Deny);
    }

    #[test]
    fn parse_hcl_rejects_malformed_documents() {
        assert!(parse_hcl("path secret {").is_err());
        assert!(parse_hcl("path \"a\" {\n}").is_err());
        assert!(parse_hcl("path \"a\" {\n  capabilities = [\"fly\"]\n}").is_err());
        assert!(parse_hcl("path \"a\" {\n  capabilities = [\"read\"]\n").is_err());
        assert!(parse_hcl("").is_err());
    }

    #[test]
    fn validate_bodies() {
        assert!(validate_policy_body(PolicyKind::Rbac, r#"{"roles":{"a":["*"]}}"#).is_ok());
        assert!(validate_policy_body(PolicyKind::Rbac, r#"{"roles":{}}"#).is_err());
        assert!(validate_policy_body(PolicyKind::Abac, ABAC_ENGINEERING).is_ok());
        assert!(
            validate_policy_body(
                PolicyKind::Abac,
                r#"{"rules":[{"effect":"allow","action":"*","resource":"*","conditions":{"a":{"op":"zz","value":1}}}]}"#
            )
            .is_err()
        );
        assert!(validate_policy_body(PolicyKind::Hcl, HCL_PROD_DENY).is_ok());
        assert!(validate_policy_body(PolicyKind::Context, CONTEXT_BUSINESS_HOURS).is_ok());
        assert!(
            validate_policy_body(
                PolicyKind::Context,
                r#"{"time_windows":[{"days":["blursday"],"start":"09:00","end":"17:00"}]}"#
            )
            .is_err()
        );
    }
}
