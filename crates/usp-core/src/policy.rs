//! Policy storage for USP.
//!
//! Policies are persisted records with a type tag and an opaque body that
//! the [`authz`](crate::authz) evaluator knows how to parse: RBAC role
//! grants, ABAC rule sets, HCL-style path-capability documents, and context
//! policies. This module owns CRUD and validation; evaluation lives in
//! `authz`.
//!
//! One built-in policy exists: `root`, an RBAC policy granting every
//! permission to the `root` role. It cannot be modified or deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::authz;
use crate::context::RequestContext;
use crate::error::PolicyError;
use crate::store::Store;

/// Storage prefix for policy records.
const POLICY_PREFIX: &str = "sys/policies/";

/// Id of the built-in root policy.
pub const ROOT_POLICY_ID: &str = "root";

/// Default cap on policy body size.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024;

/// The policy families the evaluator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Role → permission grants.
    Rbac,
    /// Attribute-based rules with conditions.
    Abac,
    /// HCL-style path-capability document.
    Hcl,
    /// Environmental constraints (time, geo, network, device, risk).
    Context,
}

/// Effect applied when a policy's rules don't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultEffect {
    Allow,
    Deny,
}

/// A stored policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// Opaque id; also the storage key suffix.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Which family the body belongs to.
    pub kind: PolicyKind,
    /// Body, parsed per `kind` by the evaluator.
    pub body: String,
    /// Tie-break priority: higher wins within the same effect class.
    pub priority: i64,
    /// Effect when no rule in this policy matches.
    pub effect_default: DefaultEffect,
    /// Inactive policies are ignored by the evaluator.
    pub active: bool,
    /// When the policy was created.
    pub created_at: DateTime<Utc>,
    /// When the policy was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Policy CRUD over the store.
pub struct PolicyStore {
    store: Arc<Store>,
    audit: Arc<AuditSink>,
    max_body_bytes: usize,
}

impl PolicyStore {
    /// Create a new policy store with the default body-size cap.
    #[must_use]
    pub fn new(store: Arc<Store>, audit: Arc<AuditSink>) -> Self {
        Self {
            store,
            audit,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Override the body-size cap.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Create or update a policy.
    ///
    /// The body is parsed for its declared kind before anything is written.
    /// The mutation is rolled back if the audit append fails.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] when targeting the root policy.
    /// - [`PolicyError::BodyTooLarge`] / [`PolicyError::Invalid`] on
    ///   validation failure.
    /// - [`PolicyError::Store`] / [`PolicyError::Audit`] on persistence
    ///   failure.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        record: PolicyRecord,
    ) -> Result<(), PolicyError> {
        if record.id == ROOT_POLICY_ID {
            return Err(PolicyError::BuiltIn {
                name: record.id,
            });
        }
        if record.body.len() > self.max_body_bytes {
            return Err(PolicyError::BodyTooLarge {
                limit: self.max_body_bytes,
                actual: record.body.len(),
            });
        }
        authz::validate_policy_body(record.kind, &record.body)
            .map_err(|reason| PolicyError::Invalid { reason })?;

        let key = policy_key(&record.id);
        let _guard = self.store.lock(&format!("policy:{}", record.id)).await;
        let previous: Option<PolicyRecord> = self.store.get_json(&key).await?;
        self.store.put_json(&key, &record).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::PolicyChange, ctx, true)
                    .resource(format!("policy/{}", record.id))
                    .action(if previous.is_some() { "update" } else { "create" })
                    .details(serde_json::json!({
                        "kind": record.kind,
                        "active": record.active,
                        "priority": record.priority,
                    })),
            )
            .await;

        if let Err(e) = audit_result {
            // Roll the mutation back so the caller observes a consistent
            // no-write-without-audit outcome.
            match previous {
                Some(prev) => self.store.put_json(&key, &prev).await?,
                None => self.store.delete(&key).await?,
            }
            return Err(e.into());
        }

        info!(id = %record.id, kind = ?record.kind, "policy written");
        Ok(())
    }

    /// Read a policy by id. The built-in root policy is synthesized.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if the id doesn't exist.
    /// - [`PolicyError::Store`] if persistence fails.
    pub async fn get(&self, id: &str) -> Result<PolicyRecord, PolicyError> {
        if id == ROOT_POLICY_ID {
            return Ok(root_policy());
        }
        self.store
            .get_json(&policy_key(id))
            .await?
            .ok_or_else(|| PolicyError::NotFound { id: id.to_owned() })
    }

    /// Delete a policy by id.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] when targeting the root policy.
    /// - [`PolicyError::NotFound`] if the id doesn't exist.
    /// - [`PolicyError::Store`] / [`PolicyError::Audit`] on persistence
    ///   failure.
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<(), PolicyError> {
        if id == ROOT_POLICY_ID {
            return Err(PolicyError::BuiltIn {
                name: id.to_owned(),
            });
        }

        let key = policy_key(id);
        let _guard = self.store.lock(&format!("policy:{id}")).await;
        let previous: PolicyRecord = self
            .store
            .get_json(&key)
            .await?
            .ok_or_else(|| PolicyError::NotFound { id: id.to_owned() })?;
        self.store.delete(&key).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::PolicyChange, ctx, true)
                    .resource(format!("policy/{id}"))
                    .action("delete"),
            )
            .await;
        if let Err(e) = audit_result {
            self.store.put_json(&key, &previous).await?;
            return Err(e.into());
        }

        info!(id = %id, "policy deleted");
        Ok(())
    }

    /// List all policy ids, including the built-in root policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if persistence fails.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let keys = self.store.list(POLICY_PREFIX).await?;
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect();
        if !ids.iter().any(|i| i == ROOT_POLICY_ID) {
            ids.push(ROOT_POLICY_ID.to_owned());
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every active policy, built-ins included. This is the evaluator's
    /// input set.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if persistence fails.
    pub async fn load_active(&self) -> Result<Vec<PolicyRecord>, PolicyError> {
        let keys = self.store.list(POLICY_PREFIX).await?;
        let mut records = vec![root_policy()];
        for key in &keys {
            if let Some(record) = self.store.get_json::<PolicyRecord>(key).await? {
                if record.active {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

/// The built-in root policy: the `root` role may do anything.
#[must_use]
pub fn root_policy() -> PolicyRecord {
    PolicyRecord {
        id: ROOT_POLICY_ID.to_owned(),
        name: "root".to_owned(),
        kind: PolicyKind::Rbac,
        body: r#"{"roles":{"root":["*"]}}"#.to_owned(),
        priority: i64::MAX,
        effect_default: DefaultEffect::Deny,
        active: true,
        created_at: DateTime::<Utc>::MIN_UTC,
        updated_at: DateTime::<Utc>::MIN_UTC,
    }
}

fn policy_key(id: &str) -> String {
    format!("{POLICY_PREFIX}{id}")
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}
