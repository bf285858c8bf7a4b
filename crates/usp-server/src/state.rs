//! Shared application state.
//!
//! One [`AppState`] is constructed at the composition root in `main` and
//! shared across all handlers via `Arc`. Components receive their
//! dependencies explicitly at construction; nothing global exists beyond
//! this struct.

use std::sync::Arc;

use usp_core::audit::AuditSink;
use usp_core::authz::AuthzEvaluator;
use usp_core::database::DatabaseEngine;
use usp_core::hierarchy::KeyHierarchy;
use usp_core::kv::KvEngine;
use usp_core::lease::{LeaseManager, Scheduler};
use usp_core::policy::PolicyStore;
use usp_core::seal::SealController;
use usp_core::store::Store;
use usp_core::token::TokenStore;
use usp_core::transit::TransitEngine;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Typed persistence.
    pub store: Arc<Store>,
    /// DMK slot and subkey derivation.
    pub hierarchy: Arc<KeyHierarchy>,
    /// Seal state machine.
    pub seal: Arc<SealController>,
    /// Tamper-evident audit chain.
    pub audit: Arc<AuditSink>,
    /// API token store.
    pub tokens: Arc<TokenStore>,
    /// Policy CRUD.
    pub policies: Arc<PolicyStore>,
    /// Unified authorization evaluator.
    pub authz: Arc<AuthzEvaluator>,
    /// KV v2 engine.
    pub kv: Arc<KvEngine>,
    /// Transit engine.
    pub transit: Arc<TransitEngine>,
    /// Database secrets engine.
    pub database: Arc<DatabaseEngine>,
    /// Shared action heap (engines produce, the lease manager consumes).
    pub scheduler: Arc<Scheduler>,
    /// Background expiry/rotation worker (rotation-job CRUD lives here).
    pub lease_manager: Arc<LeaseManager>,
    /// Seal-plane bootstrap credential.
    pub bootstrap_token: String,
    /// Default share count for `Init` requests that omit one.
    pub default_shares: u8,
    /// Default threshold for `Init` requests that omit one.
    pub default_threshold: u8,
    /// Default per-connector pool cap for database configs that omit one.
    pub db_pool_default: u32,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
