//! API token store for USP.
//!
//! Tokens are the bearer credentials the edge exchanges for a principal when
//! it builds a [`RequestContext`](crate::context::RequestContext). They are
//! UUID v4 values (128 bits of OS CSPRNG randomness), stored only as their
//! SHA-256 hash; the plaintext is returned once at creation and never
//! persisted. Lookup hashes the presented token and fetches by hash, so no
//! stored value ever needs a timing-safe comparison against caller input.
//!
//! The bootstrap credential used by the seal plane is NOT a token from this
//! store — it comes from configuration and is checked at the edge.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::TokenError;
use crate::store::Store;

/// Storage prefix for token entries.
const TOKEN_PREFIX: &str = "sys/tokens/";

/// A stored token entry. The storage key is the token hash, so nothing in
/// the record recovers the plaintext token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// SHA-256 hash of the token (hex-encoded).
    pub token_hash: String,
    /// Principal this token authenticates as.
    pub principal_id: String,
    /// Roles granted to the principal.
    pub roles: Vec<String>,
    /// Subject attributes carried into authorization (clearance, team, ...).
    pub attributes: HashMap<String, serde_json::Value>,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
    /// When the token expires (`None` = never).
    pub expires_at: Option<DateTime<Utc>>,
    /// Display name for audit logs.
    pub display_name: String,
}

/// Parameters for creating a new token.
#[derive(Debug, Clone)]
pub struct CreateTokenParams {
    /// Principal the token authenticates as.
    pub principal_id: String,
    /// Roles to grant.
    pub roles: Vec<String>,
    /// Subject attributes.
    pub attributes: HashMap<String, serde_json::Value>,
    /// Time-to-live from now (`None` = never expires).
    pub ttl: Option<Duration>,
    /// Display name for audit logs.
    pub display_name: String,
}

/// Manages token creation, lookup, and revocation.
pub struct TokenStore {
    store: Arc<Store>,
}

impl TokenStore {
    /// Create a new token store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a new token and persist its hash.
    ///
    /// Returns the plaintext token — shown once, never stored.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if persistence fails.
    pub async fn create(&self, params: CreateTokenParams) -> Result<String, TokenError> {
        let plaintext = uuid::Uuid::new_v4().to_string();
        let token_hash = hash_token(&plaintext);
        let now = Utc::now();

        let entry = TokenEntry {
            token_hash: token_hash.clone(),
            principal_id: params.principal_id,
            roles: params.roles,
            attributes: params.attributes,
            created_at: now,
            expires_at: params.ttl.map(|ttl| now + ttl),
            display_name: params.display_name,
        };

        self.store
            .put_json(&format!("{TOKEN_PREFIX}{token_hash}"), &entry)
            .await?;

        info!(display_name = %entry.display_name, principal = %entry.principal_id, "token created");

        Ok(plaintext)
    }

    /// Look up a token by its plaintext value, validating expiry.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if the token hash doesn't exist.
    /// - [`TokenError::Expired`] if the token's TTL has passed.
    /// - [`TokenError::Store`] if persistence fails.
    pub async fn lookup(&self, plaintext: &str) -> Result<TokenEntry, TokenError> {
        let token_hash = hash_token(plaintext);
        let entry: TokenEntry = self
            .store
            .get_json(&format!("{TOKEN_PREFIX}{token_hash}"))
            .await?
            .ok_or(TokenError::NotFound)?;

        if let Some(expires_at) = entry.expires_at {
            if Utc::now() > expires_at {
                return Err(TokenError::Expired {
                    expired_at: expires_at.to_rfc3339(),
                });
            }
        }

        Ok(entry)
    }

    /// Revoke a token by its plaintext value. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if persistence fails.
    pub async fn revoke(&self, plaintext: &str) -> Result<(), TokenError> {
        let token_hash = hash_token(plaintext);
        self.store
            .delete(&format!("{TOKEN_PREFIX}{token_hash}"))
            .await?;
        info!(
            token_hash_prefix = &token_hash[..8.min(token_hash.len())],
            "token revoked"
        );
        Ok(())
    }
}

/// Hash a plaintext token with SHA-256, hex-encoded. One-way.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(digest)
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use usp_storage::MemoryBackend;

    use super::*;

    fn make_store() -> TokenStore {
        TokenStore::new(Arc::new(Store::new(Arc::new(MemoryBackend::new()))))
    }

    fn params() -> CreateTokenParams {
        CreateTokenParams {
            principal_id: "user-1".to_owned(),
            roles: vec!["engineering".to_owned()],
            attributes: HashMap::new(),
            ttl: None,
            display_name: "test".to_owned(),
        }
    }

    #[tokio::test]
    async fn create_and_lookup_roundtrip() {
        let tokens = make_store();
        let plaintext = tokens.create(params()).await.unwrap();
        let entry = tokens.lookup(&plaintext).await.unwrap();
        assert_eq!(entry.principal_id, "user-1");
        assert_eq!(entry.roles, vec!["engineering".to_owned()]);
    }

    #[tokio::test]
    async fn lookup_unknown_token_fails() {
        let tokens = make_store();
        let err = tokens.lookup("no-such-token").await.unwrap_err();
        assert!(matches!(err, TokenError::NotFound));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let tokens = make_store();
        let mut p = params();
        p.ttl = Some(Duration::seconds(-1));
        let plaintext = tokens.create(p).await.unwrap();
        let err = tokens.lookup(&plaintext).await.unwrap_err();
        assert!(matches!(err, TokenError::Expired { .. }));
    }

    #[tokio::test]
    async fn revoke_removes_token() {
        let tokens = make_store();
        let plaintext = tokens.create(params()).await.unwrap();
        tokens.revoke(&plaintext).await.unwrap();
        let err = tokens.lookup(&plaintext).await.unwrap_err();
        assert!(matches!(err, TokenError::NotFound));
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let tokens = make_store();
        let plaintext = tokens.create(params()).await.unwrap();
        tokens.revoke(&plaintext).await.unwrap();
        tokens.revoke(&plaintext).await.unwrap();
    }

    #[test]
    fn hash_is_stable_and_one_way() {
        let h1 = hash_token("abc");
        let h2 = hash_token("abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_token("abd"));
    }
}
