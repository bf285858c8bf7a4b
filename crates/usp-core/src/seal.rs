//! Seal/unseal lifecycle and the master-key hierarchy root.
//!
//! The protocol:
//!
//! 1. **Init**: generate a key-encryption key (KEK) and a data master key
//!    (DMK), store `Enc(KEK, DMK)` in the seal config, split the KEK into N
//!    Shamir shares with threshold K, and return the shares exactly once.
//!    The platform stays sealed.
//! 2. **Unseal**: operators submit shares one at a time. At K shares the
//!    KEK is reconstructed and used to decrypt the DMK, which is installed
//!    into the key hierarchy. The sole integrity check for a share set is
//!    whether the recovered KEK decrypts the stored DMK; any failure
//!    discards every collected share and returns to Sealed.
//! 3. **Seal**: zeroize the DMK. Every crypto-touching operation fails with
//!    `Sealed` until the next unseal.
//!
//! Status reporting never exposes collected share bytes, only counts.
//!
//! Seal-plane operations authenticate with a bootstrap credential at the
//! edge; they are deliberately usable while the token store's own plane is
//! unreachable behind the seal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::context::RequestContext;
use crate::error::{AuditError, SealError};
use crate::hierarchy::KeyHierarchy;
use crate::shamir::{self, KekShare};
use crate::store::Store;
use crate::token::{CreateTokenParams, TokenStore};
use crate::{crypto, crypto::EncryptionKey};

/// Storage key for the seal configuration.
const SEAL_CONFIG_KEY: &str = "sys/seal/config";

/// Associated data binding the encrypted DMK to its purpose.
const DMK_AAD: &[u8] = b"seal|dmk";

/// Persisted seal configuration. `encrypted_dmk` is the DMK sealed under
/// the KEK; everything else is non-sensitive bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    /// Total number of shares dealt at init.
    pub shares: u8,
    /// Shares required to reconstruct the KEK.
    pub threshold: u8,
    /// `Enc(KEK, DMK)`.
    pub encrypted_dmk: Vec<u8>,
    /// When the platform was initialized.
    pub created_at: DateTime<Utc>,
}

/// Result of a successful initialization. Both fields are shown once and
/// never persisted in this form.
#[derive(Debug)]
pub struct InitResult {
    /// Base64-encoded KEK shares for operator distribution.
    pub shares: Vec<String>,
    /// Root API token.
    pub root_token: String,
}

/// Progress of an in-flight unseal.
#[derive(Debug, Clone, Copy)]
pub struct UnsealProgress {
    /// Shares required.
    pub threshold: u8,
    /// Shares collected so far.
    pub progress: u8,
}

/// Machine-observable seal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SealStateKind {
    Uninitialized,
    Sealed,
    Unsealing,
    Unsealed,
}

/// Snapshot returned by the status endpoint. Never carries share bytes.
#[derive(Debug, Clone, Serialize)]
pub struct SealStatus {
    pub state: SealStateKind,
    pub initialized: bool,
    pub sealed: bool,
    pub threshold: u8,
    pub shares: u8,
    pub progress: u8,
}

/// Drives the seal state machine and owns the pending-share accumulator.
pub struct SealController {
    store: Arc<Store>,
    hierarchy: Arc<KeyHierarchy>,
    audit: Arc<AuditSink>,
    tokens: Arc<TokenStore>,
    /// Shares collected during an unseal attempt. Discarded on success,
    /// on any recovery failure, and on seal.
    pending: Mutex<Vec<KekShare>>,
}

impl SealController {
    /// Create a new controller.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        hierarchy: Arc<KeyHierarchy>,
        audit: Arc<AuditSink>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            store,
            hierarchy,
            audit,
            tokens,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Initialize the platform.
    ///
    /// Leaves the platform **sealed**; the operator must unseal with the
    /// returned shares.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadyInitialized`] on repeat initialization.
    /// - [`SealError::InvalidConfig`] for out-of-bounds parameters
    ///   (`2 <= shares <= 10`, `1 <= threshold <= shares`).
    /// - [`SealError::Crypto`] / [`SealError::Store`] on failure.
    pub async fn init(
        &self,
        ctx: &RequestContext,
        shares: u8,
        threshold: u8,
    ) -> Result<InitResult, SealError> {
        validate_config(shares, threshold)?;
        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }

        let kek = EncryptionKey::generate();
        let dmk = EncryptionKey::generate();
        let encrypted_dmk = crypto::seal_field(&kek, dmk.as_bytes(), DMK_AAD)?;
        let kek_shares = shamir::split_secret(kek.as_bytes(), shares, threshold)
            .map_err(SealError::InvalidShare)?;

        let config = SealConfig {
            shares,
            threshold,
            encrypted_dmk,
            created_at: Utc::now(),
        };
        self.store.put_json(SEAL_CONFIG_KEY, &config).await?;

        let root_token = self
            .tokens
            .create(CreateTokenParams {
                principal_id: "root".to_owned(),
                roles: vec!["root".to_owned()],
                attributes: std::collections::HashMap::new(),
                ttl: None,
                display_name: "root".to_owned(),
            })
            .await
            .map_err(|e| SealError::InvalidConfig {
                reason: format!("root token creation failed: {e}"),
            })?;

        // The init record needs the audit subkey, so it is written under a
        // transient install of the fresh DMK; the platform stays sealed.
        self.hierarchy.install(dmk.clone()).await;
        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Init, ctx, true)
                    .resource("sys/seal")
                    .action("init")
                    .details(serde_json::json!({
                        "shares": shares,
                        "threshold": threshold,
                    })),
            )
            .await;
        self.hierarchy.clear().await;

        if let Err(e) = audit_result {
            self.store.delete(SEAL_CONFIG_KEY).await?;
            let _ = self.tokens.revoke(&root_token).await;
            return Err(e.into());
        }

        info!(shares, threshold, "platform initialized");
        Ok(InitResult {
            shares: kek_shares.iter().map(KekShare::to_base64).collect(),
            root_token,
        })
    }

    /// Submit one unseal share.
    ///
    /// Returns `Ok(Some(progress))` while below the threshold, `Ok(None)`
    /// once the platform unseals.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] / [`SealError::AlreadyUnsealed`]
    ///   outside the Sealed/Unsealing states.
    /// - [`SealError::InvalidShare`] for malformed shares and duplicate
    ///   indices (the attempt counter does not advance).
    /// - [`SealError::RecoveryFailed`] when the collected set fails to
    ///   recover a KEK that decrypts the DMK. Every collected share is
    ///   discarded and the state returns to Sealed.
    pub async fn submit_share(
        &self,
        ctx: &RequestContext,
        share_b64: &str,
    ) -> Result<Option<UnsealProgress>, SealError> {
        let config = self
            .load_config()
            .await?
            .ok_or(SealError::NotInitialized)?;
        if self.hierarchy.is_unsealed().await {
            return Err(SealError::AlreadyUnsealed);
        }

        let share = KekShare::from_base64(share_b64).map_err(SealError::InvalidShare)?;

        let collected = {
            let mut pending = self.pending.lock().await;
            if pending.iter().any(|p| p.index() == share.index()) {
                return Err(SealError::InvalidShare(
                    crate::error::ShamirError::DuplicateShareIndex {
                        index: share.index(),
                    },
                ));
            }
            pending.push(share);

            let progress = u8::try_from(pending.len()).unwrap_or(u8::MAX);
            if progress < config.threshold {
                return Ok(Some(UnsealProgress {
                    threshold: config.threshold,
                    progress,
                }));
            }
            // Threshold reached: take the set, leaving the accumulator
            // empty whatever happens next.
            std::mem::take(&mut *pending)
        };

        let kek_bytes =
            shamir::combine_shares(&collected, config.threshold).map_err(|e| {
                SealError::RecoveryFailed {
                    reason: e.to_string(),
                }
            })?;
        let kek =
            EncryptionKey::from_slice(&kek_bytes).map_err(|e| SealError::RecoveryFailed {
                reason: e.to_string(),
            })?;

        let dmk_bytes = crypto::open_field(&kek, &config.encrypted_dmk, DMK_AAD).map_err(|_| {
            SealError::RecoveryFailed {
                reason: "reconstructed key failed to decrypt the data master key".to_owned(),
            }
        })?;
        let dmk = EncryptionKey::from_slice(&dmk_bytes).map_err(|e| SealError::RecoveryFailed {
            reason: e.to_string(),
        })?;

        self.hierarchy.install(dmk).await;

        // Replay the audit chain now that the audit subkey is derivable. A
        // broken chain leaves the platform unsealed but refuses audited
        // mutations until an operator acknowledges.
        match self.audit.verify_chain().await {
            Ok(_) => {}
            Err(AuditError::ChainBroken { seq, reason }) => {
                warn!(seq, reason = %reason, "audit chain broken; mutations refused until acknowledged");
            }
            Err(e) => {
                self.hierarchy.clear().await;
                return Err(e.into());
            }
        }

        self.append_lifecycle_event(ctx, AuditEventType::Unseal, "unseal")
            .await;

        info!("platform unsealed");
        Ok(None)
    }

    /// Abandon the current unseal attempt, discarding collected shares.
    pub async fn reset(&self) {
        self.pending.lock().await.clear();
    }

    /// Seal the platform, zeroizing the key hierarchy.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadySealed`] when not unsealed.
    pub async fn seal(&self, ctx: &RequestContext) -> Result<(), SealError> {
        if !self.hierarchy.is_unsealed().await {
            return Err(SealError::AlreadySealed);
        }

        // The seal record must be written while the audit subkey is still
        // derivable.
        self.append_lifecycle_event(ctx, AuditEventType::Seal, "seal")
            .await;

        self.pending.lock().await.clear();
        self.hierarchy.clear().await;

        info!("platform sealed");
        Ok(())
    }

    /// Whether the platform has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Store`] on persistence failure.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.store.exists(SEAL_CONFIG_KEY).await?)
    }

    /// Current status snapshot. Readable in every state.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Store`] on persistence failure.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let config = self.load_config().await?;
        let sealed = !self.hierarchy.is_unsealed().await;
        let progress = u8::try_from(self.pending.lock().await.len()).unwrap_or(u8::MAX);

        let (initialized, threshold, shares) =
            config.map_or((false, 0, 0), |c| (true, c.threshold, c.shares));

        let state = match (initialized, sealed, progress) {
            (false, _, _) => SealStateKind::Uninitialized,
            (true, false, _) => SealStateKind::Unsealed,
            (true, true, 0) => SealStateKind::Sealed,
            (true, true, _) => SealStateKind::Unsealing,
        };

        Ok(SealStatus {
            state,
            initialized,
            sealed,
            threshold,
            shares,
            progress,
        })
    }

    async fn load_config(&self) -> Result<Option<SealConfig>, SealError> {
        Ok(self.store.get_json(SEAL_CONFIG_KEY).await?)
    }

    /// Append a seal-lifecycle audit record. A broken chain downgrades to a
    /// warning: seal/unseal must never be blocked by the audit pipeline's
    /// fatal state, which already refuses every other mutation.
    async fn append_lifecycle_event(
        &self,
        ctx: &RequestContext,
        event_type: AuditEventType,
        action: &str,
    ) {
        let result = self
            .audit
            .append(
                AuditEvent::new(event_type, ctx, true)
                    .resource("sys/seal")
                    .action(action),
            )
            .await;
        if let Err(e) = result {
            warn!(action, error = %e, "seal lifecycle audit append failed");
        }
    }
}

impl std::fmt::Debug for SealController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealController").finish_non_exhaustive()
    }
}

/// Bounds: `2 <= shares <= 10`, `1 <= threshold <= shares`.
fn validate_config(shares: u8, threshold: u8) -> Result<(), SealError> {
    if !(2..=10).contains(&shares) {
        return Err(SealError::InvalidConfig {
            reason: format!("share count must be 2-10, got {shares}"),
        });
    }
    if threshold == 0 {
        return Err(SealError::InvalidConfig {
            reason: "threshold must be at least 1".to_owned(),
        });
    }
    if threshold > shares {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold ({threshold}) cannot exceed share count ({shares})"),
        });
    }
    Ok(())
}
