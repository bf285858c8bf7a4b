//! Key hierarchy for USP.
//!
//! Holds the data master key (DMK) in memory while the platform is unsealed
//! and derives purpose-bound subkeys from it on demand. The DMK itself is
//! never exposed; callers only ever receive derived [`EncryptionKey`] values.
//!
//! # Security model
//!
//! - The DMK exists only in process memory, installed by the seal controller
//!   on a successful unseal and zeroized when the platform seals.
//! - Every subsystem derives its own subkey via HKDF with a distinct info
//!   label (`"secret"`, `"transit:<name>"`, `"audit"`, `"db-cred"`), so a
//!   compromise of one subkey does not extend to the others.
//! - While sealed, every derivation fails with [`HierarchyError::Sealed`].
//!   Sealing takes the write half of the lock and therefore waits for
//!   in-flight derivations to drain; derived keys already handed out are
//!   owned copies and die with their operations.

use tokio::sync::RwLock;

use crate::crypto::{self, EncryptionKey};
use crate::error::HierarchyError;

/// The in-memory key hierarchy: an optional DMK slot plus HKDF derivation.
///
/// Shared across all engines behind an `Arc`. Engines never hold a derived
/// key across requests; they derive per operation.
pub struct KeyHierarchy {
    dmk: RwLock<Option<EncryptionKey>>,
}

impl KeyHierarchy {
    /// Create a new, sealed (empty) hierarchy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dmk: RwLock::new(None),
        }
    }

    /// Install the data master key, making the hierarchy available.
    pub async fn install(&self, dmk: EncryptionKey) {
        let mut guard = self.dmk.write().await;
        *guard = Some(dmk);
    }

    /// Remove and zeroize the data master key.
    ///
    /// Waits for in-flight derivations (read guards) to drain before the
    /// slot is cleared. The old key is zeroized on drop.
    pub async fn clear(&self) {
        let mut guard = self.dmk.write().await;
        *guard = None;
    }

    /// Whether a DMK is currently resident.
    pub async fn is_unsealed(&self) -> bool {
        self.dmk.read().await.is_some()
    }

    /// Derive the subkey for a purpose label.
    ///
    /// # Errors
    ///
    /// - [`HierarchyError::Sealed`] if no DMK is resident.
    /// - [`HierarchyError::Crypto`] if HKDF expansion fails.
    pub async fn derive(&self, purpose: &str) -> Result<EncryptionKey, HierarchyError> {
        self.derive_with_salt(purpose, None).await
    }

    /// Derive the subkey for a purpose label with an explicit salt.
    ///
    /// # Errors
    ///
    /// - [`HierarchyError::Sealed`] if no DMK is resident.
    /// - [`HierarchyError::Crypto`] if HKDF expansion fails.
    pub async fn derive_with_salt(
        &self,
        purpose: &str,
        salt: Option<&[u8]>,
    ) -> Result<EncryptionKey, HierarchyError> {
        let guard = self.dmk.read().await;
        let dmk = guard.as_ref().ok_or(HierarchyError::Sealed)?;
        let derived = crypto::derive_key(dmk, salt, purpose.as_bytes())?;
        Ok(derived)
    }
}

impl Default for KeyHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHierarchy").finish_non_exhaustive()
    }
}
