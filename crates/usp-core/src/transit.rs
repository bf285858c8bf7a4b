//! Transit engine: cryptography as a service.
//!
//! Callers send plaintext and receive ciphertext (and vice versa) without
//! ever seeing key material. Keys are named and versioned: encrypt and sign
//! always use the current version, decrypt and verify accept any version at
//! or above the key's `min_decryption_version`. Rotation adds a version and
//! advances the current pointer without re-encrypting anything.
//!
//! Wire format: `vault:v<version>:<base64url>` where the decoded payload is
//! `nonce (12) ‖ ciphertext ‖ tag (16)` for encryption and the raw signature
//! for signing.
//!
//! Key material at rest is sealed with the per-key subkey
//! `derive("transit:<name>")`. Export of plaintext material is refused
//! unless the key was created exportable; the flag cannot be enabled later.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::context::RequestContext;
use crate::error::TransitError;
use crate::hierarchy::KeyHierarchy;
use crate::store::Store;
use crate::{crypto, crypto::EncryptionKey};

/// Storage prefix for transit key records.
const KEY_PREFIX: &str = "transit/keys/";

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitAlgorithm {
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "rsa-2048")]
    Rsa2048,
    #[serde(rename = "rsa-4096")]
    Rsa4096,
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
}

impl TransitAlgorithm {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes256-gcm",
            Self::Ed25519 => "ed25519",
            Self::Rsa2048 => "rsa-2048",
            Self::Rsa4096 => "rsa-4096",
            Self::EcdsaP256 => "ecdsa-p256",
        }
    }

    /// Whether this build carries an implementation for the algorithm.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Aes256Gcm | Self::Ed25519)
    }

    fn is_signing(self) -> bool {
        !matches!(self, Self::Aes256Gcm)
    }
}

/// One stored key version. `material` is a sealed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransitKeyVersionRecord {
    version: u32,
    material: Vec<u8>,
    created_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

/// A named transit key with its version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransitKeyRecord {
    name: String,
    algorithm: TransitAlgorithm,
    current_version: u32,
    min_decryption_version: u32,
    exportable: bool,
    deletion_allowed: bool,
    created_at: DateTime<Utc>,
    versions: HashMap<u32, TransitKeyVersionRecord>,
}

/// Public metadata about a key (no material).
#[derive(Debug, Clone, Serialize)]
pub struct TransitKeyInfo {
    pub name: String,
    pub algorithm: TransitAlgorithm,
    pub current_version: u32,
    pub min_decryption_version: u32,
    pub exportable: bool,
    pub deletion_allowed: bool,
    pub version_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Options for key creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateKeyOptions {
    pub exportable: bool,
    pub deletion_allowed: bool,
}

/// Mutable key configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateKeyConfig {
    pub min_decryption_version: Option<u32>,
    pub deletion_allowed: Option<bool>,
}

/// The transit engine.
pub struct TransitEngine {
    store: Arc<Store>,
    hierarchy: Arc<KeyHierarchy>,
    audit: Arc<AuditSink>,
}

impl TransitEngine {
    /// Create a new transit engine.
    #[must_use]
    pub fn new(store: Arc<Store>, hierarchy: Arc<KeyHierarchy>, audit: Arc<AuditSink>) -> Self {
        Self {
            store,
            hierarchy,
            audit,
        }
    }

    /// Create a named key. Refuses if the name exists.
    ///
    /// # Errors
    ///
    /// - [`TransitError::AlreadyExists`] if the name is taken.
    /// - [`TransitError::Unsupported`] for algorithms this build lacks.
    /// - [`TransitError::Audit`] if the audit append fails (rolled back).
    pub async fn create_key(
        &self,
        ctx: &RequestContext,
        name: &str,
        algorithm: TransitAlgorithm,
        options: CreateKeyOptions,
    ) -> Result<(), TransitError> {
        validate_name(name)?;
        if !algorithm.is_supported() {
            return Err(TransitError::Unsupported {
                algorithm: algorithm.as_str().to_owned(),
            });
        }

        let _guard = self.store.lock(&format!("transit:{name}")).await;
        if self.store.exists(&key_storage_key(name)).await? {
            return Err(TransitError::AlreadyExists {
                name: name.to_owned(),
            });
        }

        let now = Utc::now();
        let material = self.seal_material(name, 1, EncryptionKey::generate().as_bytes()).await?;
        let mut versions = HashMap::new();
        versions.insert(
            1,
            TransitKeyVersionRecord {
                version: 1,
                material,
                created_at: now,
                archived_at: None,
            },
        );
        let record = TransitKeyRecord {
            name: name.to_owned(),
            algorithm,
            current_version: 1,
            min_decryption_version: 1,
            exportable: options.exportable,
            deletion_allowed: options.deletion_allowed,
            created_at: now,
            versions,
        };
        self.save_key(&record).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Write, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("create-key")
                    .details(serde_json::json!({
                        "algorithm": algorithm.as_str(),
                        "exportable": options.exportable,
                    })),
            )
            .await;
        if let Err(e) = audit_result {
            self.store.delete(&key_storage_key(name)).await?;
            return Err(e.into());
        }

        info!(name, algorithm = algorithm.as_str(), "transit key created");
        Ok(())
    }

    /// Rotate a key: generate fresh material as version `current + 1` and
    /// advance the current pointer.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes; rolled back if the audit append fails.
    pub async fn rotate_key(&self, ctx: &RequestContext, name: &str) -> Result<u32, TransitError> {
        let _guard = self.store.lock(&format!("transit:{name}")).await;
        let mut record = self.load_key(name).await?;
        let previous = record.clone();

        let now = Utc::now();
        let new_version = record.current_version.saturating_add(1);
        let material = self
            .seal_material(name, new_version, EncryptionKey::generate().as_bytes())
            .await?;
        if let Some(old) = record.versions.get_mut(&record.current_version) {
            old.archived_at = Some(now);
        }
        record.versions.insert(
            new_version,
            TransitKeyVersionRecord {
                version: new_version,
                material,
                created_at: now,
                archived_at: None,
            },
        );
        record.current_version = new_version;
        self.save_key(&record).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Rotate, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("rotate")
                    .details(serde_json::json!({"new_version": new_version})),
            )
            .await;
        if let Err(e) = audit_result {
            self.save_key(&previous).await?;
            return Err(e.into());
        }

        info!(name, version = new_version, "transit key rotated");
        Ok(new_version)
    }

    /// Encrypt with the key's current version.
    ///
    /// `context` is caller-supplied associated data; the same value must be
    /// presented at decryption.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes, plus [`TransitError::WrongAlgorithm`]
    /// for signing-only keys.
    pub async fn encrypt(
        &self,
        ctx: &RequestContext,
        name: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<String, TransitError> {
        let record = self.load_key(name).await?;
        if record.algorithm != TransitAlgorithm::Aes256Gcm {
            return Err(TransitError::WrongAlgorithm {
                algorithm: record.algorithm.as_str().to_owned(),
                operation: "encrypt".to_owned(),
            });
        }

        let version = record.current_version;
        let material = self.open_material(&record, version).await?;
        let key = EncryptionKey::from_slice(&material)?;
        let aad = wire_aad(name, version, context);
        let wire = crypto::encrypt_aead(&key, plaintext, &aad)?;

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Encrypt, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("encrypt")
                    .details(serde_json::json!({"version": version})),
            )
            .await?;

        debug!(name, version, "transit encrypt");
        Ok(format!("vault:v{version}:{}", BASE64_URL.encode(&wire)))
    }

    /// Decrypt a `vault:v<N>:...` ciphertext.
    ///
    /// # Errors
    ///
    /// - [`TransitError::KeyVersionTooOld`] below `min_decryption_version`.
    /// - [`TransitError::InvalidPayload`] for malformed ciphertext strings.
    /// - [`TransitError::Crypto`] when authentication fails.
    pub async fn decrypt(
        &self,
        ctx: &RequestContext,
        name: &str,
        ciphertext: &str,
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, TransitError> {
        let record = self.load_key(name).await?;
        if record.algorithm != TransitAlgorithm::Aes256Gcm {
            return Err(TransitError::WrongAlgorithm {
                algorithm: record.algorithm.as_str().to_owned(),
                operation: "decrypt".to_owned(),
            });
        }

        let (version, wire) = parse_wire(ciphertext)?;
        if version < record.min_decryption_version {
            return Err(TransitError::KeyVersionTooOld {
                version,
                min: record.min_decryption_version,
            });
        }

        let material = self.open_material(&record, version).await?;
        let key = EncryptionKey::from_slice(&material)?;
        let aad = wire_aad(name, version, context);
        let plaintext = crypto::decrypt_aead(&key, &wire, &aad)?;

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Decrypt, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("decrypt")
                    .details(serde_json::json!({"version": version})),
            )
            .await?;

        Ok(plaintext)
    }

    /// Sign a digest with the key's current version.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes, plus [`TransitError::WrongAlgorithm`]
    /// for symmetric keys.
    pub async fn sign(
        &self,
        ctx: &RequestContext,
        name: &str,
        digest: &[u8],
    ) -> Result<String, TransitError> {
        let record = self.load_key(name).await?;
        if !record.algorithm.is_signing() {
            return Err(TransitError::WrongAlgorithm {
                algorithm: record.algorithm.as_str().to_owned(),
                operation: "sign".to_owned(),
            });
        }

        let version = record.current_version;
        let material = self.open_material(&record, version).await?;
        let signing_key = signing_key_from_material(&material)?;
        let signature = signing_key.sign(digest);

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Sign, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("sign")
                    .details(serde_json::json!({"version": version})),
            )
            .await?;

        Ok(format!(
            "vault:v{version}:{}",
            BASE64_URL.encode(signature.to_bytes())
        ))
    }

    /// Verify a signature produced by [`sign`](TransitEngine::sign).
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match;
    /// malformed input is an error.
    ///
    /// # Errors
    ///
    /// - [`TransitError::KeyVersionTooOld`] below `min_decryption_version`.
    /// - [`TransitError::InvalidPayload`] for malformed signature strings.
    pub async fn verify(
        &self,
        ctx: &RequestContext,
        name: &str,
        digest: &[u8],
        signature: &str,
    ) -> Result<bool, TransitError> {
        let record = self.load_key(name).await?;
        if !record.algorithm.is_signing() {
            return Err(TransitError::WrongAlgorithm {
                algorithm: record.algorithm.as_str().to_owned(),
                operation: "verify".to_owned(),
            });
        }

        let (version, sig_bytes) = parse_wire(signature)?;
        if version < record.min_decryption_version {
            return Err(TransitError::KeyVersionTooOld {
                version,
                min: record.min_decryption_version,
            });
        }

        let material = self.open_material(&record, version).await?;
        let signing_key = signing_key_from_material(&material)?;
        let parsed =
            Signature::from_slice(&sig_bytes).map_err(|e| TransitError::InvalidPayload {
                reason: format!("malformed signature: {e}"),
            })?;
        let valid = signing_key
            .verifying_key()
            .verify(digest, &parsed)
            .is_ok();

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Verify, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("verify")
                    .details(serde_json::json!({"version": version, "valid": valid})),
            )
            .await?;

        Ok(valid)
    }

    /// Update mutable key configuration.
    ///
    /// # Errors
    ///
    /// - [`TransitError::InvalidConfig`] if `min_decryption_version` is 0 or
    ///   above the current version.
    /// - Standard engine failure modes; rolled back if the audit fails.
    pub async fn update_key_config(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: UpdateKeyConfig,
    ) -> Result<(), TransitError> {
        let _guard = self.store.lock(&format!("transit:{name}")).await;
        let mut record = self.load_key(name).await?;
        let previous = record.clone();

        if let Some(min) = update.min_decryption_version {
            if min == 0 || min > record.current_version {
                return Err(TransitError::InvalidConfig {
                    reason: format!(
                        "min_decryption_version {min} must be within 1..={}",
                        record.current_version
                    ),
                });
            }
            record.min_decryption_version = min;
        }
        if let Some(deletion_allowed) = update.deletion_allowed {
            record.deletion_allowed = deletion_allowed;
        }
        self.save_key(&record).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Write, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("update-config")
                    .details(serde_json::json!({
                        "min_decryption_version": record.min_decryption_version,
                        "deletion_allowed": record.deletion_allowed,
                    })),
            )
            .await;
        if let Err(e) = audit_result {
            self.save_key(&previous).await?;
            return Err(e.into());
        }

        Ok(())
    }

    /// Delete a key. Succeeds only when the key allows deletion.
    ///
    /// # Errors
    ///
    /// - [`TransitError::DeletionForbidden`] unless `deletion_allowed`.
    /// - Standard engine failure modes; rolled back if the audit fails.
    pub async fn delete_key(&self, ctx: &RequestContext, name: &str) -> Result<(), TransitError> {
        let _guard = self.store.lock(&format!("transit:{name}")).await;
        let record = self.load_key(name).await?;
        if !record.deletion_allowed {
            return Err(TransitError::DeletionForbidden {
                name: name.to_owned(),
            });
        }

        self.store.delete(&key_storage_key(name)).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Destroy, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("delete-key"),
            )
            .await;
        if let Err(e) = audit_result {
            self.save_key(&record).await?;
            return Err(e.into());
        }

        info!(name, "transit key deleted");
        Ok(())
    }

    /// Export plaintext key material, one base64 entry per version.
    ///
    /// # Errors
    ///
    /// - [`TransitError::ExportForbidden`] unless the key was created
    ///   exportable.
    pub async fn export_key(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<HashMap<u32, String>, TransitError> {
        let record = self.load_key(name).await?;
        if !record.exportable {
            return Err(TransitError::ExportForbidden {
                name: name.to_owned(),
            });
        }

        let mut out = HashMap::with_capacity(record.versions.len());
        for &version in record.versions.keys() {
            let material = self.open_material(&record, version).await?;
            out.insert(version, BASE64.encode(&material));
        }

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Read, ctx, true)
                    .resource(format!("transit/keys/{name}"))
                    .action("export"),
            )
            .await?;

        Ok(out)
    }

    /// Public metadata about a key.
    ///
    /// # Errors
    ///
    /// - [`TransitError::NotFound`] if the key doesn't exist.
    pub async fn key_info(&self, name: &str) -> Result<TransitKeyInfo, TransitError> {
        let record = self.load_key(name).await?;
        Ok(TransitKeyInfo {
            name: record.name,
            algorithm: record.algorithm,
            current_version: record.current_version,
            min_decryption_version: record.min_decryption_version,
            exportable: record.exportable,
            deletion_allowed: record.deletion_allowed,
            version_count: u32::try_from(record.versions.len()).unwrap_or(u32::MAX),
            created_at: record.created_at,
        })
    }

    /// All key names.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::Store`] if listing fails.
    pub async fn list_keys(&self) -> Result<Vec<String>, TransitError> {
        let keys = self.store.list(KEY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(String::from))
            .collect())
    }

    // ── Internal helpers ─────────────────────────────────────────────

    async fn load_key(&self, name: &str) -> Result<TransitKeyRecord, TransitError> {
        validate_name(name)?;
        self.store
            .get_json(&key_storage_key(name))
            .await?
            .ok_or_else(|| TransitError::NotFound {
                name: name.to_owned(),
            })
    }

    async fn save_key(&self, record: &TransitKeyRecord) -> Result<(), TransitError> {
        Ok(self
            .store
            .put_json(&key_storage_key(&record.name), record)
            .await?)
    }

    async fn seal_material(
        &self,
        name: &str,
        version: u32,
        material: &[u8],
    ) -> Result<Vec<u8>, TransitError> {
        let key = self.hierarchy.derive(&format!("transit:{name}")).await?;
        let aad = material_aad(name, version);
        Ok(crypto::seal_field(&key, material, aad.as_bytes())?)
    }

    async fn open_material(
        &self,
        record: &TransitKeyRecord,
        version: u32,
    ) -> Result<Vec<u8>, TransitError> {
        let sealed = record
            .versions
            .get(&version)
            .ok_or(TransitError::InvalidPayload {
                reason: format!("key version {version} does not exist"),
            })?;
        let key = self
            .hierarchy
            .derive(&format!("transit:{}", record.name))
            .await?;
        let aad = material_aad(&record.name, version);
        Ok(crypto::open_field(&key, &sealed.material, aad.as_bytes())?)
    }
}

impl std::fmt::Debug for TransitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitEngine").finish_non_exhaustive()
    }
}

fn key_storage_key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

fn material_aad(name: &str, version: u32) -> String {
    format!("transit-material|{name}|{version}")
}

/// Associated data for wire operations:
/// `transit|<name>|<version>` plus the caller context when present.
fn wire_aad(name: &str, version: u32, context: Option<&[u8]>) -> Vec<u8> {
    let mut aad = format!("transit|{name}|{version}").into_bytes();
    if let Some(context) = context {
        aad.push(b'|');
        aad.extend_from_slice(context);
    }
    aad
}

/// Parse `vault:v<version>:<base64url>`.
fn parse_wire(input: &str) -> Result<(u32, Vec<u8>), TransitError> {
    let parts: Vec<&str> = input.splitn(3, ':').collect();
    let [scheme, version_part, payload] = parts.as_slice() else {
        return Err(TransitError::InvalidPayload {
            reason: "expected vault:v<N>:<base64url>".to_owned(),
        });
    };
    if *scheme != "vault" {
        return Err(TransitError::InvalidPayload {
            reason: format!("unknown scheme '{scheme}'"),
        });
    }
    let version_str = version_part
        .strip_prefix('v')
        .ok_or_else(|| TransitError::InvalidPayload {
            reason: "expected version prefix 'v'".to_owned(),
        })?;
    let version: u32 = version_str
        .parse()
        .map_err(|_| TransitError::InvalidPayload {
            reason: format!("invalid version number '{version_str}'"),
        })?;
    let raw = BASE64_URL
        .decode(payload)
        .map_err(|e| TransitError::InvalidPayload {
            reason: format!("invalid base64url payload: {e}"),
        })?;
    Ok((version, raw))
}

fn signing_key_from_material(material: &[u8]) -> Result<SigningKey, TransitError> {
    let seed: [u8; 32] = material
        .try_into()
        .map_err(|_| TransitError::Internal {
            reason: "signing key material is not 32 bytes".to_owned(),
        })?;
    Ok(SigningKey::from_bytes(&seed))
}

fn validate_name(name: &str) -> Result<(), TransitError> {
    if name.is_empty() || name.len() > 128 {
        return Err(TransitError::InvalidConfig {
            reason: "key name must be 1-128 characters".to_owned(),
        });
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(TransitError::InvalidConfig {
            reason: "key name may only contain alphanumerics, '_', '-', and '.'".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use usp_storage::MemoryBackend;

    use super::*;

    async fn make_engine() -> TransitEngine {
        let store = Arc::new(Store::new(Arc::new(MemoryBackend::new())));
        let hierarchy = Arc::new(KeyHierarchy::new());
        hierarchy.install(EncryptionKey::generate()).await;
        let audit = Arc::new(AuditSink::new(
            Arc::clone(&store),
            Arc::clone(&hierarchy),
            "audit",
        ));
        TransitEngine::new(store, hierarchy, audit)
    }

    fn ctx() -> RequestContext {
        RequestContext::new("user-1", vec!["engineering".to_owned()])
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();

        let ct = engine.encrypt(&ctx, "k", b"plain1", None).await.unwrap();
        assert!(ct.starts_with("vault:v1:"));
        let pt = engine.decrypt(&ctx, "k", &ct, None).await.unwrap();
        assert_eq!(pt, b"plain1");
    }

    #[tokio::test]
    async fn context_mismatch_fails_decryption() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();

        let ct = engine
            .encrypt(&ctx, "k", b"plain", Some(b"ctx-1"))
            .await
            .unwrap();
        assert_eq!(
            engine
                .decrypt(&ctx, "k", &ct, Some(b"ctx-1"))
                .await
                .unwrap(),
            b"plain"
        );
        let err = engine
            .decrypt(&ctx, "k", &ct, Some(b"ctx-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::Crypto(_)));
    }

    #[tokio::test]
    async fn create_refuses_existing_name() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        let err = engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn min_decryption_version_enforced() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();

        let c1 = engine.encrypt(&ctx, "k", b"plain1", None).await.unwrap();
        assert_eq!(engine.rotate_key(&ctx, "k").await.unwrap(), 2);
        let c2 = engine.encrypt(&ctx, "k", b"plain2", None).await.unwrap();
        assert!(c2.starts_with("vault:v2:"));

        engine
            .update_key_config(
                &ctx,
                "k",
                UpdateKeyConfig {
                    min_decryption_version: Some(2),
                    deletion_allowed: None,
                },
            )
            .await
            .unwrap();

        let err = engine.decrypt(&ctx, "k", &c1, None).await.unwrap_err();
        assert!(matches!(
            err,
            TransitError::KeyVersionTooOld { version: 1, min: 2 }
        ));
        assert_eq!(engine.decrypt(&ctx, "k", &c2, None).await.unwrap(), b"plain2");
    }

    #[tokio::test]
    async fn old_ciphertext_still_decrypts_after_rotation() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        let c1 = engine.encrypt(&ctx, "k", b"old", None).await.unwrap();
        engine.rotate_key(&ctx, "k").await.unwrap();
        assert_eq!(engine.decrypt(&ctx, "k", &c1, None).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn update_config_validates_min_version() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();

        let err = engine
            .update_key_config(
                &ctx,
                "k",
                UpdateKeyConfig {
                    min_decryption_version: Some(5),
                    deletion_allowed: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn sign_verify_roundtrip() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "sig", TransitAlgorithm::Ed25519, CreateKeyOptions::default())
            .await
            .unwrap();

        let digest = b"message digest bytes";
        let signature = engine.sign(&ctx, "sig", digest).await.unwrap();
        assert!(signature.starts_with("vault:v1:"));

        assert!(engine.verify(&ctx, "sig", digest, &signature).await.unwrap());
        assert!(
            !engine
                .verify(&ctx, "sig", b"different digest", &signature)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn sign_with_symmetric_key_is_wrong_algorithm() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        let err = engine.sign(&ctx, "k", b"digest").await.unwrap_err();
        assert!(matches!(err, TransitError::WrongAlgorithm { .. }));
    }

    #[tokio::test]
    async fn unsupported_algorithms_are_refused_at_creation() {
        let engine = make_engine().await;
        let ctx = ctx();
        for algorithm in [
            TransitAlgorithm::Rsa2048,
            TransitAlgorithm::Rsa4096,
            TransitAlgorithm::EcdsaP256,
        ] {
            let err = engine
                .create_key(&ctx, "k", algorithm, CreateKeyOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, TransitError::Unsupported { .. }));
        }
    }

    #[tokio::test]
    async fn delete_requires_deletion_allowed() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        let err = engine.delete_key(&ctx, "k").await.unwrap_err();
        assert!(matches!(err, TransitError::DeletionForbidden { .. }));

        engine
            .update_key_config(
                &ctx,
                "k",
                UpdateKeyConfig {
                    min_decryption_version: None,
                    deletion_allowed: Some(true),
                },
            )
            .await
            .unwrap();
        engine.delete_key(&ctx, "k").await.unwrap();
        assert!(matches!(
            engine.key_info("k").await,
            Err(TransitError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn export_respects_exportable_flag() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "locked", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        let err = engine.export_key(&ctx, "locked").await.unwrap_err();
        assert!(matches!(err, TransitError::ExportForbidden { .. }));

        engine
            .create_key(
                &ctx,
                "open",
                TransitAlgorithm::Aes256Gcm,
                CreateKeyOptions {
                    exportable: true,
                    deletion_allowed: false,
                },
            )
            .await
            .unwrap();
        engine.rotate_key(&ctx, "open").await.unwrap();
        let exported = engine.export_key(&ctx, "open").await.unwrap();
        assert_eq!(exported.len(), 2);
    }

    #[tokio::test]
    async fn malformed_ciphertext_is_invalid_payload() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();

        for bad in [
            "not-a-ciphertext",
            "vault:1:abcd",
            "vault:vX:abcd",
            "other:v1:abcd",
            "vault:v1:!!!",
        ] {
            let err = engine.decrypt(&ctx, "k", bad, None).await.unwrap_err();
            assert!(matches!(err, TransitError::InvalidPayload { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn sealed_engine_refuses_operations() {
        let store = Arc::new(Store::new(Arc::new(MemoryBackend::new())));
        let hierarchy = Arc::new(KeyHierarchy::new());
        let audit = Arc::new(AuditSink::new(
            Arc::clone(&store),
            Arc::clone(&hierarchy),
            "audit",
        ));
        let engine = TransitEngine::new(store, hierarchy, audit);

        let err = engine
            .create_key(&ctx(), "k", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::Hierarchy(_)));
    }

    #[tokio::test]
    async fn list_keys_returns_names() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .create_key(&ctx, "a", TransitAlgorithm::Aes256Gcm, CreateKeyOptions::default())
            .await
            .unwrap();
        engine
            .create_key(&ctx, "b", TransitAlgorithm::Ed25519, CreateKeyOptions::default())
            .await
            .unwrap();
        let names = engine.list_keys().await.unwrap();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }
}
