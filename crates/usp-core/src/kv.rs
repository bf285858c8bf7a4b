//! Versioned key-value secrets engine (KV v2).
//!
//! Secrets live at slash-hierarchical paths. Every write appends a dense,
//! monotonically increasing version; versions are immutable after write
//! except for the soft-delete and destroy flags. Reads decrypt the latest
//! non-destroyed version unless a specific version is requested.
//!
//! Writes honor check-and-set: when `cas_required` is set on the secret the
//! caller must present the current version number, and a first write must
//! present `cas = 0` when it presents one at all. Retention destroys the
//! oldest non-destroyed versions once the live count exceeds `max_versions`.
//!
//! Every version's plaintext is sealed with the `"secret"` subkey and the
//! associated data `kv|v2|<path>|<version>`, so a blob cannot be replayed
//! across paths or versions. Mutations append an audit record before the
//! response; if the audit append fails the mutation is rolled back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::context::RequestContext;
use crate::error::KvError;
use crate::hierarchy::KeyHierarchy;
use crate::store::Store;
use crate::{crypto, crypto::EncryptionKey};

/// HKDF purpose label for KV payloads.
const KV_KEY_PURPOSE: &str = "secret";

/// Storage prefix for secret metadata.
const META_PREFIX: &str = "kv/meta/";

/// Storage prefix for version records.
const VERSION_PREFIX: &str = "kv/versions/";

/// Default cap on serialized secret size.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 64 * 1024;

/// Default number of retained versions per secret.
pub const DEFAULT_MAX_VERSIONS: u32 = 10;

/// Maximum path length.
const MAX_PATH_LEN: usize = 512;

/// Secret-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSecretMetadata {
    /// Opaque secret id.
    pub id: String,
    /// Slash-hierarchical path, unique per secret.
    pub path: String,
    /// Latest version number.
    pub current_version: u64,
    /// Retention window for live versions.
    pub max_versions: u32,
    /// Whether writes must present a matching `cas`.
    pub cas_required: bool,
    /// When the secret was first written.
    pub created_at: DateTime<Utc>,
    /// When the secret was last written.
    pub updated_at: DateTime<Utc>,
    /// Whether the current version is soft-deleted.
    pub deleted: bool,
}

/// One stored version. `ciphertext` is a sealed blob; it is emptied when the
/// version is destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvVersionRecord {
    version: u64,
    ciphertext: Vec<u8>,
    created_at: DateTime<Utc>,
    soft_deleted_at: Option<DateTime<Utc>>,
    destroyed: bool,
}

/// Per-version state reported by the metadata endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct KvVersionInfo {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub destroyed: bool,
}

/// A write request.
#[derive(Debug, Clone, Default)]
pub struct KvWriteRequest {
    /// Secret payload.
    pub data: serde_json::Map<String, Value>,
    /// Check-and-set version; must equal the current version when present.
    pub cas: Option<u64>,
    /// Flip the secret's `cas_required` flag.
    pub cas_required: Option<bool>,
    /// Override the secret's retention window.
    pub max_versions: Option<u32>,
}

/// Result of a write.
#[derive(Debug, Clone, Serialize)]
pub struct KvWriteResponse {
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Result of a read.
#[derive(Debug, Clone, Serialize)]
pub struct KvReadResponse {
    pub data: serde_json::Map<String, Value>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub soft_deleted: bool,
}

/// The KV v2 engine.
pub struct KvEngine {
    store: Arc<Store>,
    hierarchy: Arc<KeyHierarchy>,
    audit: Arc<AuditSink>,
    default_max_versions: u32,
    max_value_bytes: usize,
}

impl KvEngine {
    /// Create a new engine with default limits.
    #[must_use]
    pub fn new(store: Arc<Store>, hierarchy: Arc<KeyHierarchy>, audit: Arc<AuditSink>) -> Self {
        Self {
            store,
            hierarchy,
            audit,
            default_max_versions: DEFAULT_MAX_VERSIONS,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }

    /// Override the default retention window.
    #[must_use]
    pub fn with_default_max_versions(mut self, max_versions: u32) -> Self {
        self.default_max_versions = max_versions.max(1);
        self
    }

    /// Write a new version of the secret at `path`.
    ///
    /// # Errors
    ///
    /// - [`KvError::CasRequired`] / [`KvError::CasMismatch`] on CAS failure.
    /// - [`KvError::ValueTooLarge`] / [`KvError::Validation`] on bad input.
    /// - [`KvError::Hierarchy`] while sealed.
    /// - [`KvError::Audit`] if the audit append fails (write rolled back).
    pub async fn write(
        &self,
        ctx: &RequestContext,
        path: &str,
        req: KvWriteRequest,
    ) -> Result<KvWriteResponse, KvError> {
        validate_path(path)?;
        let plaintext = serde_json::to_vec(&req.data).map_err(|e| KvError::Internal {
            reason: format!("payload serialization failed: {e}"),
        })?;
        if plaintext.len() > self.max_value_bytes {
            return Err(KvError::ValueTooLarge {
                limit: self.max_value_bytes,
                actual: plaintext.len(),
            });
        }
        let key = self.subkey().await?;

        let _guard = self.store.lock(&format!("kv:{path}")).await;

        let meta_key = meta_key(path);
        let previous: Option<KvSecretMetadata> = self.store.get_json(&meta_key).await?;
        let current = previous.as_ref().map_or(0, |m| m.current_version);
        let cas_required = req
            .cas_required
            .or(previous.as_ref().map(|m| m.cas_required))
            .unwrap_or(false);

        if cas_required && req.cas.is_none() {
            return Err(KvError::CasRequired {
                path: path.to_owned(),
            });
        }
        if let Some(cas) = req.cas {
            if cas != current {
                return Err(KvError::CasMismatch {
                    current,
                    provided: cas,
                });
            }
        }

        let now = Utc::now();
        let new_version = current.saturating_add(1);
        let aad = version_aad(path, new_version);
        let ciphertext = crypto::seal_field(&key, &plaintext, aad.as_bytes())?;

        let meta = KvSecretMetadata {
            id: previous
                .as_ref()
                .map_or_else(|| uuid::Uuid::new_v4().to_string(), |m| m.id.clone()),
            path: path.to_owned(),
            current_version: new_version,
            max_versions: req
                .max_versions
                .or(previous.as_ref().map(|m| m.max_versions))
                .unwrap_or(self.default_max_versions)
                .max(1),
            cas_required,
            created_at: previous.as_ref().map_or(now, |m| m.created_at),
            updated_at: now,
            deleted: false,
        };
        let record = KvVersionRecord {
            version: new_version,
            ciphertext,
            created_at: now,
            soft_deleted_at: None,
            destroyed: false,
        };

        self.store
            .put_json(&version_key(path, new_version), &record)
            .await?;
        self.store.put_json(&meta_key, &meta).await?;

        // Work out which versions retention will destroy so the audit entry
        // can carry them; the destruction itself happens only after the
        // audit record is durable.
        let pruned = self.retention_candidates(path, meta.max_versions).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Write, ctx, true)
                    .resource(format!("kv/data/{path}"))
                    .action("write")
                    .details(serde_json::json!({
                        "version": new_version,
                        "cas": req.cas,
                        "pruned_versions": &pruned,
                    })),
            )
            .await;
        if let Err(e) = audit_result {
            // Roll back so no unaudited write survives.
            self.store.delete(&version_key(path, new_version)).await?;
            match previous {
                Some(prev) => self.store.put_json(&meta_key, &prev).await?,
                None => self.store.delete(&meta_key).await?,
            }
            return Err(e.into());
        }

        for version in pruned {
            self.destroy_version_record(path, version).await?;
        }

        debug!(path, version = new_version, "kv secret written");
        Ok(KvWriteResponse {
            version: new_version,
            created_at: now,
        })
    }

    /// Read a secret, defaulting to the latest non-destroyed version.
    ///
    /// `include_deleted` allows reading soft-deleted versions (the
    /// `read-deleted` capability at the edge).
    ///
    /// # Errors
    ///
    /// - [`KvError::NotFound`] / [`KvError::VersionNotFound`] when absent.
    /// - [`KvError::Destroyed`] / [`KvError::Deleted`] per version state.
    /// - [`KvError::Hierarchy`] while sealed.
    pub async fn read(
        &self,
        ctx: &RequestContext,
        path: &str,
        version: Option<u64>,
        include_deleted: bool,
    ) -> Result<KvReadResponse, KvError> {
        validate_path(path)?;
        let key = self.subkey().await?;

        let meta: KvSecretMetadata =
            self.store
                .get_json(&meta_key(path))
                .await?
                .ok_or_else(|| KvError::NotFound {
                    path: path.to_owned(),
                })?;

        let record = match version {
            Some(v) => self
                .store
                .get_json::<KvVersionRecord>(&version_key(path, v))
                .await?
                .ok_or(KvError::VersionNotFound {
                    path: path.to_owned(),
                    version: v,
                })?,
            None => self
                .latest_live_version(path)
                .await?
                .ok_or(KvError::Destroyed {
                    path: path.to_owned(),
                    version: meta.current_version,
                })?,
        };

        if record.destroyed {
            return Err(KvError::Destroyed {
                path: path.to_owned(),
                version: record.version,
            });
        }
        if record.soft_deleted_at.is_some() && !include_deleted {
            return Err(KvError::Deleted {
                path: path.to_owned(),
                version: record.version,
            });
        }

        let aad = version_aad(path, record.version);
        let plaintext = crypto::open_field(&key, &record.ciphertext, aad.as_bytes())?;
        let data: serde_json::Map<String, Value> =
            serde_json::from_slice(&plaintext).map_err(|e| KvError::Internal {
                reason: format!("payload deserialization failed: {e}"),
            })?;

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Read, ctx, true)
                    .resource(format!("kv/data/{path}"))
                    .action("read")
                    .details(serde_json::json!({"version": record.version})),
            )
            .await?;

        Ok(KvReadResponse {
            data,
            version: record.version,
            created_at: record.created_at,
            soft_deleted: record.soft_deleted_at.is_some(),
        })
    }

    /// Soft-delete versions (default: the current version).
    ///
    /// # Errors
    ///
    /// Standard engine failure modes; rolled back if the audit append fails.
    pub async fn soft_delete(
        &self,
        ctx: &RequestContext,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        self.flip_deletion(ctx, path, versions, true).await
    }

    /// Clear the soft-delete marker on versions (default: the current one).
    ///
    /// # Errors
    ///
    /// Standard engine failure modes; rolled back if the audit append fails.
    pub async fn undelete(
        &self,
        ctx: &RequestContext,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        self.flip_deletion(ctx, path, versions, false).await
    }

    /// Permanently destroy versions. Irreversible: the ciphertext is
    /// dropped, so the plaintext is unrecoverable even with the subkey.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes; rolled back if the audit append fails.
    pub async fn destroy(
        &self,
        ctx: &RequestContext,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        validate_path(path)?;
        let _guard = self.store.lock(&format!("kv:{path}")).await;

        let meta: KvSecretMetadata =
            self.store
                .get_json(&meta_key(path))
                .await?
                .ok_or_else(|| KvError::NotFound {
                    path: path.to_owned(),
                })?;
        let targets = if versions.is_empty() {
            vec![meta.current_version]
        } else {
            versions.to_vec()
        };

        // Snapshot for rollback if the audit append fails.
        let mut snapshots = Vec::new();
        for &version in &targets {
            if let Some(record) = self
                .store
                .get_json::<KvVersionRecord>(&version_key(path, version))
                .await?
            {
                snapshots.push(record);
            }
        }

        for record in &snapshots {
            self.destroy_version_record(path, record.version).await?;
        }

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Destroy, ctx, true)
                    .resource(format!("kv/data/{path}"))
                    .action("destroy")
                    .details(serde_json::json!({"versions": targets})),
            )
            .await;
        if let Err(e) = audit_result {
            for record in snapshots {
                self.store
                    .put_json(&version_key(path, record.version), &record)
                    .await?;
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Remove the secret entity and every version.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes; rolled back if the audit append fails.
    pub async fn destroy_metadata(&self, ctx: &RequestContext, path: &str) -> Result<(), KvError> {
        validate_path(path)?;
        let _guard = self.store.lock(&format!("kv:{path}")).await;

        let meta_key = meta_key(path);
        let meta: KvSecretMetadata =
            self.store
                .get_json(&meta_key)
                .await?
                .ok_or_else(|| KvError::NotFound {
                    path: path.to_owned(),
                })?;

        let version_keys = self.store.list(&version_prefix(path)).await?;
        let mut snapshots = Vec::new();
        for key in &version_keys {
            if let Some(record) = self.store.get_json::<KvVersionRecord>(key).await? {
                snapshots.push((key.clone(), record));
            }
            self.store.delete(key).await?;
        }
        self.store.delete(&meta_key).await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Destroy, ctx, true)
                    .resource(format!("kv/metadata/{path}"))
                    .action("destroy-metadata")
                    .details(serde_json::json!({"versions_removed": snapshots.len()})),
            )
            .await;
        if let Err(e) = audit_result {
            self.store.put_json(&meta_key, &meta).await?;
            for (key, record) in snapshots {
                self.store.put_json(&key, &record).await?;
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Secret metadata plus the per-version state map.
    ///
    /// # Errors
    ///
    /// - [`KvError::NotFound`] when the secret doesn't exist.
    pub async fn metadata(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<(KvSecretMetadata, Vec<KvVersionInfo>), KvError> {
        validate_path(path)?;
        let meta: KvSecretMetadata =
            self.store
                .get_json(&meta_key(path))
                .await?
                .ok_or_else(|| KvError::NotFound {
                    path: path.to_owned(),
                })?;

        let keys = self.store.list(&version_prefix(path)).await?;
        let mut versions = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(record) = self.store.get_json::<KvVersionRecord>(key).await? {
                versions.push(KvVersionInfo {
                    version: record.version,
                    created_at: record.created_at,
                    soft_deleted_at: record.soft_deleted_at,
                    destroyed: record.destroyed,
                });
            }
        }

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Read, ctx, true)
                    .resource(format!("kv/metadata/{path}"))
                    .action("read-metadata"),
            )
            .await?;

        Ok((meta, versions))
    }

    /// List the immediate children under a path prefix, directory-style:
    /// leaf names as-is, subtrees with a trailing `/`.
    ///
    /// # Errors
    ///
    /// Standard engine failure modes.
    pub async fn list(&self, ctx: &RequestContext, prefix: &str) -> Result<Vec<String>, KvError> {
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let storage_prefix = if prefix.is_empty() {
            META_PREFIX.to_owned()
        } else {
            format!("{META_PREFIX}{prefix}/")
        };

        let keys = self.store.list(&storage_prefix).await?;
        let mut children: Vec<String> = Vec::new();
        for key in &keys {
            let Some(rest) = key.strip_prefix(&storage_prefix) else {
                continue;
            };
            let child = match rest.split_once('/') {
                Some((first, _)) => format!("{first}/"),
                None => rest.to_owned(),
            };
            if !children.contains(&child) {
                children.push(child);
            }
        }
        children.sort();

        self.audit
            .append(
                AuditEvent::new(AuditEventType::Read, ctx, true)
                    .resource(format!("kv/metadata/{prefix}"))
                    .action("list"),
            )
            .await?;

        Ok(children)
    }

    // ── Internal helpers ─────────────────────────────────────────────

    async fn subkey(&self) -> Result<EncryptionKey, KvError> {
        Ok(self.hierarchy.derive(KV_KEY_PURPOSE).await?)
    }

    async fn flip_deletion(
        &self,
        ctx: &RequestContext,
        path: &str,
        versions: &[u64],
        delete: bool,
    ) -> Result<(), KvError> {
        validate_path(path)?;
        let _guard = self.store.lock(&format!("kv:{path}")).await;

        let meta_key = meta_key(path);
        let mut meta: KvSecretMetadata =
            self.store
                .get_json(&meta_key)
                .await?
                .ok_or_else(|| KvError::NotFound {
                    path: path.to_owned(),
                })?;
        let targets = if versions.is_empty() {
            vec![meta.current_version]
        } else {
            versions.to_vec()
        };

        let now = Utc::now();
        let mut snapshots = Vec::new();
        for &version in &targets {
            let key = version_key(path, version);
            let Some(mut record) = self.store.get_json::<KvVersionRecord>(&key).await? else {
                continue;
            };
            if record.destroyed {
                continue;
            }
            snapshots.push((key.clone(), record.clone()));
            record.soft_deleted_at = if delete { Some(now) } else { None };
            self.store.put_json(&key, &record).await?;
        }

        let prev_meta = meta.clone();
        if targets.contains(&meta.current_version) {
            meta.deleted = delete;
            self.store.put_json(&meta_key, &meta).await?;
        }

        let (event_type, action) = if delete {
            (AuditEventType::Delete, "soft-delete")
        } else {
            (AuditEventType::Write, "undelete")
        };
        let audit_result = self
            .audit
            .append(
                AuditEvent::new(event_type, ctx, true)
                    .resource(format!("kv/data/{path}"))
                    .action(action)
                    .details(serde_json::json!({"versions": targets})),
            )
            .await;
        if let Err(e) = audit_result {
            for (key, record) in snapshots {
                self.store.put_json(&key, &record).await?;
            }
            self.store.put_json(&meta_key, &prev_meta).await?;
            return Err(e.into());
        }

        Ok(())
    }

    /// The newest version record that is not destroyed.
    async fn latest_live_version(&self, path: &str) -> Result<Option<KvVersionRecord>, KvError> {
        let keys = self.store.list(&version_prefix(path)).await?;
        for key in keys.iter().rev() {
            if let Some(record) = self.store.get_json::<KvVersionRecord>(key).await? {
                if !record.destroyed {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Versions the retention policy will destroy: the oldest non-destroyed
    /// versions beyond the retention window.
    async fn retention_candidates(
        &self,
        path: &str,
        max_versions: u32,
    ) -> Result<Vec<u64>, KvError> {
        let keys = self.store.list(&version_prefix(path)).await?;
        let mut live = Vec::new();
        for key in &keys {
            if let Some(record) = self.store.get_json::<KvVersionRecord>(key).await? {
                if !record.destroyed {
                    live.push(record.version);
                }
            }
        }
        live.sort_unstable();
        let excess = live.len().saturating_sub(max_versions as usize);
        Ok(live.into_iter().take(excess).collect())
    }

    async fn destroy_version_record(&self, path: &str, version: u64) -> Result<(), KvError> {
        let key = version_key(path, version);
        if let Some(mut record) = self.store.get_json::<KvVersionRecord>(&key).await? {
            record.destroyed = true;
            record.ciphertext.clear();
            self.store.put_json(&key, &record).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEngine")
            .field("default_max_versions", &self.default_max_versions)
            .finish_non_exhaustive()
    }
}

fn meta_key(path: &str) -> String {
    format!("{META_PREFIX}{path}")
}

fn version_prefix(path: &str) -> String {
    format!("{VERSION_PREFIX}{path}/")
}

fn version_key(path: &str, version: u64) -> String {
    format!("{VERSION_PREFIX}{path}/{version:010}")
}

fn version_aad(path: &str, version: u64) -> String {
    format!("kv|v2|{path}|{version}")
}

/// Path rules: non-empty, ≤ 512 chars, safe charset, no traversal, no
/// leading/trailing/double slashes.
fn validate_path(path: &str) -> Result<(), KvError> {
    if path.is_empty() {
        return Err(KvError::Validation {
            reason: "path must not be empty".to_owned(),
        });
    }
    if path.len() > MAX_PATH_LEN {
        return Err(KvError::Validation {
            reason: format!("path exceeds {MAX_PATH_LEN} characters"),
        });
    }
    if path.contains("..") {
        return Err(KvError::Validation {
            reason: "path traversal is not allowed".to_owned(),
        });
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(KvError::Validation {
            reason: "path segments must be non-empty".to_owned(),
        });
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'/' || b == b'.')
    {
        return Err(KvError::Validation {
            reason: "path may only contain alphanumerics, '_', '-', '.', and '/'".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use usp_storage::MemoryBackend;

    use super::*;

    async fn make_engine() -> KvEngine {
        let store = Arc::new(Store::new(Arc::new(MemoryBackend::new())));
        let hierarchy = Arc::new(KeyHierarchy::new());
        hierarchy.install(EncryptionKey::generate()).await;
        let audit = Arc::new(AuditSink::new(
            Arc::clone(&store),
            Arc::clone(&hierarchy),
            "audit",
        ));
        KvEngine::new(store, hierarchy, audit)
    }

    fn ctx() -> RequestContext {
        RequestContext::new("user-1", vec!["engineering".to_owned()])
    }

    fn payload(key: &str, value: &str) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert(key.to_owned(), Value::String(value.to_owned()));
        map
    }

    fn write_req(data: serde_json::Map<String, Value>, cas: Option<u64>) -> KvWriteRequest {
        KvWriteRequest {
            data,
            cas,
            ..KvWriteRequest::default()
        }
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let engine = make_engine().await;
        let ctx = ctx();

        let resp = engine
            .write(&ctx, "app/db", write_req(payload("p", "old"), Some(0)))
            .await
            .unwrap();
        assert_eq!(resp.version, 1);

        let read = engine.read(&ctx, "app/db", None, false).await.unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.data["p"], Value::String("old".to_owned()));
    }

    #[tokio::test]
    async fn versions_are_dense_and_monotonic() {
        let engine = make_engine().await;
        let ctx = ctx();
        for i in 1..=4u64 {
            let resp = engine
                .write(&ctx, "app/db", write_req(payload("v", &i.to_string()), None))
                .await
                .unwrap();
            assert_eq!(resp.version, i);
        }
    }

    #[tokio::test]
    async fn cas_mismatch_is_rejected() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .write(&ctx, "app/db", write_req(payload("p", "old"), Some(0)))
            .await
            .unwrap();

        let err = engine
            .write(&ctx, "app/db", write_req(payload("p", "new"), Some(0)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KvError::CasMismatch {
                current: 1,
                provided: 0
            }
        ));
    }

    #[tokio::test]
    async fn cas_required_flag_enforces_cas() {
        let engine = make_engine().await;
        let ctx = ctx();
        let req = KvWriteRequest {
            data: payload("p", "v1"),
            cas: Some(0),
            cas_required: Some(true),
            max_versions: None,
        };
        engine.write(&ctx, "app/db", req).await.unwrap();

        let err = engine
            .write(&ctx, "app/db", write_req(payload("p", "v2"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::CasRequired { .. }));

        engine
            .write(&ctx, "app/db", write_req(payload("p", "v2"), Some(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_cas_writes_allow_exactly_one_winner() {
        let engine = Arc::new(make_engine().await);
        engine
            .write(&ctx(), "app/db", write_req(payload("p", "base"), Some(0)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..2 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .write(
                        &ctx(),
                        "app/db",
                        write_req(payload("p", &format!("contender-{i}")), Some(1)),
                    )
                    .await
            }));
        }

        let mut successes = 0;
        let mut mismatches = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(resp) => {
                    assert_eq!(resp.version, 2);
                    successes += 1;
                }
                Err(e) => {
                    assert!(matches!(e, KvError::CasMismatch { .. }));
                    mismatches += 1;
                }
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(mismatches, 1);
    }

    #[tokio::test]
    async fn destroyed_version_is_unreadable() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .write(&ctx, "app/db", write_req(payload("p", "v1"), None))
            .await
            .unwrap();
        engine
            .write(&ctx, "app/db", write_req(payload("p", "v2"), None))
            .await
            .unwrap();

        engine.destroy(&ctx, "app/db", &[1]).await.unwrap();

        let err = engine.read(&ctx, "app/db", Some(1), false).await.unwrap_err();
        assert!(matches!(err, KvError::Destroyed { version: 1, .. }));

        // Latest read still serves the surviving version.
        let read = engine.read(&ctx, "app/db", None, false).await.unwrap();
        assert_eq!(read.version, 2);
    }

    #[tokio::test]
    async fn soft_delete_then_undelete_is_identity() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .write(&ctx, "app/db", write_req(payload("p", "v1"), None))
            .await
            .unwrap();

        engine.soft_delete(&ctx, "app/db", &[]).await.unwrap();
        let err = engine.read(&ctx, "app/db", None, false).await.unwrap_err();
        assert!(matches!(err, KvError::Deleted { .. }));

        // Readable with the read-deleted capability.
        let read = engine.read(&ctx, "app/db", None, true).await.unwrap();
        assert!(read.soft_deleted);

        engine.undelete(&ctx, "app/db", &[]).await.unwrap();
        let read = engine.read(&ctx, "app/db", None, false).await.unwrap();
        assert_eq!(read.data["p"], Value::String("v1".to_owned()));
        assert!(!read.soft_deleted);
    }

    #[tokio::test]
    async fn retention_destroys_oldest_versions() {
        let engine = make_engine().await;
        let ctx = ctx();
        let req = KvWriteRequest {
            data: payload("p", "v1"),
            cas: None,
            cas_required: None,
            max_versions: Some(3),
        };
        engine.write(&ctx, "app/db", req).await.unwrap();
        for i in 2..=5u64 {
            engine
                .write(&ctx, "app/db", write_req(payload("p", &format!("v{i}")), None))
                .await
                .unwrap();
        }

        // Versions 1 and 2 fell out of the window.
        for v in [1u64, 2] {
            let err = engine.read(&ctx, "app/db", Some(v), false).await.unwrap_err();
            assert!(matches!(err, KvError::Destroyed { .. }), "version {v}");
        }
        for v in [3u64, 4, 5] {
            engine.read(&ctx, "app/db", Some(v), false).await.unwrap();
        }

        let (_, versions) = engine.metadata(&ctx, "app/db").await.unwrap();
        let live = versions.iter().filter(|v| !v.destroyed).count();
        assert_eq!(live, 3);
    }

    #[tokio::test]
    async fn destroy_metadata_removes_everything() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .write(&ctx, "app/db", write_req(payload("p", "v1"), None))
            .await
            .unwrap();
        engine.destroy_metadata(&ctx, "app/db").await.unwrap();

        let err = engine.read(&ctx, "app/db", None, false).await.unwrap_err();
        assert!(matches!(err, KvError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_returns_immediate_children() {
        let engine = make_engine().await;
        let ctx = ctx();
        for path in ["app/db", "app/cache", "app/svc/token", "other/x"] {
            engine
                .write(&ctx, path, write_req(payload("k", "v"), None))
                .await
                .unwrap();
        }

        let children = engine.list(&ctx, "app").await.unwrap();
        assert_eq!(
            children,
            vec!["cache".to_owned(), "db".to_owned(), "svc/".to_owned()]
        );
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
        let engine = KvEngine::new(store, hierarchy, audit);

        let err = engine
            .write(&ctx(), "app/db", write_req(payload("p", "v"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Hierarchy(_)));
    }

    #[tokio::test]
    async fn oversized_value_is_rejected() {
        let engine = make_engine().await;
        let big = "x".repeat(DEFAULT_MAX_VALUE_BYTES + 1);
        let err = engine
            .write(&ctx(), "app/db", write_req(payload("p", &big), None))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::ValueTooLarge { .. }));
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let engine = make_engine().await;
        for path in ["", "a//b", "/lead", "trail/", "a/../b", "spa ce"] {
            let err = engine
                .write(&ctx(), path, write_req(payload("p", "v"), None))
                .await
                .unwrap_err();
            assert!(matches!(err, KvError::Validation { .. }), "path {path:?}");
        }
    }

    #[tokio::test]
    async fn ciphertext_is_bound_to_path_and_version() {
        let engine = make_engine().await;
        let ctx = ctx();
        engine
            .write(&ctx, "app/a", write_req(payload("p", "secret-a"), None))
            .await
            .unwrap();

        // Splice version 1 of app/a into app/b; the AAD mismatch must
        // surface as a crypto failure, not someone else's plaintext.
        let record = engine
            .store
            .get_raw(&version_key("app/a", 1))
            .await
            .unwrap()
            .unwrap();
        engine
            .write(&ctx, "app/b", write_req(payload("p", "secret-b"), None))
            .await
            .unwrap();
        engine
            .store
            .put_raw(&version_key("app/b", 1), &record)
            .await
            .unwrap();

        let err = engine.read(&ctx, "app/b", Some(1), false).await.unwrap_err();
        assert!(matches!(err, KvError::Crypto(_)));
    }
}
