//! Error types for `usp-core`.
//!
//! Each component has its own error enum so callers can match on exactly the
//! failures that component can produce. Every variant carries enough context
//! to diagnose the problem without a debugger. Crypto errors never include
//! key material — only key identifiers or operation descriptions.

use usp_storage::StorageError;

/// Errors from cryptographic primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A key had the wrong length for the requested algorithm.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, wrong associated data,
    /// corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for purpose '{purpose}': {reason}")]
    KeyDerivation { purpose: String, reason: String },

    /// Ciphertext is too short to contain a version byte + nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// An encrypted blob carried an unknown format version byte.
    #[error("unsupported encrypted blob version {version}")]
    UnsupportedBlobVersion { version: u8 },
}

/// Errors from Shamir secret splitting and recombination.
#[derive(Debug, thiserror::Error)]
pub enum ShamirError {
    /// Invalid split parameters.
    #[error("invalid shamir config: {reason}")]
    InvalidConfig { reason: String },

    /// Fewer shares were provided than the recovery threshold.
    #[error("share count below threshold: need {needed}, got {got}")]
    ShareCountBelowThreshold { needed: u8, got: u8 },

    /// Two shares carried the same index.
    #[error("duplicate share index {index}")]
    DuplicateShareIndex { index: u8 },

    /// A share was malformed and could not be decoded.
    #[error("invalid share: {reason}")]
    InvalidShare { reason: String },

    /// Recombination produced a value that failed the self-check byte.
    #[error("shares are incoherent: recombined secret failed self-check")]
    IncoherentShares,
}

/// Errors from the key hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    /// The platform is sealed — no data master key is resident in memory.
    #[error("sealed")]
    Sealed,

    /// Subkey derivation failed.
    #[error("hierarchy crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage backend failed.
    #[error("store backend error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be encoded or decoded.
    #[error("record codec error at '{key}': {reason}")]
    Codec { key: String, reason: String },
}

/// Errors from seal/unseal operations.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The platform has already been initialized.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The platform has not been initialized yet.
    #[error("not initialized")]
    NotInitialized,

    /// The platform is already unsealed.
    #[error("already unsealed")]
    AlreadyUnsealed,

    /// The platform is already sealed.
    #[error("already sealed")]
    AlreadySealed,

    /// Invalid Shamir configuration parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted share was malformed or duplicated an earlier index.
    #[error("invalid unseal share: {0}")]
    InvalidShare(#[from] ShamirError),

    /// The collected shares did not recover a key able to decrypt the data
    /// master key. All collected shares have been discarded.
    #[error("key recovery failed: {reason}")]
    RecoveryFailed { reason: String },

    /// A cryptographic operation failed during seal/unseal.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed during seal/unseal.
    #[error("seal store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the seal-lifecycle audit record failed.
    #[error("seal audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The audit chain failed its integrity check. Fatal: all audited
    /// mutations are refused until an operator acknowledges the break.
    #[error("audit chain broken at seq {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },

    /// The key hierarchy refused a derivation (platform sealed).
    #[error("audit hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// The store failed while appending or replaying records.
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization of an audit record failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// A mirror backend failed to write.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token was not found in storage.
    #[error("token not found")]
    NotFound,

    /// The token has expired.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The store failed.
    #[error("token store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from policy CRUD.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {id}")]
    NotFound { id: String },

    /// The policy document is invalid for its declared type.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The policy body exceeds the configured size limit.
    #[error("policy body too large: {actual} bytes exceeds limit of {limit}")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Built-in policies cannot be modified or deleted.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// The store failed.
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the policy-change audit record failed.
    #[error("policy audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the KV v2 engine.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// No secret exists at the given path.
    #[error("secret not found at path '{path}'")]
    NotFound { path: String },

    /// The requested version does not exist for this secret.
    #[error("version {version} not found at path '{path}'")]
    VersionNotFound { path: String, version: u64 },

    /// Check-and-set mismatch: the caller's `cas` did not equal the current
    /// version.
    #[error("check-and-set mismatch: current version is {current}, caller provided {provided}")]
    CasMismatch { current: u64, provided: u64 },

    /// The secret requires check-and-set but no `cas` value was provided.
    #[error("check-and-set required for path '{path}'")]
    CasRequired { path: String },

    /// The requested version has been destroyed; its plaintext is gone.
    #[error("version {version} at path '{path}' has been destroyed")]
    Destroyed { path: String, version: u64 },

    /// The requested version is soft-deleted. Recoverable with the
    /// read-deleted capability or via undelete.
    #[error("version {version} at path '{path}' is deleted")]
    Deleted { path: String, version: u64 },

    /// Malformed path or payload.
    #[error("invalid kv request: {reason}")]
    Validation { reason: String },

    /// The secret value exceeds the configured size limit.
    #[error("secret value too large: {actual} bytes exceeds limit of {limit}")]
    ValueTooLarge { limit: usize, actual: usize },

    /// The key hierarchy refused a derivation (platform sealed).
    #[error("kv hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// An AEAD operation failed.
    #[error("kv crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error("kv store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the audit record failed; the mutation was rolled back.
    #[error("kv audit error: {0}")]
    Audit(#[from] AuditError),

    /// Internal invariant violation.
    #[error("kv internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from the transit engine.
#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    /// No key with the given name exists.
    #[error("transit key not found: {name}")]
    NotFound { name: String },

    /// A key with the given name already exists.
    #[error("transit key already exists: {name}")]
    AlreadyExists { name: String },

    /// The ciphertext was produced by a key version below the key's minimum
    /// decryption version.
    #[error("ciphertext version {version} is below minimum decryption version {min}")]
    KeyVersionTooOld { version: u32, min: u32 },

    /// The ciphertext or signature string could not be parsed.
    #[error("invalid transit payload: {reason}")]
    InvalidPayload { reason: String },

    /// Deletion was requested but the key does not allow it.
    #[error("deletion not allowed for key '{name}'")]
    DeletionForbidden { name: String },

    /// Export was requested but the key was not created exportable.
    #[error("key '{name}' is not exportable")]
    ExportForbidden { name: String },

    /// The algorithm is recognized but not supported by this build.
    #[error("unsupported transit algorithm: {algorithm}")]
    Unsupported { algorithm: String },

    /// Invalid key configuration update.
    #[error("invalid transit config: {reason}")]
    InvalidConfig { reason: String },

    /// The operation does not apply to this key's algorithm (e.g. sign with
    /// a symmetric key).
    #[error("operation not applicable to algorithm '{algorithm}': {operation}")]
    WrongAlgorithm {
        algorithm: String,
        operation: String,
    },

    /// The key hierarchy refused a derivation (platform sealed).
    #[error("transit hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// An AEAD or signature operation failed.
    #[error("transit crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error("transit store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the audit record failed; the mutation was rolled back.
    #[error("transit audit error: {0}")]
    Audit(#[from] AuditError),

    /// Internal invariant violation.
    #[error("transit internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from database connectors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Could not reach or authenticate to the target database. Safe to
    /// retry with backoff.
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    /// The target database rejected a statement. Not retried.
    #[error("statement failed: {reason}")]
    Statement { reason: String },

    /// No connector is bundled for this plugin.
    #[error("unsupported database plugin: {plugin}")]
    Unsupported { plugin: String },
}

/// Errors from the database secrets engine.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Database connection config not found (or soft-deleted).
    #[error("database config not found: {name}")]
    ConfigNotFound { name: String },

    /// Database role not found.
    #[error("database role not found: {config}/{role}")]
    RoleNotFound { config: String, role: String },

    /// Lease not found.
    #[error("lease not found: {lease_id}")]
    LeaseNotFound { lease_id: String },

    /// The lease has been revoked; renewal refused.
    #[error("lease already revoked: {lease_id}")]
    LeaseRevoked { lease_id: String },

    /// The lease has expired; renewal refused.
    #[error("lease expired: {lease_id}")]
    LeaseExpired { lease_id: String },

    /// Invalid configuration or request parameters.
    #[error("invalid database request: {reason}")]
    Validation { reason: String },

    /// The operation is declined by this profile (e.g. static rotation).
    #[error("unsupported database operation: {operation}")]
    Unsupported { operation: String },

    /// The underlying connector failed after retries.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// The key hierarchy refused a derivation (platform sealed).
    #[error("database hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// An AEAD operation failed.
    #[error("database crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error("database store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the audit record failed.
    #[error("database audit error: {0}")]
    Audit(#[from] AuditError),

    /// Internal invariant violation.
    #[error("database internal error: {reason}")]
    Internal { reason: String },
}
