//! Server configuration.
//!
//! Everything is loaded from `USP_*` environment variables at startup;
//! nothing is re-read at runtime. The bootstrap token is mandatory — the
//! seal plane refuses to run with anonymous seal control.

use std::net::SocketAddr;

use usp_core::authz::RiskThresholds;
use usp_core::lease::RetryPolicy;

/// Where auto-unseal shares come from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// No auto-unseal; operators submit shares via the API.
    None,
    /// Shares from `USP_UNSEAL_SHARES` (comma-separated base64).
    Env,
    /// Shares from a file, one base64 share per line.
    File(String),
    /// Hardware security module. Interface stub only in this build.
    Hsm,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// Persistent redb storage.
    Redb { path: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend selection.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// Bootstrap credential for the seal plane.
    pub bootstrap_token: String,
    /// Auto-unseal key source.
    pub key_source: KeySource,
    /// Default share count for `Init` when the request omits it.
    pub default_shares: u8,
    /// Default threshold for `Init` when the request omits it.
    pub default_threshold: u8,
    /// Default per-secret version retention.
    pub kv_max_versions: u32,
    /// HKDF label for the audit subkey.
    pub audit_key_label: String,
    /// Optional NDJSON audit mirror file.
    pub audit_file_path: Option<String>,
    /// Per-connector pool cap.
    pub db_pool_max: u32,
    /// Adaptive risk thresholds.
    pub risk: RiskThresholds,
    /// Lease revocation retry behavior.
    pub lease_retry: RetryPolicy,
    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `USP_BIND_ADDR` — bind address (default `127.0.0.1:8300`)
    /// - `USP_STORAGE` — `memory` or `redb` (default `memory`)
    /// - `USP_STORAGE_PATH` — path for persistent backends (default `./data`)
    /// - `USP_LOG_LEVEL` — log filter (default `info`)
    /// - `USP_BOOTSTRAP_TOKEN` — **required** seal-plane credential
    /// - `USP_KEY_SOURCE` — `none`, `env`, `file`, or `hsm` (default `none`)
    /// - `USP_UNSEAL_SHARES` / `USP_UNSEAL_SHARES_FILE` — auto-unseal input
    /// - `USP_SHARES` / `USP_THRESHOLD` — init defaults (5 / 3)
    /// - `USP_KV_MAX_VERSIONS` — retention default (10)
    /// - `USP_AUDIT_KEY_LABEL` — audit subkey label (default `audit`)
    /// - `USP_AUDIT_FILE` — NDJSON mirror path (optional)
    /// - `USP_DB_POOL_MAX` — per-connector pool cap (default 4)
    /// - `USP_RISK_MFA_THRESHOLD` / `USP_RISK_DENY_THRESHOLD` — 60 / 85
    /// - `USP_LEASE_REVOKE_MAX_ATTEMPTS` / `USP_LEASE_REVOKE_BACKOFF_MS` — 5 / 250
    /// - `USP_REQUEST_TIMEOUT_SECS` — request deadline (default 30)
    ///
    /// # Errors
    ///
    /// Fails when `USP_BOOTSTRAP_TOKEN` is missing or `USP_KEY_SOURCE=file`
    /// without `USP_UNSEAL_SHARES_FILE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_var("USP_BIND_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8300)));

        let storage_path = env_var("USP_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match env_var("USP_STORAGE").as_deref() {
            Some("redb") => StorageBackendType::Redb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let bootstrap_token = env_var("USP_BOOTSTRAP_TOKEN").ok_or_else(|| {
            anyhow::anyhow!("USP_BOOTSTRAP_TOKEN is required; anonymous seal control is refused")
        })?;

        let key_source = match env_var("USP_KEY_SOURCE").as_deref() {
            Some("env") => KeySource::Env,
            Some("file") => {
                let path = env_var("USP_UNSEAL_SHARES_FILE").ok_or_else(|| {
                    anyhow::anyhow!("USP_KEY_SOURCE=file requires USP_UNSEAL_SHARES_FILE")
                })?;
                KeySource::File(path)
            }
            Some("hsm") => KeySource::Hsm,
            _ => KeySource::None,
        };

        Ok(Self {
            bind_addr,
            storage_backend,
            log_level: env_var("USP_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            bootstrap_token,
            key_source,
            default_shares: parse_or("USP_SHARES", 5),
            default_threshold: parse_or("USP_THRESHOLD", 3),
            kv_max_versions: parse_or("USP_KV_MAX_VERSIONS", 10),
            audit_key_label: env_var("USP_AUDIT_KEY_LABEL").unwrap_or_else(|| "audit".to_owned()),
            audit_file_path: env_var("USP_AUDIT_FILE"),
            db_pool_max: parse_or("USP_DB_POOL_MAX", 4),
            risk: RiskThresholds {
                mfa_threshold: parse_or("USP_RISK_MFA_THRESHOLD", 60),
                deny_threshold: parse_or("USP_RISK_DENY_THRESHOLD", 85),
            },
            lease_retry: RetryPolicy {
                max_attempts: parse_or("USP_LEASE_REVOKE_MAX_ATTEMPTS", 5),
                backoff_ms: parse_or("USP_LEASE_REVOKE_BACKOFF_MS", 250),
            },
            request_timeout_secs: parse_or("USP_REQUEST_TIMEOUT_SECS", 30),
        })
    }

    /// Resolve auto-unseal shares per `key_source`.
    ///
    /// # Errors
    ///
    /// Fails for `hsm` (stub) and unreadable share files.
    pub fn auto_unseal_shares(&self) -> anyhow::Result<Option<Vec<String>>> {
        match &self.key_source {
            KeySource::None => Ok(None),
            KeySource::Env => {
                let raw = env_var("USP_UNSEAL_SHARES").ok_or_else(|| {
                    anyhow::anyhow!("USP_KEY_SOURCE=env requires USP_UNSEAL_SHARES")
                })?;
                Ok(Some(
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                ))
            }
            KeySource::File(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(Some(
                    contents
                        .lines()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                ))
            }
            KeySource::Hsm => Err(anyhow::anyhow!(
                "hsm key source is a stub interface in this build"
            )),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}
