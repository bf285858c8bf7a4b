//! Database connectors for the dynamic-credentials engine.
//!
//! A [`Connector`] turns rendered statement lists into effects on a target
//! database: creating an ephemeral user, revoking one, or rotating the root
//! credential. Statements arrive fully rendered — the engine has already
//! substituted `{{name}}`, `{{password}}`, and `{{expiration}}` — so
//! connectors only execute.
//!
//! Bundled connectors: PostgreSQL (`tokio-postgres`), MySQL (`mysql_async`),
//! Redis ACL (`redis`), and an in-memory connector for tests. `mssql` and
//! `mongo` are accepted plugin names whose construction reports
//! [`ConnectorError::Unsupported`].
//!
//! Error classification drives retry behavior upstream: connection failures
//! are retriable, statement failures are not.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ConnectorError;

/// A database plugin capable of managing ephemeral users.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// The plugin name this connector implements.
    fn plugin(&self) -> &str;

    /// Open a transient connection to prove the config works.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Connection`] when the target is
    /// unreachable or rejects authentication.
    async fn verify_connection(&self) -> Result<(), ConnectorError>;

    /// Create a dynamic user by executing the rendered creation statements.
    ///
    /// # Errors
    ///
    /// Connection or statement failure.
    async fn create_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError>;

    /// Revoke a dynamic user by executing the rendered revocation
    /// statements.
    ///
    /// # Errors
    ///
    /// Connection or statement failure.
    async fn revoke_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError>;

    /// Rotate the root credential by executing the rendered rotation
    /// statements.
    ///
    /// # Errors
    ///
    /// Connection or statement failure.
    async fn rotate_root(&self, statements: &[String]) -> Result<(), ConnectorError>;

    /// Generate a credential password: 32 hex chars of CSPRNG randomness.
    fn generate_password(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Construct the connector for a plugin name.
///
/// # Errors
///
/// Returns [`ConnectorError::Unsupported`] for plugins without a bundled
/// driver (`mssql`, `mongo`) and unknown plugin names.
pub fn build_connector(plugin: &str, url: &str) -> Result<Arc<dyn Connector>, ConnectorError> {
    match plugin {
        "postgres" | "postgresql" => Ok(Arc::new(PostgresConnector::new(url))),
        "mysql" => Ok(Arc::new(MySqlConnector::new(url))),
        "redis" => Ok(Arc::new(RedisConnector::new(url))),
        "memory" => Ok(Arc::new(MemoryConnector::new())),
        other => Err(ConnectorError::Unsupported {
            plugin: other.to_owned(),
        }),
    }
}

/// Plugin names the engine accepts in a database config. A name may be
/// accepted here and still lack a bundled driver.
#[must_use]
pub fn is_known_plugin(plugin: &str) -> bool {
    matches!(
        plugin,
        "postgres" | "postgresql" | "mysql" | "mssql" | "mongo" | "redis" | "memory"
    )
}

// ── PostgreSQL ───────────────────────────────────────────────────────

/// Connector for PostgreSQL. Opens a transient connection per operation.
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    /// Create a connector for the given connection URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn with_client(
        &self,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        let (client, connection) = tokio_postgres::connect(&self.url, tokio_postgres::NoTls)
            .await
            .map_err(|e| ConnectorError::Connection {
                reason: e.to_string(),
            })?;
        let driver = tokio::spawn(async move {
            // The connection resolves when the client is dropped.
            let _ = connection.await;
        });

        let mut result = Ok(());
        for statement in statements {
            if let Err(e) = client.batch_execute(statement).await {
                result = Err(ConnectorError::Statement {
                    reason: e.to_string(),
                });
                break;
            }
        }

        drop(client);
        let _ = driver.await;
        result
    }
}

#[async_trait::async_trait]
impl Connector for PostgresConnector {
    fn plugin(&self) -> &str {
        "postgres"
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        self.with_client(&["SELECT 1".to_owned()]).await
    }

    async fn create_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "postgres", "creating dynamic user");
        self.with_client(statements).await
    }

    async fn revoke_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "postgres", "revoking dynamic user");
        self.with_client(statements).await
    }

    async fn rotate_root(&self, statements: &[String]) -> Result<(), ConnectorError> {
        self.with_client(statements).await
    }
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector").finish_non_exhaustive()
    }
}

// ── MySQL ────────────────────────────────────────────────────────────

/// Connector for MySQL. Opens a transient pool per operation.
pub struct MySqlConnector {
    url: String,
}

impl MySqlConnector {
    /// Create a connector for the given connection URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn run(&self, statements: &[String]) -> Result<(), ConnectorError> {
        use mysql_async::prelude::Queryable;

        let opts = mysql_async::Opts::from_url(&self.url).map_err(|e| {
            ConnectorError::Connection {
                reason: e.to_string(),
            }
        })?;
        let pool = mysql_async::Pool::new(opts);
        let mut result = Ok(());

        match pool.get_conn().await {
            Ok(mut conn) => {
                for statement in statements {
                    if let Err(e) = conn.query_drop(statement.as_str()).await {
                        result = Err(ConnectorError::Statement {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                drop(conn);
            }
            Err(e) => {
                result = Err(ConnectorError::Connection {
                    reason: e.to_string(),
                });
            }
        }

        let _ = pool.disconnect().await;
        result
    }
}

#[async_trait::async_trait]
impl Connector for MySqlConnector {
    fn plugin(&self) -> &str {
        "mysql"
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        self.run(&["SELECT 1".to_owned()]).await
    }

    async fn create_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "mysql", "creating dynamic user");
        self.run(statements).await
    }

    async fn revoke_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "mysql", "revoking dynamic user");
        self.run(statements).await
    }

    async fn rotate_root(&self, statements: &[String]) -> Result<(), ConnectorError> {
        self.run(statements).await
    }
}

impl std::fmt::Debug for MySqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnector").finish_non_exhaustive()
    }
}

// ── Redis ────────────────────────────────────────────────────────────

/// Connector for Redis. Statements are space-separated command words,
/// typically `ACL SETUSER ...` / `ACL DELUSER ...`.
pub struct RedisConnector {
    url: String,
}

impl RedisConnector {
    /// Create a connector for the given connection URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn run(&self, statements: &[String]) -> Result<(), ConnectorError> {
        let client =
            redis::Client::open(self.url.as_str()).map_err(|e| ConnectorError::Connection {
                reason: e.to_string(),
            })?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConnectorError::Connection {
                reason: e.to_string(),
            })?;

        for statement in statements {
            let mut words = statement.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            let mut command = redis::cmd(first);
            for word in words {
                command.arg(word);
            }
            let _: () = command
                .query_async(&mut conn)
                .await
                .map_err(|e| ConnectorError::Statement {
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for RedisConnector {
    fn plugin(&self) -> &str {
        "redis"
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        self.run(&["PING".to_owned()]).await
    }

    async fn create_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "redis", "creating dynamic user");
        self.run(statements).await
    }

    async fn revoke_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        debug!(username, plugin = "redis", "revoking dynamic user");
        self.run(statements).await
    }

    async fn rotate_root(&self, statements: &[String]) -> Result<(), ConnectorError> {
        self.run(statements).await
    }
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector").finish_non_exhaustive()
    }
}

// ── In-memory (tests) ────────────────────────────────────────────────

/// In-memory connector for tests. Tracks created and revoked users and the
/// statements executed against it, and can be told to fail on demand.
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, bool>,
    statements: Vec<String>,
    fail_verify: bool,
    fail_create: bool,
    /// Number of upcoming revoke calls that fail before one succeeds.
    revoke_failures_remaining: u32,
}

impl MemoryConnector {
    /// Create an empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `verify_connection` fail.
    pub async fn fail_verify(&self) {
        self.state.lock().await.fail_verify = true;
    }

    /// Make `create_user` fail.
    pub async fn fail_create(&self) {
        self.state.lock().await.fail_create = true;
    }

    /// Make the next `count` revoke calls fail.
    pub async fn fail_next_revokes(&self, count: u32) {
        self.state.lock().await.revoke_failures_remaining = count;
    }

    /// Users created and still active.
    pub async fn active_users(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .users
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether a user was created and later revoked.
    pub async fn was_revoked(&self, username: &str) -> bool {
        let state = self.state.lock().await;
        state.users.get(username) == Some(&false)
    }

    /// All statements executed, in order.
    pub async fn executed_statements(&self) -> Vec<String> {
        self.state.lock().await.statements.clone()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    fn plugin(&self) -> &str {
        "memory"
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        if self.state.lock().await.fail_verify {
            return Err(ConnectorError::Connection {
                reason: "memory connector verify failure injected".to_owned(),
            });
        }
        Ok(())
    }

    async fn create_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        if state.fail_create {
            return Err(ConnectorError::Statement {
                reason: "memory connector create failure injected".to_owned(),
            });
        }
        state.statements.extend(statements.iter().cloned());
        state.users.insert(username.to_owned(), true);
        Ok(())
    }

    async fn revoke_user(
        &self,
        username: &str,
        statements: &[String],
    ) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        if state.revoke_failures_remaining > 0 {
            state.revoke_failures_remaining -= 1;
            return Err(ConnectorError::Connection {
                reason: "memory connector revoke failure injected".to_owned(),
            });
        }
        state.statements.extend(statements.iter().cloned());
        state.users.insert(username.to_owned(), false);
        Ok(())
    }

    async fn rotate_root(&self, statements: &[String]) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        state.statements.extend(statements.iter().cloned());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn build_connector_known_plugins() {
        assert!(build_connector("postgres", "postgres://localhost").is_ok());
        assert!(build_connector("postgresql", "postgres://localhost").is_ok());
        assert!(build_connector("mysql", "mysql://localhost").is_ok());
        assert!(build_connector("redis", "redis://localhost").is_ok());
        assert!(build_connector("memory", "").is_ok());
    }

    #[test]
    fn build_connector_unsupported_plugins() {
        for plugin in ["mssql", "mongo", "oracle"] {
            let err = build_connector(plugin, "").unwrap_err();
            assert!(matches!(err, ConnectorError::Unsupported { .. }), "{plugin}");
        }
    }

    #[test]
    fn known_plugin_names() {
        for plugin in ["postgres", "mysql", "mssql", "mongo", "redis", "memory"] {
            assert!(is_known_plugin(plugin));
        }
        assert!(!is_known_plugin("oracle"));
    }

    #[test]
    fn generated_passwords_are_unique_hex() {
        let connector = MemoryConnector::new();
        let a = connector.generate_password();
        let b = connector.generate_password();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn memory_connector_tracks_lifecycle() {
        let connector = MemoryConnector::new();
        connector
            .create_user("usp-ro-abc", &["CREATE USER usp-ro-abc".to_owned()])
            .await
            .unwrap();
        assert_eq!(connector.active_users().await, vec!["usp-ro-abc".to_owned()]);

        connector
            .revoke_user("usp-ro-abc", &["DROP USER usp-ro-abc".to_owned()])
            .await
            .unwrap();
        assert!(connector.was_revoked("usp-ro-abc").await);
        assert!(connector.active_users().await.is_empty());
    }

    #[tokio::test]
    async fn memory_connector_injected_failures() {
        let connector = MemoryConnector::new();
        connector.fail_verify().await;
        assert!(connector.verify_connection().await.is_err());

        connector.fail_next_revokes(2).await;
        assert!(connector.revoke_user("u", &[]).await.is_err());
        assert!(connector.revoke_user("u", &[]).await.is_err());
        connector.create_user("u", &[]).await.unwrap();
        connector.revoke_user("u", &[]).await.unwrap();
        assert!(connector.was_revoked("u").await);
    }
}
