//! USP server entry point: the composition root.
//!
//! Every component is constructed here with its dependencies passed in
//! explicitly; there is no global state beyond the shared [`AppState`].
//! The lease manager runs as a background task for the process lifetime and
//! drains gracefully on shutdown.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use usp_core::audit::{AuditSink, FileAuditBackend};
use usp_core::authz::AuthzEvaluator;
use usp_core::context::RequestContext;
use usp_core::database::DatabaseEngine;
use usp_core::hierarchy::KeyHierarchy;
use usp_core::kv::KvEngine;
use usp_core::lease::{LeaseManager, Scheduler};
use usp_core::policy::PolicyStore;
use usp_core::seal::SealController;
use usp_core::store::Store;
use usp_core::token::TokenStore;
use usp_core::transit::TransitEngine;
use usp_storage::{MemoryBackend, StorageBackend};

use crate::config::{ServerConfig, StorageBackendType};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let backend = open_backend(&config)?;
    let store = Arc::new(Store::new(backend));
    let hierarchy = Arc::new(KeyHierarchy::new());

    let audit = Arc::new(AuditSink::new(
        Arc::clone(&store),
        Arc::clone(&hierarchy),
        config.audit_key_label.clone(),
    ));
    if let Some(path) = &config.audit_file_path {
        audit.add_mirror(Arc::new(FileAuditBackend::new(path))).await;
        info!(path, "audit file mirror enabled");
    }

    let tokens = Arc::new(TokenStore::new(Arc::clone(&store)));
    let policies = Arc::new(PolicyStore::new(Arc::clone(&store), Arc::clone(&audit)));
    let authz = Arc::new(AuthzEvaluator::new(Arc::clone(&policies), config.risk));

    let scheduler = Arc::new(Scheduler::new());
    let kv = Arc::new(
        KvEngine::new(
            Arc::clone(&store),
            Arc::clone(&hierarchy),
            Arc::clone(&audit),
        )
        .with_default_max_versions(config.kv_max_versions),
    );
    let transit = Arc::new(TransitEngine::new(
        Arc::clone(&store),
        Arc::clone(&hierarchy),
        Arc::clone(&audit),
    ));
    let database = Arc::new(
        DatabaseEngine::new(
            Arc::clone(&store),
            Arc::clone(&hierarchy),
            Arc::clone(&audit),
            Arc::clone(&scheduler),
        )
        .with_retry_policy(config.lease_retry),
    );
    let seal = Arc::new(SealController::new(
        Arc::clone(&store),
        Arc::clone(&hierarchy),
        Arc::clone(&audit),
        Arc::clone(&tokens),
    ));
    let lease_manager = Arc::new(LeaseManager::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&database),
        Arc::clone(&transit),
        Arc::clone(&kv),
        Arc::clone(&audit),
    ));

    auto_unseal(&config, &seal).await?;

    lease_manager
        .restore()
        .await
        .context("failed to restore lease manager state")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let lease_manager = Arc::clone(&lease_manager);
        tokio::spawn(async move { lease_manager.run(shutdown_rx).await })
    };

    let app_state = Arc::new(AppState {
        store,
        hierarchy,
        seal,
        audit,
        tokens,
        policies,
        authz,
        kv,
        transit,
        database,
        scheduler,
        lease_manager,
        bootstrap_token: config.bootstrap_token.clone(),
        default_shares: config.default_shares,
        default_threshold: config.default_threshold,
        db_pool_default: config.db_pool_max,
    });

    let app = routes::router()
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&app_state),
            middleware::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "usp server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    info!("shutdown complete");
    Ok(())
}

/// Open the configured storage backend.
fn open_backend(config: &ServerConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match &config.storage_backend {
        StorageBackendType::Memory => {
            warn!("using in-memory storage; all data is lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        StorageBackendType::Redb { path } => {
            #[cfg(feature = "redb-backend")]
            {
                let db_path = std::path::Path::new(path).join("usp.redb");
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Ok(Arc::new(usp_storage::RedbBackend::open(&db_path)?))
            }
            #[cfg(not(feature = "redb-backend"))]
            {
                let _ = path;
                anyhow::bail!("redb backend requested but the redb-backend feature is disabled")
            }
        }
    }
}

/// Submit configured auto-unseal shares, if any. Failures are fatal only
/// for malformed configuration; a wrong share set leaves the platform
/// sealed for manual recovery.
async fn auto_unseal(config: &ServerConfig, seal: &SealController) -> anyhow::Result<()> {
    let Some(shares) = config.auto_unseal_shares()? else {
        return Ok(());
    };

    let ctx = RequestContext::system("auto-unseal");
    for share in &shares {
        match seal.submit_share(&ctx, share).await {
            Ok(None) => {
                info!("auto-unseal complete");
                return Ok(());
            }
            Ok(Some(progress)) => {
                info!(progress = progress.progress, threshold = progress.threshold, "auto-unseal progress");
            }
            Err(e) => {
                warn!(error = %e, "auto-unseal share rejected; staying sealed");
                seal.reset().await;
                return Ok(());
            }
        }
    }
    warn!("auto-unseal shares exhausted below threshold; staying sealed");
    seal.reset().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
