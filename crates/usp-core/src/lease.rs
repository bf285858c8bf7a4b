//! Lease expiry and rotation scheduling.
//!
//! A single background worker drains a min-heap of `(due, action)` entries:
//! database-lease revocations scheduled at `expires_at`, and recurring
//! rotation jobs (transit key rotation, database root rotation, KV secret
//! value rotation) at `next_execution_at`.
//!
//! At-most-once execution per `(lease, action)` is enforced by a claim on
//! the lease record (`locked_by` / `locked_until`): a worker writes its
//! claim under the lease's store lock before revoking, and a crashed
//! worker's claim lapses so another may take over. A heap entry that fires
//! early — because the lease was renewed after scheduling — is simply
//! rescheduled at the new expiry.
//!
//! Sleeping uses tokio's monotonic timer; wall-clock timestamps are only
//! ever persisted and compared, never slept on directly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::context::RequestContext;
use crate::database::DatabaseEngine;
use crate::error::DatabaseError;
use crate::kv::{KvEngine, KvWriteRequest};
use crate::store::Store;
use crate::transit::TransitEngine;

/// Storage prefix for rotation jobs.
const ROTATION_PREFIX: &str = "sys/rotation/";

/// How long a revocation claim lives before another worker may take over.
const CLAIM_TTL_SECS: i64 = 60;

/// Bounded-retry configuration for revocation and connector calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts before giving up.
    pub max_attempts: u32,
    /// Base backoff; doubles per attempt.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 250,
        }
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Revoke a database lease at its expiry.
    RevokeLease { lease_id: String },
    /// Execute a rotation job.
    RunRotation { job_id: String },
}

/// Heap entry. `seq` makes the ordering total so equal due-times dequeue
/// in insertion order.
#[derive(Debug, PartialEq, Eq)]
struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    action: ScheduledAction,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

/// Min-heap of pending actions, shared between the engines (producers) and
/// the lease manager (consumer).
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an action and wake the worker.
    pub async fn schedule(&self, due: DateTime<Utc>, action: ScheduledAction) {
        let mut state = self.state.lock().await;
        let seq = state.seq;
        state.seq = state.seq.wrapping_add(1);
        state.heap.push(Reverse(Entry { due, seq, action }));
        drop(state);
        self.notify.notify_one();
    }

    /// Pop the next action whose due time has passed.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Option<ScheduledAction> {
        let mut state = self.state.lock().await;
        if state.heap.peek().is_some_and(|Reverse(e)| e.due <= now) {
            return state.heap.pop().map(|Reverse(e)| e.action);
        }
        None
    }

    /// Due time of the nearest pending action.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.heap.peek().map(|Reverse(e)| e.due)
    }

    /// Number of pending actions.
    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    /// Whether the heap is empty.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }

    /// Resolve when new work is scheduled.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// What a rotation job rotates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RotationKind {
    /// Rotate a transit key.
    TransitKey { key: String },
    /// Rotate a database config's root credential.
    DatabaseRoot { config: String },
    /// Write a new KV version with a fresh random value in `field`.
    KvSecret { path: String, field: String },
}

/// A persisted, recurring rotation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationJob {
    /// Opaque job id.
    pub id: String,
    /// What to rotate.
    pub kind: RotationKind,
    /// Interval between executions.
    pub interval_secs: i64,
    /// Next scheduled execution.
    pub next_execution_at: DateTime<Utc>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

/// The background worker owning expiry and rotation.
pub struct LeaseManager {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    database: Arc<DatabaseEngine>,
    transit: Arc<TransitEngine>,
    kv: Arc<KvEngine>,
    audit: Arc<AuditSink>,
    worker_id: String,
}

impl LeaseManager {
    /// Create a new manager. `scheduler` must be the same instance the
    /// engines publish to.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        database: Arc<DatabaseEngine>,
        transit: Arc<TransitEngine>,
        kv: Arc<KvEngine>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            store,
            scheduler,
            database,
            transit,
            kv,
            audit,
            worker_id: format!("lease-worker-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Rebuild the heap from persisted state: one entry per unrevoked
    /// lease and per rotation job. Called once at startup, after unseal.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Store`] when persisted state can't be read.
    pub async fn restore(&self) -> Result<(), DatabaseError> {
        let leases = self.database.unrevoked_leases().await?;
        let lease_count = leases.len();
        for lease in leases {
            self.scheduler
                .schedule(
                    lease.expires_at,
                    ScheduledAction::RevokeLease {
                        lease_id: lease.lease_id,
                    },
                )
                .await;
        }

        let job_keys = self.store.list(ROTATION_PREFIX).await?;
        let mut job_count = 0usize;
        for key in &job_keys {
            if let Some(job) = self.store.get_json::<RotationJob>(key).await? {
                self.scheduler
                    .schedule(
                        job.next_execution_at,
                        ScheduledAction::RunRotation { job_id: job.id },
                    )
                    .await;
                job_count += 1;
            }
        }

        info!(leases = lease_count, jobs = job_count, "lease manager restored");
        Ok(())
    }

    /// Run until `shutdown` flips to `true`. Cancellation-safe: an action
    /// interrupted mid-revocation is retried on the next claim.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "lease manager running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;

            let sleep_ms = match self.scheduler.next_due().await {
                Some(due) => (due - Utc::now()).num_milliseconds().clamp(10, 30_000),
                None => 1_000,
            };
            let sleep = std::time::Duration::from_millis(u64::try_from(sleep_ms).unwrap_or(1_000));
            tokio::select! {
                () = self.scheduler.notified() => {}
                () = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker = %self.worker_id, "lease manager stopped");
    }

    /// Process every action that is currently due. Returns how many were
    /// handled.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let mut handled = 0usize;
        while let Some(action) = self.scheduler.pop_due(now).await {
            self.handle(action).await;
            handled += 1;
        }
        handled
    }

    // ── Rotation job CRUD ────────────────────────────────────────────

    /// Create a rotation job and schedule its first execution.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::Validation`] for a non-positive interval.
    /// - [`DatabaseError::Store`] / [`DatabaseError::Audit`] on persistence
    ///   failure.
    pub async fn create_rotation_job(
        &self,
        ctx: &RequestContext,
        kind: RotationKind,
        interval_secs: i64,
    ) -> Result<RotationJob, DatabaseError> {
        if interval_secs <= 0 {
            return Err(DatabaseError::Validation {
                reason: "rotation interval must be positive".to_owned(),
            });
        }

        let now = Utc::now();
        let job = RotationJob {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            interval_secs,
            next_execution_at: now + Duration::seconds(interval_secs),
            created_at: now,
        };
        self.store
            .put_json(&format!("{ROTATION_PREFIX}{}", job.id), &job)
            .await?;

        let audit_result = self
            .audit
            .append(
                AuditEvent::new(AuditEventType::Write, ctx, true)
                    .resource(format!("rotation/{}", job.id))
                    .action("create-rotation-job")
                    .details(serde_json::json!({
                        "kind": &job.kind,
                        "interval_secs": interval_secs,
                    })),
            )
            .await;
        if let Err(e) = audit_result {
            self.store
                .delete(&format!("{ROTATION_PREFIX}{}", job.id))
                .await?;
            return Err(e.into());
        }

        self.scheduler
            .schedule(
                job.next_execution_at,
                ScheduledAction::RunRotation {
                    job_id: job.id.clone(),
                },
            )
            .await;

        Ok(job)
    }

    /// Delete a rotation job. The heap entry becomes a no-op when it fires.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Store`] on persistence failure.
    pub async fn delete_rotation_job(&self, job_id: &str) -> Result<(), DatabaseError> {
        self.store
            .delete(&format!("{ROTATION_PREFIX}{job_id}"))
            .await?;
        Ok(())
    }

    /// All rotation jobs.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Store`] on persistence failure.
    pub async fn list_rotation_jobs(&self) -> Result<Vec<RotationJob>, DatabaseError> {
        let keys = self.store.list(ROTATION_PREFIX).await?;
        let mut jobs = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(job) = self.store.get_json::<RotationJob>(key).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // ── Action execution ─────────────────────────────────────────────

    async fn handle(&self, action: ScheduledAction) {
        match action {
            ScheduledAction::RevokeLease { lease_id } => self.handle_revocation(&lease_id).await,
            ScheduledAction::RunRotation { job_id } => self.handle_rotation(&job_id).await,
        }
    }

    async fn handle_revocation(&self, lease_id: &str) {
        let lease = match self.database.lookup_lease(lease_id).await {
            Ok(lease) => lease,
            Err(DatabaseError::LeaseNotFound { .. }) => return,
            Err(e) => {
                warn!(lease_id, error = %e, "lease lookup failed; rescheduling");
                self.reschedule_revocation(lease_id).await;
                return;
            }
        };
        if lease.revoked {
            return;
        }

        let now = Utc::now();
        if lease.expires_at > now {
            // Renewed after this entry was scheduled.
            debug!(lease_id, "lease renewed; rescheduling expiry");
            self.scheduler
                .schedule(
                    lease.expires_at,
                    ScheduledAction::RevokeLease {
                        lease_id: lease_id.to_owned(),
                    },
                )
                .await;
            return;
        }

        match self
            .database
            .claim_revocation(lease_id, &self.worker_id, Duration::seconds(CLAIM_TTL_SECS))
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(lease_id, error = %e, "revocation claim failed; rescheduling");
                self.reschedule_revocation(lease_id).await;
                return;
            }
        }

        let ctx = RequestContext::system("lease-manager");
        if let Err(e) = self.database.revoke_lease(&ctx, lease_id).await {
            // Connector failures are absorbed by the engine (lease marked,
            // failure audited); anything surfacing here is a store or audit
            // problem worth another pass.
            warn!(lease_id, error = %e, "lease revocation failed; rescheduling");
            self.reschedule_revocation(lease_id).await;
        }
    }

    async fn reschedule_revocation(&self, lease_id: &str) {
        self.scheduler
            .schedule(
                Utc::now() + Duration::seconds(CLAIM_TTL_SECS),
                ScheduledAction::RevokeLease {
                    lease_id: lease_id.to_owned(),
                },
            )
            .await;
    }

    async fn handle_rotation(&self, job_id: &str) {
        let key = format!("{ROTATION_PREFIX}{job_id}");
        let job = match self.store.get_json::<RotationJob>(&key).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id, error = %e, "rotation job load failed");
                return;
            }
        };

        let now = Utc::now();
        if job.next_execution_at > now {
            self.scheduler
                .schedule(
                    job.next_execution_at,
                    ScheduledAction::RunRotation {
                        job_id: job_id.to_owned(),
                    },
                )
                .await;
            return;
        }

        let ctx = RequestContext::system("rotation");
        let result = match &job.kind {
            RotationKind::TransitKey { key } => self
                .transit
                .rotate_key(&ctx, key)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            RotationKind::DatabaseRoot { config } => self
                .database
                .rotate_root_credentials(&ctx, config, None)
                .await
                .map_err(|e| e.to_string()),
            RotationKind::KvSecret { path, field } => {
                let mut data = serde_json::Map::new();
                data.insert(
                    field.clone(),
                    serde_json::Value::String(uuid::Uuid::new_v4().simple().to_string()),
                );
                self.kv
                    .write(
                        &ctx,
                        path,
                        KvWriteRequest {
                            data,
                            ..KvWriteRequest::default()
                        },
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
        };
        if let Err(reason) = result {
            warn!(job_id, reason, "rotation execution failed; will retry next interval");
        }

        let mut job = job;
        job.next_execution_at = now + Duration::seconds(job.interval_secs);
        if let Err(e) = self.store.put_json(&key, &job).await {
            warn!(job_id, error = %e, "rotation job persist failed");
        }
        self.scheduler
            .schedule(
                job.next_execution_at,
                ScheduledAction::RunRotation {
                    job_id: job_id.to_owned(),
                },
            )
            .await;
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
