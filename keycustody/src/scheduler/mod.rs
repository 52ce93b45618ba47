//! Background key lifecycle: signed pre-key rotation and one-time pre-key
//! replenishment.
//!
//! Each user is an independent unit that commits in a single transaction, so
//! a failure, timeout or shutdown leaves every user either fully processed or
//! untouched. Failures are audited and the pass moves on.
//!
//! Units never overlap: scheduled passes and on-demand triggers take the same
//! lock, and each unit re-reads the user's state once it holds it. The
//! per-user timeout covers generation and the commit; cache refresh and the
//! key event run after it.

mod notify;

pub use notify::{HttpNotifier, KeyEvent, KeyEventKind, LogNotifier, Notifier, NotifyError};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::CacheKey;
use crate::config::SchedulerConfig;
use crate::crypto::KeyGenerator;
use crate::error::{CustodyError, CustodyResult};
use crate::models::{
    OneTimePreKeyRecord, OneTimePreKeyState, RotationAuditEntry, RotationKind, RotationReport,
    SignedPreKeyRecord, SignedPreKeyState,
};
use crate::store::ProtocolStore;

/// What a unit committed for one user
#[derive(Debug)]
enum UnitOutcome {
    Rotated {
        previous: Option<u32>,
        record: SignedPreKeyRecord,
    },
    Replenished {
        added: u32,
    },
    Skipped,
}

impl UnitOutcome {
    fn event(&self, user_id: &str) -> Option<KeyEvent> {
        match self {
            UnitOutcome::Rotated { record, .. } => {
                Some(KeyEvent::signed_pre_key_rotated(user_id, record.key_id))
            }
            UnitOutcome::Replenished { added, .. } => {
                Some(KeyEvent::one_time_pre_keys_replenished(user_id, *added))
            }
            UnitOutcome::Skipped => None,
        }
    }
}

pub struct LifecycleScheduler {
    store: ProtocolStore,
    generator: KeyGenerator,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    key_writes: Mutex<()>,
}

impl std::fmt::Debug for LifecycleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleScheduler {
    pub fn new(
        store: ProtocolStore,
        generator: KeyGenerator,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            generator,
            notifier,
            config,
            key_writes: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Rotate every active signed pre-key expiring within the lookahead window
    pub async fn run_rotation(&self) -> CustodyResult<RotationReport> {
        self.rotation_pass(None).await
    }

    /// Rotate one user's signed pre-key now, whatever its expiry
    pub async fn rotate_user(&self, user_id: &str) -> RotationReport {
        let started = Instant::now();
        let mut report = RotationReport::default();

        let previous = match self.store.repository().find_active_signed_prekey(user_id).await {
            Ok(active) => active.map(|record| record.key_id),
            Err(e) => {
                let error = e.to_string();
                self.record_failure(user_id, RotationKind::SignedPreKey, None, &error, started)
                    .await;
                report.processed = 1;
                report.failed = 1;
                report.elapsed_ms = elapsed_ms(started);
                return report;
            }
        };

        self.run_unit(
            user_id,
            RotationKind::SignedPreKey,
            previous,
            self.rotate_signed_pre_key(user_id, None),
            &mut report,
        )
        .await;
        report.elapsed_ms = elapsed_ms(started);
        report
    }

    /// Top up every user below the one-time pre-key floor
    pub async fn run_replenishment(&self) -> CustodyResult<RotationReport> {
        self.replenishment_pass(None).await
    }

    /// Top up one user; a no-op when their supply is at or above the floor
    pub async fn replenish_user(&self, user_id: &str) -> RotationReport {
        let started = Instant::now();
        let mut report = RotationReport::default();
        self.run_unit(
            user_id,
            RotationKind::OneTimePreKeys,
            None,
            self.replenish_one_time_pre_keys(user_id),
            &mut report,
        )
        .await;
        report.elapsed_ms = elapsed_ms(started);
        report
    }

    /// Run both jobs on their intervals until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rotation = tokio::time::interval(self.config.rotation_interval());
            let mut replenishment = tokio::time::interval(self.config.replenish_interval());
            rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
            replenishment.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                rotation_interval_secs = self.config.rotation_interval_secs,
                replenish_interval_secs = self.config.replenish_interval_secs,
                "Lifecycle scheduler started"
            );

            loop {
                tokio::select! {
                    _ = rotation.tick() => {
                        match self.rotation_pass(Some(&shutdown)).await {
                            Ok(report) => log_report("Signed pre-key rotation", &report),
                            Err(e) => tracing::error!("Signed pre-key rotation pass failed: {}", e),
                        }
                    }
                    _ = replenishment.tick() => {
                        match self.replenishment_pass(Some(&shutdown)).await {
                            Ok(report) => log_report("One-time pre-key replenishment", &report),
                            Err(e) => {
                                tracing::error!("One-time pre-key replenishment pass failed: {}", e)
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
            }

            tracing::info!("Lifecycle scheduler stopped");
        })
    }

    async fn rotation_pass(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> CustodyResult<RotationReport> {
        let started = Instant::now();
        let mut report = RotationReport::default();

        let expiring = self
            .store
            .repository()
            .signed_prekeys_expiring_within(self.config.rotation_lookahead(), Utc::now())
            .await?;

        for record in expiring {
            if is_shutting_down(shutdown) {
                tracing::info!(
                    processed = report.processed,
                    "Rotation pass interrupted by shutdown"
                );
                break;
            }
            let user_id = record.user_id.as_str();
            self.run_unit(
                user_id,
                RotationKind::SignedPreKey,
                Some(record.key_id),
                self.rotate_signed_pre_key(user_id, Some(record.key_id)),
                &mut report,
            )
            .await;
        }

        report.elapsed_ms = elapsed_ms(started);
        Ok(report)
    }

    async fn replenishment_pass(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> CustodyResult<RotationReport> {
        let started = Instant::now();
        let mut report = RotationReport::default();

        let below_floor = self
            .store
            .repository()
            .users_below_one_time_prekey_floor(self.config.prekey_floor, Utc::now())
            .await?;

        for (user_id, _) in below_floor {
            if is_shutting_down(shutdown) {
                tracing::info!(
                    processed = report.processed,
                    "Replenishment pass interrupted by shutdown"
                );
                break;
            }
            self.run_unit(
                &user_id,
                RotationKind::OneTimePreKeys,
                None,
                self.replenish_one_time_pre_keys(&user_id),
                &mut report,
            )
            .await;
        }

        report.elapsed_ms = elapsed_ms(started);
        Ok(report)
    }

    /// Run one user's unit under the key-write lock and the per-user timeout,
    /// then tally the outcome. The key event is sent once the lock is released.
    async fn run_unit<F>(
        &self,
        user_id: &str,
        kind: RotationKind,
        previous_key_id: Option<u32>,
        unit: F,
        report: &mut RotationReport,
    ) where
        F: Future<Output = CustodyResult<UnitOutcome>>,
    {
        let started = Instant::now();
        report.processed += 1;

        let guard = self.key_writes.lock().await;
        let committed = match tokio::time::timeout(self.config.user_timeout(), unit).await {
            Ok(Ok(UnitOutcome::Skipped)) => {
                report.skipped += 1;
                None
            }
            Ok(Ok(outcome)) => {
                report.succeeded += 1;
                self.refresh_cache(user_id, &outcome).await;
                Some(outcome)
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id, kind = kind.as_str(), "Key lifecycle unit failed: {}", e);
                report.failed += 1;
                self.record_failure(user_id, kind, previous_key_id, &e.to_string(), started)
                    .await;
                None
            }
            Err(_) => {
                tracing::warn!(
                    user_id,
                    kind = kind.as_str(),
                    timeout_secs = self.config.user_timeout_secs,
                    "Key lifecycle unit timed out"
                );
                report.failed += 1;
                self.record_failure(user_id, kind, previous_key_id, "timed out", started)
                    .await;
                None
            }
        };
        drop(guard);

        if let Some(event) = committed.as_ref().and_then(|outcome| outcome.event(user_id)) {
            self.notify(event).await;
        }
    }

    async fn record_failure(
        &self,
        user_id: &str,
        kind: RotationKind,
        previous_key_id: Option<u32>,
        error: &str,
        started: Instant,
    ) {
        let entry = RotationAuditEntry::failed(user_id, kind, error, started.elapsed())
            .with_key_ids(previous_key_id, None);
        if let Err(e) = self.store.repository().record_audit_entry(&entry).await {
            tracing::error!(user_id, "Failed to record audit entry: {}", e);
        }
    }

    /// Rotate the user's signed pre-key. With `expected` set, the unit is
    /// skipped when that key is no longer the active one.
    async fn rotate_signed_pre_key(
        &self,
        user_id: &str,
        expected: Option<u32>,
    ) -> CustodyResult<UnitOutcome> {
        let started = Instant::now();
        let repo = self.store.repository();

        let previous = repo.find_active_signed_prekey(user_id).await?.map(|r| r.key_id);
        if expected.is_some() && previous != expected {
            tracing::debug!(user_id, ?expected, ?previous, "Signed pre-key already rotated");
            return Ok(UnitOutcome::Skipped);
        }

        let identity = repo
            .find_primary_identity(user_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("identity for {}", user_id)))?;
        let wrapped = identity.wrapped_private_key.ok_or_else(|| {
            CustodyError::PrivateMaterialUnavailable(format!(
                "identity for {} is client-held",
                user_id
            ))
        })?;

        let key_id = next_key_id(repo.max_signed_prekey_id(user_id).await?)?;

        let generator = self.generator.clone();
        let pair = tokio::task::spawn_blocking(move || {
            generator.generate_signed_pre_key(key_id, &wrapped)
        })
        .await??;

        let record = SignedPreKeyRecord {
            user_id: user_id.to_string(),
            key_id,
            public_key: pair.public_key.clone(),
            signature: pair.signature.clone(),
            state: SignedPreKeyState::Active,
            created_at: pair.created_at,
            expires_at: pair.created_at + self.store.policy().signed_pre_key_lifetime(),
        };

        self.store
            .stash_signed_pre_key_private(user_id, &pair, record.expires_at)
            .await?;

        let audit =
            RotationAuditEntry::succeeded(user_id, RotationKind::SignedPreKey, started.elapsed())
                .with_key_ids(previous, Some(key_id));
        repo.rotate_signed_prekey(&record, &audit).await?;

        tracing::info!(user_id, previous_key_id = ?previous, key_id, "Signed pre-key rotated");
        Ok(UnitOutcome::Rotated { previous, record })
    }

    async fn replenish_one_time_pre_keys(&self, user_id: &str) -> CustodyResult<UnitOutcome> {
        let started = Instant::now();
        let repo = self.store.repository();
        let now = Utc::now();

        let available = repo.count_available_one_time_prekeys(user_id, now).await?;
        let floor = self.config.prekey_floor;
        if available >= floor {
            tracing::debug!(user_id, available, floor, "One-time pre-key supply sufficient");
            return Ok(UnitOutcome::Skipped);
        }

        let count = self.config.prekey_batch.max(floor - available);
        let start_id = next_key_id(repo.max_one_time_prekey_id(user_id).await?)?;
        let pairs = self.generator.generate_one_time_pre_keys(start_id, count)?;

        let expires_at = now + self.store.policy().one_time_pre_key_lifetime();
        let mut records = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            self.store.stash_pre_key_private(user_id, pair, expires_at).await?;
            records.push(OneTimePreKeyRecord {
                user_id: user_id.to_string(),
                key_id: pair.key_id,
                public_key: pair.public_key.clone(),
                state: OneTimePreKeyState::Available,
                created_at: now,
                expires_at,
            });
        }

        let audit =
            RotationAuditEntry::succeeded(user_id, RotationKind::OneTimePreKeys, started.elapsed())
                .with_keys_added(count);
        repo.replenish_one_time_prekeys(&records, &audit).await?;

        tracing::info!(user_id, available, added = count, "One-time pre-keys replenished");
        Ok(UnitOutcome::Replenished { added: count })
    }

    async fn refresh_cache(&self, user_id: &str, outcome: &UnitOutcome) {
        if let UnitOutcome::Rotated { previous, record } = outcome {
            let cache = self.store.cache();
            if let Some(previous) = previous {
                cache.invalidate(&CacheKey::signed_pre_key(user_id, *previous)).await;
            }
            cache.put(&CacheKey::signed_pre_key(user_id, record.key_id), record).await;
        }
    }

    async fn notify(&self, event: KeyEvent) {
        if let Err(e) = self.notifier.notify(&event).await {
            tracing::warn!(
                user_id = %event.user_id,
                kind = ?event.kind,
                "Key event notification failed: {}",
                e
            );
        }
    }
}

fn next_key_id(current_max: Option<u32>) -> CustodyResult<u32> {
    match current_max {
        None => Ok(1),
        Some(max) => max
            .checked_add(1)
            .ok_or_else(|| CustodyError::Internal("key id space exhausted".to_string())),
    }
}

fn is_shutting_down(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn log_report(job: &str, report: &RotationReport) {
    tracing::info!(
        processed = report.processed,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        elapsed_ms = report.elapsed_ms,
        "{} pass complete",
        job
    );
}
