//! Background maintenance for the key store.
//!
//! Three jobs run on their own timers, independent of request traffic:
//!
//! * daily: delete signed prekeys past their expiry grace period
//! * hourly: report devices whose one-time prekey pool is low (read-only)
//! * weekly: purge stale unused prekeys and long-consumed used ones
//!
//! Each job is its own error boundary. A failure is logged and reflected in
//! [`HealthSnapshot::is_healthy`] (the job's timestamp stops advancing); it
//! never propagates or stops later runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::policy::KeyPolicy;
use crate::rotation::KeyRotationManager;
use crate::store::KeyStore;
use crate::KeyError;

/// Timer periods and health thresholds for the maintenance jobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub daily_interval: Duration,
    pub hourly_interval: Duration,
    pub weekly_interval: Duration,
    /// The daily job is overdue once its last success is older than this.
    pub daily_stale_after: chrono::Duration,
    /// The hourly job is overdue once its last success is older than this.
    pub hourly_stale_after: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_interval: Duration::from_secs(24 * 60 * 60),
            hourly_interval: Duration::from_secs(60 * 60),
            weekly_interval: Duration::from_secs(7 * 24 * 60 * 60),
            daily_stale_after: chrono::Duration::hours(25),
            hourly_stale_after: chrono::Duration::hours(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintenanceJob {
    ExpiredSignedPreKeyCleanup,
    LowPreKeyScan,
    OldPreKeyCleanup,
}

impl MaintenanceJob {
    fn name(self) -> &'static str {
        match self {
            Self::ExpiredSignedPreKeyCleanup => "expired_signed_prekey_cleanup",
            Self::LowPreKeyScan => "low_prekey_scan",
            Self::OldPreKeyCleanup => "old_prekey_cleanup",
        }
    }
}

/// Last successful run of each job. Process-lifetime only.
#[derive(Debug, Default, Clone)]
struct MaintenanceStatus {
    last_cleanup_time: Option<DateTime<Utc>>,
    last_pre_key_check_time: Option<DateTime<Utc>>,
    last_old_pre_key_cleanup_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub last_cleanup_time: Option<DateTime<Utc>>,
    pub last_pre_key_check_time: Option<DateTime<Utc>>,
    pub last_old_pre_key_cleanup_time: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

/// Result of the weekly purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyPurge {
    pub unused_deleted: usize,
    pub used_deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualCleanupReport {
    pub expired_signed_pre_keys_deleted: usize,
    pub old_pre_keys_deleted: usize,
    pub used_pre_keys_deleted: usize,
    /// One message per job that failed; the other jobs still ran.
    pub errors: Vec<String>,
}

pub struct MaintenanceScheduler {
    store: Arc<dyn KeyStore>,
    rotation: Arc<KeyRotationManager>,
    policy: KeyPolicy,
    config: SchedulerConfig,
    status: RwLock<MaintenanceStatus>,
    started_at: DateTime<Utc>,
}

impl MaintenanceScheduler {
    pub fn new(
        store: Arc<dyn KeyStore>,
        rotation: Arc<KeyRotationManager>,
        policy: KeyPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            rotation,
            policy,
            config,
            status: RwLock::new(MaintenanceStatus::default()),
            started_at: Utc::now(),
        }
    }

    /// Spawn the three job loops. They stop when `shutdown` flips or its
    /// sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        [
            (MaintenanceJob::ExpiredSignedPreKeyCleanup, self.config.daily_interval),
            (MaintenanceJob::LowPreKeyScan, self.config.hourly_interval),
            (MaintenanceJob::OldPreKeyCleanup, self.config.weekly_interval),
        ]
        .into_iter()
        .map(|(job, period)| {
            tokio::spawn(job_loop(Arc::clone(self), job, period, shutdown.clone()))
        })
        .collect()
    }

    /// Daily job. Returns the number of signed prekeys deleted, or `None`
    /// if the job failed.
    pub fn run_expired_signed_prekey_cleanup(&self) -> Option<usize> {
        swallow(
            MaintenanceJob::ExpiredSignedPreKeyCleanup,
            self.cleanup_expired_signed_prekeys(),
        )
    }

    /// Hourly job. Returns how many devices are below the low-water mark.
    pub fn run_low_prekey_check(&self) -> Option<usize> {
        swallow(MaintenanceJob::LowPreKeyScan, self.check_low_prekeys())
    }

    /// Weekly job. Returns `None` if either deletion failed; the other
    /// one still ran.
    pub fn run_old_prekey_cleanup(&self) -> Option<PreKeyPurge> {
        let (purge, errors) = self.purge_old_prekeys();
        for e in &errors {
            log_failure(MaintenanceJob::OldPreKeyCleanup, e);
        }
        errors.is_empty().then_some(purge)
    }

    /// Run the daily and weekly jobs now, for operators.
    pub fn manual_cleanup(&self) -> ManualCleanupReport {
        tracing::info!("manual key cleanup triggered");
        let mut report = ManualCleanupReport::default();

        match self.cleanup_expired_signed_prekeys() {
            Ok(deleted) => report.expired_signed_pre_keys_deleted = deleted,
            Err(e) => {
                log_failure(MaintenanceJob::ExpiredSignedPreKeyCleanup, &e);
                report.errors.push(format!("signed prekey cleanup: {e}"));
            }
        }

        let (purge, errors) = self.purge_old_prekeys();
        report.old_pre_keys_deleted = purge.unused_deleted;
        report.used_pre_keys_deleted = purge.used_deleted;
        for e in errors {
            log_failure(MaintenanceJob::OldPreKeyCleanup, &e);
            report.errors.push(format!("prekey purge: {e}"));
        }
        report
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let status = self.status.read().clone();
        let now = Utc::now();
        let fresh = |last: Option<DateTime<Utc>>, stale_after: chrono::Duration| {
            // A job that has never run is only overdue once the process has
            // been up longer than the job's own deadline.
            now - last.unwrap_or(self.started_at) <= stale_after
        };
        let is_healthy = fresh(status.last_cleanup_time, self.config.daily_stale_after)
            && fresh(status.last_pre_key_check_time, self.config.hourly_stale_after);

        HealthSnapshot {
            last_cleanup_time: status.last_cleanup_time,
            last_pre_key_check_time: status.last_pre_key_check_time,
            last_old_pre_key_cleanup_time: status.last_old_pre_key_cleanup_time,
            is_healthy,
        }
    }

    fn run(&self, job: MaintenanceJob) {
        match job {
            MaintenanceJob::ExpiredSignedPreKeyCleanup => {
                self.run_expired_signed_prekey_cleanup();
            }
            MaintenanceJob::LowPreKeyScan => {
                self.run_low_prekey_check();
            }
            MaintenanceJob::OldPreKeyCleanup => {
                self.run_old_prekey_cleanup();
            }
        }
    }

    fn cleanup_expired_signed_prekeys(&self) -> Result<usize, KeyError> {
        let deleted = self
            .rotation
            .cleanup_expired_signed_prekeys(self.policy.signed_prekey_grace_days)?;
        self.status.write().last_cleanup_time = Some(Utc::now());

        if deleted > self.policy.large_cleanup_warning {
            tracing::warn!(
                deleted,
                threshold = self.policy.large_cleanup_warning,
                "unusually many expired signed prekeys deleted; \
                 devices may be failing to rotate"
            );
        } else {
            tracing::info!(deleted, "expired signed prekey cleanup finished");
        }
        Ok(deleted)
    }

    fn check_low_prekeys(&self) -> Result<usize, KeyError> {
        let low = self
            .store
            .devices_below_threshold(self.policy.low_prekey_threshold)?;
        self.status.write().last_pre_key_check_time = Some(Utc::now());

        if low.is_empty() {
            tracing::debug!("no devices with low prekey pools");
        } else {
            let empty = low.iter().filter(|l| l.unused_prekeys == 0).count();
            tracing::warn!(
                devices = low.len(),
                exhausted = empty,
                threshold = self.policy.low_prekey_threshold,
                "devices with low prekey pools"
            );
            for level in &low {
                tracing::debug!(
                    device = %level.device,
                    unused = level.unused_prekeys,
                    "low prekey pool"
                );
            }
        }
        Ok(low.len())
    }

    /// Both deletions always run. Counts from the one that succeeded are
    /// kept even when the other fails.
    fn purge_old_prekeys(&self) -> (PreKeyPurge, Vec<KeyError>) {
        let age = self.policy.old_prekey_age_days;
        let mut purge = PreKeyPurge::default();
        let mut errors = Vec::new();

        match self.store.delete_old_unused_prekeys(age) {
            Ok(deleted) => purge.unused_deleted = deleted,
            Err(e) => errors.push(e),
        }
        match self.store.delete_used_prekeys(age) {
            Ok(deleted) => purge.used_deleted = deleted,
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            self.status.write().last_old_pre_key_cleanup_time = Some(Utc::now());
            tracing::info!(
                unused_deleted = purge.unused_deleted,
                used_deleted = purge.used_deleted,
                age_days = age,
                "old prekey purge finished"
            );
        } else {
            tracing::warn!(
                unused_deleted = purge.unused_deleted,
                used_deleted = purge.used_deleted,
                failed = errors.len(),
                "old prekey purge partially failed"
            );
        }
        (purge, errors)
    }
}

fn log_failure(job: MaintenanceJob, e: &KeyError) {
    tracing::error!(
        job = job.name(),
        code = e.code(),
        error = %e,
        "maintenance job failed"
    );
}

fn swallow<T>(job: MaintenanceJob, result: Result<T, KeyError>) -> Option<T> {
    result.inspect_err(|e| log_failure(job, e)).ok()
}

async fn job_loop(
    scheduler: Arc<MaintenanceScheduler>,
    job: MaintenanceJob,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first tick, which fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let scheduler = Arc::clone(&scheduler);
                // Store calls block on SQLite; keep them off the async workers.
                if let Err(e) = tokio::task::spawn_blocking(move || scheduler.run(job)).await {
                    tracing::error!(job = job.name(), error = %e, "maintenance job panicked");
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!(job = job.name(), "maintenance loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewPreKey, NewSignedPreKey};
    use crate::store::test_stores::FailingStore;
    use crate::store::MemoryKeyStore;

    fn scheduler_with(
        store: Arc<dyn KeyStore>,
        config: SchedulerConfig,
    ) -> Arc<MaintenanceScheduler> {
        let rotation = Arc::new(KeyRotationManager::new(
            store.clone(),
            KeyPolicy::default(),
        ));
        Arc::new(MaintenanceScheduler::new(
            store,
            rotation,
            KeyPolicy::default(),
            config,
        ))
    }

    fn broken() -> Arc<dyn KeyStore> {
        Arc::new(FailingStore::broken())
    }

    fn signed(store: &dyn KeyStore, key_id: u32, lifetime: chrono::Duration) {
        let key = NewSignedPreKey {
            key_id,
            public_key: format!("SPK{key_id}"),
            signature: format!("SIG{key_id}"),
        };
        store.create_signed_prekey("u", "d", &key, lifetime).unwrap();
    }

    #[test]
    fn daily_job_respects_grace_period() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        signed(store.as_ref(), 1, chrono::Duration::days(-40));
        signed(store.as_ref(), 2, chrono::Duration::days(-10));
        let scheduler = scheduler_with(store.clone(), SchedulerConfig::default());

        assert_eq!(scheduler.run_expired_signed_prekey_cleanup(), Some(1));
        assert!(scheduler.health_snapshot().last_cleanup_time.is_some());
        assert!(store.signed_prekey_exists("u", "d", 2).unwrap());
    }

    #[test]
    fn hourly_job_only_observes() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        store.upsert_identity_key("u", "d", "ID").unwrap();
        let keys: Vec<NewPreKey> = (0..3)
            .map(|key_id| NewPreKey {
                key_id,
                public_key: format!("PK{key_id}"),
            })
            .collect();
        store.create_prekeys("u", "d", &keys, 200).unwrap();
        let scheduler = scheduler_with(store.clone(), SchedulerConfig::default());

        assert_eq!(scheduler.run_low_prekey_check(), Some(1));
        assert_eq!(store.count_unused("u", "d").unwrap(), 3);
        assert!(scheduler.health_snapshot().last_pre_key_check_time.is_some());
    }

    #[test]
    fn failing_jobs_are_swallowed() {
        let scheduler = scheduler_with(broken(), SchedulerConfig::default());
        assert_eq!(scheduler.run_expired_signed_prekey_cleanup(), None);
        assert_eq!(scheduler.run_low_prekey_check(), None);
        assert_eq!(scheduler.run_old_prekey_cleanup(), None);

        let snapshot = scheduler.health_snapshot();
        assert!(snapshot.last_cleanup_time.is_none());
        assert!(snapshot.last_pre_key_check_time.is_none());
        assert!(snapshot.last_old_pre_key_cleanup_time.is_none());
    }

    #[test]
    fn manual_cleanup_reports_counts_and_errors() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        signed(store.as_ref(), 1, chrono::Duration::days(-31));
        let report = scheduler_with(store, SchedulerConfig::default()).manual_cleanup();
        assert_eq!(report.expired_signed_pre_keys_deleted, 1);
        assert_eq!(report.old_pre_keys_deleted, 0);
        assert!(report.errors.is_empty());

        let report = scheduler_with(broken(), SchedulerConfig::default()).manual_cleanup();
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn partial_purge_keeps_counts_from_the_step_that_ran() {
        let store = Arc::new(FailingStore::failing(&["delete_used_prekeys"]));
        let old = NewPreKey {
            key_id: 1,
            public_key: "PK1".into(),
        };
        store.inner().create_prekeys("u", "d", &[old], 200).unwrap();
        store.inner().backdate_prekeys("u", "d", chrono::Duration::days(40));

        let scheduler = scheduler_with(store.clone(), SchedulerConfig::default());
        let report = scheduler.manual_cleanup();
        assert_eq!(report.old_pre_keys_deleted, 1);
        assert_eq!(report.used_pre_keys_deleted, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("prekey purge"));
        assert_eq!(store.inner().count_unused("u", "d").unwrap(), 0);

        // The weekly job is not marked done after a partial purge.
        assert_eq!(scheduler.run_old_prekey_cleanup(), None);
        assert!(scheduler
            .health_snapshot()
            .last_old_pre_key_cleanup_time
            .is_none());
    }

    #[test]
    fn fresh_scheduler_is_healthy() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let scheduler = scheduler_with(store, SchedulerConfig::default());
        let snapshot = scheduler.health_snapshot();
        assert!(snapshot.is_healthy);
        assert!(snapshot.last_cleanup_time.is_none());
    }

    #[test]
    fn overdue_jobs_make_scheduler_unhealthy() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let rotation = Arc::new(KeyRotationManager::new(
            store.clone(),
            KeyPolicy::default(),
        ));
        let mut scheduler = MaintenanceScheduler::new(
            store,
            rotation,
            KeyPolicy::default(),
            SchedulerConfig::default(),
        );
        scheduler.started_at = Utc::now() - chrono::Duration::hours(30);

        // Never ran, and the process has been up past both deadlines.
        assert!(!scheduler.health_snapshot().is_healthy);

        let ago = |delta: chrono::Duration| Some(Utc::now() - delta);
        scheduler.status.write().last_cleanup_time = ago(chrono::Duration::hours(1));
        scheduler.status.write().last_pre_key_check_time = ago(chrono::Duration::minutes(30));
        assert!(scheduler.health_snapshot().is_healthy);

        scheduler.status.write().last_pre_key_check_time = ago(chrono::Duration::hours(3));
        assert!(!scheduler.health_snapshot().is_healthy);
    }

    #[tokio::test]
    async fn loops_run_and_stop_on_shutdown() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let config = SchedulerConfig {
            daily_interval: Duration::from_millis(10),
            hourly_interval: Duration::from_millis(10),
            weekly_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(store, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = scheduler.spawn(&shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop did not stop")
                .unwrap();
        }

        let snapshot = scheduler.health_snapshot();
        assert!(snapshot.last_cleanup_time.is_some());
        assert!(snapshot.last_pre_key_check_time.is_some());
        assert!(snapshot.last_old_pre_key_cleanup_time.is_some());
    }
}
