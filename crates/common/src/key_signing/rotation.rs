//! Key lifecycle management.
//!
//! This module owns every mutation of the key store: bootstrap, rotation and
//! deletion. Each mutation loads the snapshot, edits it, saves it and then
//! publishes the result to readers, all under one writer lock, so no two
//! mutations interleave.
//!
//! ```text
//! (none) --generate--> Pending --promote--> Active --retire--> Retiring --expire--> (deleted)
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::JwksError;
use crate::settings::RotationSettings;

use super::keys::{KeyAlgorithm, KeyRecord, KeyState};
use super::snapshot::SnapshotStore;
use super::store::{KeyStore, SharedKeyStore};

/// A key moved to `Retiring` and when it is due for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retirement {
    pub kid: String,
    pub delete_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct KeyRotationResult {
    pub new_kid: String,
    /// Keys this rotation moved out of `Active`.
    pub retired: Vec<Retirement>,
    /// Every key still waiting for deletion, including older ones.
    pub pending_retirements: Vec<Retirement>,
    pub active_kids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No snapshot existed; a first key was generated.
    Generated { kid: String },
    /// An existing snapshot was adopted.
    Resumed {
        active_kid: String,
        pending_retirements: Vec<Retirement>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted { kid: String, remaining: usize },
    /// The key was already gone; nothing changed.
    NotFound { kid: String },
    /// The key is the only active key and was kept.
    Refused { kid: String },
}

/// Counters behind the issuer's health signal.
#[derive(Debug, Default)]
pub struct RotationHealth {
    consecutive_failures: AtomicU64,
    rotations_total: AtomicU64,
    failures_total: AtomicU64,
    deletions_total: AtomicU64,
    deletion_misses_total: AtomicU64,
    last_rotation_unix: AtomicI64,
}

impl RotationHealth {
    fn record_rotation(&self, at: DateTime<Utc>) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.rotations_total.fetch_add(1, Ordering::SeqCst);
        self.last_rotation_unix
            .store(at.timestamp(), Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.failures_total.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rotations_total(&self) -> u64 {
        self.rotations_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deletions_total(&self) -> u64 {
        self.deletions_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deletion_misses_total(&self) -> u64 {
        self.deletion_misses_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_rotation_at(&self) -> Option<DateTime<Utc>> {
        match self.last_rotation_unix.load(Ordering::SeqCst) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub key_count: usize,
    pub active_kid: Option<String>,
    pub consecutive_failures: u64,
    pub rotations_total: u64,
    pub failures_total: u64,
    pub deletions_total: u64,
    pub deletion_misses_total: u64,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub pending_deletions: usize,
}

pub struct KeyLifecycleManager {
    snapshot: Arc<dyn SnapshotStore>,
    keys: Arc<SharedKeyStore>,
    settings: RotationSettings,
    algorithm: KeyAlgorithm,
    write_lock: Mutex<()>,
    health: RotationHealth,
}

impl KeyLifecycleManager {
    #[must_use]
    pub fn new(
        snapshot: Arc<dyn SnapshotStore>,
        keys: Arc<SharedKeyStore>,
        settings: RotationSettings,
    ) -> Self {
        Self {
            snapshot,
            keys,
            settings,
            algorithm: KeyAlgorithm::EdDsa,
            write_lock: Mutex::new(()),
            health: RotationHealth::default(),
        }
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<SharedKeyStore> {
        &self.keys
    }

    #[must_use]
    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    #[must_use]
    pub fn health(&self) -> &RotationHealth {
        &self.health
    }

    /// Waits for any in-flight mutation to finish.
    pub async fn quiesce(&self) {
        drop(self.write_lock.lock().await);
    }

    /// Prepares the store at process start.
    ///
    /// A missing snapshot yields a freshly generated, active key. An existing
    /// snapshot is adopted; if it has no active key its newest pending record
    /// is promoted, or a new key is generated.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is corrupt or unreadable, or if the
    /// first key cannot be persisted. Both are fatal to the issuer.
    pub async fn bootstrap(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BootstrapOutcome, Report<JwksError>> {
        let _guard = self.write_lock.lock().await;

        match self.load_snapshot().await {
            Ok(mut store) if !store.is_empty() => {
                let recovered = store.signing_key().is_none();
                if recovered {
                    recover_active(&mut store, self.algorithm, now)?;
                }

                let active_kid = store
                    .signing_key()
                    .map(|r| r.kid.clone())
                    .ok_or_else(|| {
                        Report::new(JwksError::StoreCorrupt {
                            message: "snapshot holds no signing-capable key".into(),
                        })
                    })?;

                if recovered {
                    log::warn!("Snapshot had no active key, {active_kid} is now active");
                    store = self
                        .save_snapshot(store)
                        .await
                        .attach("while persisting promoted key at bootstrap")?;
                }

                let pending_retirements = pending_retirements(&store);
                log::info!(
                    "Resumed key store from {} with {} keys, active kid {}",
                    self.snapshot.location(),
                    store.len(),
                    active_kid
                );
                self.keys.publish(store);

                Ok(BootstrapOutcome::Resumed {
                    active_kid,
                    pending_retirements,
                })
            }
            Ok(_) => self.generate_initial(now).await,
            Err(e) if matches!(e.current_context(), JwksError::StoreMissing { .. }) => {
                self.generate_initial(now).await
            }
            Err(e) => Err(e.attach("while bootstrapping key store")),
        }
    }

    async fn generate_initial(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BootstrapOutcome, Report<JwksError>> {
        let mut record = KeyRecord::generate(self.algorithm, now)?;
        record.promote();
        let kid = record.kid.clone();

        let store = self
            .save_snapshot(KeyStore::new(vec![record]))
            .await
            .attach("while persisting initial key")?;
        self.keys.publish(store);

        log::info!("Generated initial key with kid {kid}");
        Ok(BootstrapOutcome::Generated { kid })
    }

    /// Introduces a new active key and starts retiring the previous one.
    ///
    /// Callers schedule deletion of every entry in
    /// [`KeyRotationResult::pending_retirements`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or saved. The store
    /// and the published view are left unchanged in that case.
    pub async fn rotate(&self, now: DateTime<Utc>) -> Result<KeyRotationResult, Report<JwksError>> {
        let result = {
            let _guard = self.write_lock.lock().await;
            self.rotate_locked(now).await
        };

        match &result {
            Ok(rotation) => {
                self.health.record_rotation(now);
                log::info!(
                    "Rotating keys: new key with kid {}, retiring {:?}",
                    rotation.new_kid,
                    rotation
                        .retired
                        .iter()
                        .map(|r| r.kid.as_str())
                        .collect::<Vec<_>>()
                );
            }
            Err(e) => {
                self.health.record_failure();
                log::error!(
                    "Key rotation failed ({} consecutive): {e:?}",
                    self.health.consecutive_failures()
                );
            }
        }

        result
    }

    async fn rotate_locked(
        &self,
        now: DateTime<Utc>,
    ) -> Result<KeyRotationResult, Report<JwksError>> {
        let mut store = self.load_for_mutation().await?;

        let mut candidate = KeyRecord::generate(self.algorithm, now)?;
        while store.contains(&candidate.kid) {
            candidate = KeyRecord::generate(self.algorithm, now)?;
        }

        let delete_at = now + self.settings.retirement_window();
        let outgoing: Vec<String> = store
            .in_state(KeyState::Active)
            .map(|r| r.kid.clone())
            .collect();

        let mut retired = Vec::with_capacity(outgoing.len());
        for kid in outgoing {
            if let Some(record) = store.find_by_id_mut(&kid) {
                record.retire(delete_at);
                retired.push(Retirement { kid, delete_at });
            }
        }

        let new_kid = candidate.kid.clone();
        store.append(candidate);
        if let Some(record) = store.find_by_id_mut(&new_kid) {
            record.promote();
        }

        let store = self
            .save_snapshot(store)
            .await
            .attach("while persisting rotated key store")?;

        let result = KeyRotationResult {
            new_kid,
            retired,
            pending_retirements: pending_retirements(&store),
            active_kids: store.kids(),
        };
        self.keys.publish(store);

        Ok(result)
    }

    /// Deletes a retired key.
    ///
    /// A key that is already gone is a no-op, not an error. The last active
    /// key is never deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or saved.
    pub async fn delete_key(&self, kid: &str) -> Result<DeletionOutcome, Report<JwksError>> {
        let _guard = self.write_lock.lock().await;

        let mut store = self.load_for_mutation().await?;

        let record = match store.get(kid) {
            Ok(record) => record,
            Err(miss) => {
                // Another path may already have removed it.
                self.health
                    .deletion_misses_total
                    .fetch_add(1, Ordering::SeqCst);
                log::info!("Nothing to delete: {miss}");
                return Ok(DeletionOutcome::NotFound {
                    kid: kid.to_string(),
                });
            }
        };

        if record.is_signing_capable() && store.in_state(KeyState::Active).count() == 1 {
            log::warn!("Refusing to delete {kid}: it is the last active key");
            return Ok(DeletionOutcome::Refused {
                kid: kid.to_string(),
            });
        }

        store.remove(kid);
        let store = self
            .save_snapshot(store)
            .await
            .attach(format!("while persisting deletion of {kid}"))?;

        let remaining = store.len();
        self.keys.publish(store);
        self.health.deletions_total.fetch_add(1, Ordering::SeqCst);
        log::info!("Deleted key with kid {kid}, {remaining} keys remain");

        Ok(DeletionOutcome::Deleted {
            kid: kid.to_string(),
            remaining,
        })
    }

    /// Every retiring key in the published view.
    #[must_use]
    pub fn pending_retirements(&self) -> Vec<Retirement> {
        pending_retirements(&self.keys.snapshot())
    }

    #[must_use]
    pub fn health_report(&self, pending_deletions: usize) -> HealthReport {
        let store = self.keys.snapshot();
        let consecutive_failures = self.health.consecutive_failures();

        let degraded = consecutive_failures >= self.settings.unhealthy_after_failures
            || store.len() > self.settings.max_keys
            || store.signing_key().is_none();

        HealthReport {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            key_count: store.len(),
            active_kid: store.signing_key().map(|r| r.kid.clone()),
            consecutive_failures,
            rotations_total: self.health.rotations_total(),
            failures_total: self.health.failures_total(),
            deletions_total: self.health.deletions_total(),
            deletion_misses_total: self.health.deletion_misses_total(),
            last_rotation_at: self.health.last_rotation_at(),
            pending_deletions,
        }
    }

    /// Loads the snapshot for a mutation. A vanished snapshot is rebuilt from
    /// the last published view rather than failing every cycle.
    async fn load_for_mutation(&self) -> Result<KeyStore, Report<JwksError>> {
        match self.load_snapshot().await {
            Ok(store) => Ok(store),
            Err(e) if matches!(e.current_context(), JwksError::StoreMissing { .. }) => {
                let published = self.keys.snapshot();
                if published.is_empty() {
                    return Err(e.attach("no published key store to rebuild from"));
                }
                log::warn!(
                    "Snapshot {} is missing, rebuilding from {} published keys",
                    self.snapshot.location(),
                    published.len()
                );
                Ok(KeyStore::clone(&published))
            }
            Err(e) => Err(e.attach(format!("while loading {}", self.snapshot.location()))),
        }
    }

    /// Snapshot I/O blocks, so it runs on the blocking pool.
    async fn load_snapshot(&self) -> Result<KeyStore, Report<JwksError>> {
        let snapshot = Arc::clone(&self.snapshot);
        tokio::task::spawn_blocking(move || snapshot.load())
            .await
            .change_context_lazy(|| JwksError::StoreIo {
                message: format!("Load of {} did not complete", self.snapshot.location()),
            })?
    }

    /// Saves `store` and hands it back for publishing.
    async fn save_snapshot(&self, store: KeyStore) -> Result<KeyStore, Report<JwksError>> {
        let snapshot = Arc::clone(&self.snapshot);
        tokio::task::spawn_blocking(move || snapshot.save(&store).map(|()| store))
            .await
            .change_context_lazy(|| JwksError::StoreIo {
                message: format!("Save to {} did not complete", self.snapshot.location()),
            })?
    }
}

/// Promotes the newest pending key, or generates one when only retiring
/// keys are left.
fn recover_active(
    store: &mut KeyStore,
    algorithm: KeyAlgorithm,
    now: DateTime<Utc>,
) -> Result<(), Report<JwksError>> {
    let newest_pending = store
        .in_state(KeyState::Pending)
        .last()
        .map(|r| r.kid.clone());

    match newest_pending {
        Some(kid) => {
            if let Some(record) = store.find_by_id_mut(&kid) {
                record.promote();
            }
        }
        None => {
            let mut record = KeyRecord::generate(algorithm, now)?;
            record.promote();
            store.append(record);
        }
    }

    Ok(())
}

fn pending_retirements(store: &KeyStore) -> Vec<Retirement> {
    store
        .in_state(KeyState::Retiring)
        .filter_map(|r| {
            r.retire_at.map(|delete_at| Retirement {
                kid: r.kid.clone(),
                delete_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tests::MemorySnapshotStore;
    use crate::test_support::tests::{bootstrapped_manager, create_test_settings, test_now};

    fn seconds(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[tokio::test]
    async fn test_bootstrap_generates_single_active_key() {
        let (manager, snapshot) = bootstrapped_manager().await;

        let store = manager.keys().snapshot();
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].state, KeyState::Active);
        assert!(store.signing_key().is_some());

        let persisted = snapshot.load().expect("should persist initial key");
        assert_eq!(persisted.kids(), store.kids());
    }

    #[tokio::test]
    async fn test_bootstrap_resumes_existing_snapshot() {
        let (first, snapshot) = bootstrapped_manager().await;
        first.rotate(test_now()).await.expect("should rotate");
        let before = first.keys().snapshot();

        let second = KeyLifecycleManager::new(
            snapshot.clone(),
            Arc::new(SharedKeyStore::empty()),
            create_test_settings().rotation,
        );
        let outcome = second
            .bootstrap(test_now() + seconds(10))
            .await
            .expect("should resume");

        let expected_active = before.signing_key().map(|r| r.kid.clone());
        match outcome {
            BootstrapOutcome::Resumed {
                active_kid,
                pending_retirements,
            } => {
                assert_eq!(Some(active_kid), expected_active);
                assert_eq!(pending_retirements.len(), 1);
                assert_eq!(pending_retirements[0].delete_at, test_now() + seconds(90));
            }
            other => panic!("expected resumed store, got {other:?}"),
        }
        assert_eq!(second.keys().snapshot().kids(), before.kids());
    }

    #[tokio::test]
    async fn test_bootstrap_promotes_when_no_active_key() {
        let snapshot = Arc::new(MemorySnapshotStore::new());
        let mut record = KeyRecord::generate(KeyAlgorithm::EdDsa, test_now())
            .expect("should generate key");
        record.retire(test_now() + seconds(30));
        let mut pending = KeyRecord::generate(KeyAlgorithm::EdDsa, test_now())
            .expect("should generate key");
        pending.state = KeyState::Pending;
        let pending_kid = pending.kid.clone();
        snapshot
            .save(&KeyStore::new(vec![record, pending]))
            .expect("should seed snapshot");

        let manager = KeyLifecycleManager::new(
            snapshot.clone(),
            Arc::new(SharedKeyStore::empty()),
            create_test_settings().rotation,
        );
        manager.bootstrap(test_now()).await.expect("should resume");

        let store = snapshot.load().expect("should load");
        assert_eq!(
            store.signing_key().map(|r| r.kid.clone()),
            Some(pending_kid)
        );
    }

    #[tokio::test]
    async fn test_bootstrap_generates_when_only_retiring_keys_remain() {
        let snapshot = Arc::new(MemorySnapshotStore::new());
        let mut record = KeyRecord::generate(KeyAlgorithm::EdDsa, test_now())
            .expect("should generate key");
        record.retire(test_now() + seconds(30));
        let retiring_kid = record.kid.clone();
        snapshot
            .save(&KeyStore::new(vec![record]))
            .expect("should seed snapshot");

        let manager = KeyLifecycleManager::new(
            snapshot.clone(),
            Arc::new(SharedKeyStore::empty()),
            create_test_settings().rotation,
        );
        let outcome = manager.bootstrap(test_now()).await.expect("should resume");

        let BootstrapOutcome::Resumed {
            active_kid,
            pending_retirements,
        } = outcome
        else {
            panic!("expected resumed store");
        };
        assert_ne!(active_kid, retiring_kid);
        assert_eq!(pending_retirements.len(), 1);
        assert_eq!(snapshot.load().expect("should load").len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_corrupt_snapshot() {
        let snapshot = Arc::new(MemorySnapshotStore::new());
        snapshot.set_raw(Some("garbage".into()));

        let manager = KeyLifecycleManager::new(
            snapshot.clone(),
            Arc::new(SharedKeyStore::empty()),
            create_test_settings().rotation,
        );
        let err = manager
            .bootstrap(test_now())
            .await
            .expect_err("should refuse corrupt snapshot");

        assert!(matches!(
            err.current_context(),
            JwksError::StoreCorrupt { .. }
        ));
        assert_eq!(snapshot.raw().as_deref(), Some("garbage"));
    }

    #[tokio::test]
    async fn test_rotation_retires_previous_active_key() {
        let (manager, _) = bootstrapped_manager().await;
        let initial = manager
            .keys()
            .snapshot()
            .signing_key()
            .map(|r| r.kid.clone())
            .expect("should have initial key");

        let now = test_now() + seconds(60);
        let result = manager.rotate(now).await.expect("should rotate");

        assert_ne!(result.new_kid, initial);
        assert_eq!(
            result.retired,
            vec![Retirement {
                kid: initial.clone(),
                delete_at: now + seconds(90),
            }]
        );

        let store = manager.keys().snapshot();
        assert_eq!(store.in_state(KeyState::Active).count(), 1);
        assert_eq!(
            store.signing_key().map(|r| r.kid.clone()),
            Some(result.new_kid.clone())
        );
        assert_eq!(
            store.find_by_id(&initial).map(|r| r.state),
            Some(KeyState::Retiring)
        );
        assert_eq!(manager.health().rotations_total(), 1);
    }

    #[tokio::test]
    async fn test_rotation_with_many_keys_retires_only_active() {
        let (manager, _) = bootstrapped_manager().await;

        let first = manager.rotate(test_now()).await.expect("should rotate");
        let second = manager
            .rotate(test_now() + seconds(60))
            .await
            .expect("should rotate");

        assert_eq!(second.retired.len(), 1);
        assert_eq!(second.retired[0].kid, first.new_kid);
        assert_eq!(second.pending_retirements.len(), 2);

        let store = manager.keys().snapshot();
        assert_eq!(store.len(), 3);
        assert_eq!(store.in_state(KeyState::Active).count(), 1);
        assert_eq!(store.in_state(KeyState::Retiring).count(), 2);
    }

    #[tokio::test]
    async fn test_rotation_failure_keeps_published_view() {
        let (manager, snapshot) = bootstrapped_manager().await;
        let before = manager.keys().snapshot().kids();

        snapshot.fail_next_saves(1);
        let result = manager.rotate(test_now()).await;

        assert!(result.is_err());
        assert_eq!(manager.keys().snapshot().kids(), before);
        assert_eq!(snapshot.load().expect("should load").kids(), before);
        assert_eq!(manager.health().consecutive_failures(), 1);

        manager.rotate(test_now()).await.expect("should recover");
        assert_eq!(manager.health().consecutive_failures(), 0);
        assert_eq!(manager.health().failures_total(), 1);
    }

    #[tokio::test]
    async fn test_rotation_rebuilds_missing_snapshot() {
        let (manager, snapshot) = bootstrapped_manager().await;
        snapshot.set_raw(None);

        let result = manager.rotate(test_now()).await.expect("should rotate");

        let persisted = snapshot.load().expect("should have rewritten snapshot");
        assert_eq!(persisted.len(), 2);
        assert!(persisted.contains(&result.new_kid));
    }

    #[tokio::test]
    async fn test_rotation_fails_on_corrupt_snapshot() {
        let (manager, snapshot) = bootstrapped_manager().await;
        snapshot.set_raw(Some("{\"keys\": 7}".into()));

        assert!(manager.rotate(test_now()).await.is_err());
        assert_eq!(manager.keys().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_present_key() {
        let (manager, _) = bootstrapped_manager().await;
        let rotation = manager.rotate(test_now()).await.expect("should rotate");
        let retired = rotation.retired[0].kid.clone();

        let outcome = manager.delete_key(&retired).await.expect("should delete");

        assert_eq!(
            outcome,
            DeletionOutcome::Deleted {
                kid: retired.clone(),
                remaining: 1,
            }
        );
        assert!(!manager.keys().snapshot().contains(&retired));
        assert_eq!(manager.health().deletions_total(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let (manager, snapshot) = bootstrapped_manager().await;
        let before = snapshot.raw();

        let outcome = manager
            .delete_key("never-existed")
            .await
            .expect("should not error");

        assert_eq!(
            outcome,
            DeletionOutcome::NotFound {
                kid: "never-existed".into()
            }
        );
        assert_eq!(snapshot.raw(), before);
        assert_eq!(manager.health().deletion_misses_total(), 1);
    }

    #[tokio::test]
    async fn test_delete_refuses_last_active_key() {
        let (manager, _) = bootstrapped_manager().await;
        let active = manager
            .keys()
            .snapshot()
            .signing_key()
            .map(|r| r.kid.clone())
            .expect("should have active key");

        let outcome = manager.delete_key(&active).await.expect("should not error");

        assert_eq!(outcome, DeletionOutcome::Refused { kid: active });
        assert_eq!(manager.keys().snapshot().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_are_serialized() {
        let (manager, snapshot) = bootstrapped_manager().await;
        let initial = manager.keys().snapshot().kids();
        snapshot.slow_saves(std::time::Duration::from_millis(50));

        let rotations: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.rotate(test_now() + seconds(i)).await })
            })
            .collect();

        let mut new_kids = Vec::new();
        for rotation in rotations {
            let result = rotation
                .await
                .expect("rotation task should not panic")
                .expect("rotation should succeed");
            new_kids.push(result.new_kid);
        }

        let store = snapshot.load().expect("should load");
        let kids = store.kids();
        assert_eq!(kids.len(), 1 + new_kids.len(), "no generated key may be lost");
        assert_eq!(kids[0], initial[0]);
        for kid in &new_kids {
            assert!(kids.contains(kid), "generated key {kid} was lost");
        }
        assert_eq!(store.in_state(KeyState::Active).count(), 1);
        assert_eq!(store.in_state(KeyState::Retiring).count(), new_kids.len());
        assert_eq!(manager.keys().snapshot().kids(), kids);
        assert_eq!(manager.health().rotations_total(), 4);
    }

    #[tokio::test]
    async fn test_health_report_degrades_after_failures() {
        let (manager, snapshot) = bootstrapped_manager().await;
        assert_eq!(manager.health_report(0).status, HealthStatus::Healthy);

        snapshot.fail_next_saves(2);
        let _ = manager.rotate(test_now()).await;
        let _ = manager.rotate(test_now()).await;

        let report = manager.health_report(0);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_health_report_degrades_when_keys_pile_up() {
        let (manager, _) = bootstrapped_manager().await;
        for i in 0..4 {
            manager
                .rotate(test_now() + seconds(i))
                .await
                .expect("should rotate");
        }

        let report = manager.health_report(4);
        assert_eq!(report.key_count, 5);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.pending_deletions, 4);
        assert_eq!(report.last_rotation_at, Some(test_now() + seconds(3)));
    }
}
