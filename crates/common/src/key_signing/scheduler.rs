//! Timers driving the key lifecycle.
//!
//! One recurring task rotates keys; one one-shot task per retiring key deletes
//! it when its retirement window ends. Deletion tasks are tracked by kid so
//! they can be cancelled on shutdown and so no key gets two timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::Report;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::JwksError;

use super::rotation::{KeyLifecycleManager, KeyRotationResult, Retirement};

type DeletionRegistry = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

pub struct KeyScheduler {
    manager: Arc<KeyLifecycleManager>,
    deletions: DeletionRegistry,
    rotation: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl KeyScheduler {
    #[must_use]
    pub fn new(manager: Arc<KeyLifecycleManager>) -> Self {
        Self {
            manager,
            deletions: Arc::new(Mutex::new(HashMap::new())),
            rotation: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<KeyLifecycleManager> {
        &self.manager
    }

    /// Registers a one-shot deletion of `kid` at `delete_at`.
    ///
    /// Returns `false` if a live timer for `kid` already exists or the
    /// scheduler is shutting down. A time in the past fires immediately.
    pub fn schedule_deletion(&self, kid: &str, delete_at: DateTime<Utc>) -> bool {
        let mut deletions = self
            .deletions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked under the registry lock so shutdown's drain sees every timer.
        if self.shutting_down.load(Ordering::SeqCst) {
            log::debug!("Not scheduling deletion of {kid} during shutdown");
            return false;
        }

        if deletions.get(kid).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let delay = (delete_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        log::info!(
            "Schedule deletion of key with kid {kid} at {delete_at} in {} seconds",
            delay.as_secs()
        );

        let manager = Arc::clone(&self.manager);
        let registry = Arc::clone(&self.deletions);
        let task_kid = kid.to_string();
        // The registry lock is held until the handle is inserted, so the
        // task's own removal always comes after its insertion.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            log::info!("Deleting key with kid {task_kid} now");
            if let Err(e) = manager.delete_key(&task_kid).await {
                log::error!("Deletion of {task_kid} failed, will retry on next rotation: {e:?}");
            }
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_kid);
        });

        deletions.insert(kid.to_string(), handle);
        true
    }

    /// Arms a deletion timer for every retirement without a live timer.
    pub fn arm_pending(&self, retirements: &[Retirement]) -> usize {
        retirements
            .iter()
            .filter(|r| self.schedule_deletion(&r.kid, r.delete_at))
            .count()
    }

    /// Rotates immediately and schedules the resulting deletions.
    ///
    /// # Errors
    ///
    /// Returns an error if the rotation could not be persisted.
    pub async fn rotate_now(&self) -> Result<KeyRotationResult, Report<JwksError>> {
        let result = self.manager.rotate(Utc::now()).await;
        // Re-arming on failure too retries deletions that failed earlier.
        let pending = match &result {
            Ok(rotation) => rotation.pending_retirements.clone(),
            Err(_) => self.manager.pending_retirements(),
        };
        self.arm_pending(&pending);
        result
    }

    /// Starts the recurring rotation task. Calling it again restarts the task.
    pub fn start_rotation(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let settings = self.manager.settings();
        let interval = settings.interval();
        let first_delay = if settings.align_to_wall_clock {
            delay_until_next_boundary(Utc::now(), interval)
        } else {
            interval
        };

        log::info!(
            "Rotating keys every {} seconds, first rotation in {} ms",
            interval.as_secs(),
            first_delay.as_millis()
        );

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Failures are logged and counted by the manager.
                let _ = scheduler.rotate_now().await;
            }
        });

        if let Some(previous) = self
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }

    #[must_use]
    pub fn pending_deletions(&self) -> usize {
        self.deletions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Cancels every timer and waits for an in-flight mutation to finish.
    ///
    /// The rotation task is awaited before deletions are drained, so a
    /// rotation cut short here cannot arm new timers afterwards.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let rotation = self
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = rotation {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("Rotation task failed: {e}");
                }
            }
        }

        let cancelled: Vec<_> = self
            .deletions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (kid, handle) in &cancelled {
            handle.abort();
            log::debug!("Cancelled deletion of {kid}");
        }
        log::info!("Cancelled {} pending deletions", cancelled.len());

        self.manager.quiesce().await;
    }
}

/// Time until the next multiple of `interval` since the Unix epoch.
fn delay_until_next_boundary(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = i64::try_from(interval.as_millis())
        .unwrap_or(i64::MAX)
        .max(1);
    let elapsed = now.timestamp_millis().rem_euclid(interval_ms);
    Duration::from_millis(u64::try_from(interval_ms - elapsed).unwrap_or(0))
}
