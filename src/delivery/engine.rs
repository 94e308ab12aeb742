//! Delivery loop driving cache entries to a target
//!
//! One engine per north connector. A pass walks the cache tier oldest
//! first, hands eligible entries to the [`DeliveryTarget`] and applies the
//! resulting tier transition. With a concurrency of 1 the pass is strictly
//! FIFO: an entry waiting for its retry blocks the ones behind it.

use super::error::DeliveryError;
use super::retention::{sweep, RetentionPolicy, SweepReport};
use super::retry::{RetryPolicy, RetryState, RetryTracker, Transition};
use crate::cache::{CacheEntry, CacheError, CacheResult, ContentCache, EntryId, Tier};
use crate::cancel::CancellationToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A target system that accepts cache payloads
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    async fn deliver(&self, entry: &CacheEntry, payload: Vec<u8>) -> Result<(), DeliveryError>;
}

/// Runtime settings of a delivery engine
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    /// Deliveries in flight at once; 1 keeps connector order
    pub concurrency: usize,
    pub delivery_timeout: Duration,
    /// Pause between passes when nothing wakes the loop
    pub idle_poll: Duration,
    pub cleanup_interval: Duration,
    /// Grace period for an in-flight pass when the loop is cancelled
    pub shutdown_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            concurrency: 1,
            delivery_timeout: Duration::from_secs(30),
            idle_poll: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to one entry during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Archived,
    Deleted,
    Retrying,
    Errored,
    Skipped,
}

/// Counters of one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub archived: usize,
    pub deleted: usize,
    pub retrying: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl RunReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Archived => self.archived += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Retrying => self.retrying += 1,
            Outcome::Errored => self.errored += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn delivered(&self) -> usize {
        self.archived + self.deleted
    }

    pub fn attempted(&self) -> usize {
        self.delivered() + self.retrying + self.errored
    }
}

/// Removes an entry from the in-flight set when dropped
struct InFlightGuard {
    engine: Arc<DeliveryEngine>,
    id: EntryId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.engine.in_flight.lock() {
            in_flight.remove(&self.id);
        }
    }
}

/// Delivers a connector's cache to its target
pub struct DeliveryEngine {
    cache: Arc<ContentCache>,
    target: Arc<dyn DeliveryTarget>,
    settings: DeliverySettings,
    retries: Mutex<RetryTracker>,
    /// Entries with a delivery attempt in progress
    in_flight: Mutex<HashSet<EntryId>>,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl DeliveryEngine {
    pub fn new(
        cache: Arc<ContentCache>,
        target: Arc<dyn DeliveryTarget>,
        settings: DeliverySettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            cache,
            target,
            settings,
            retries: Mutex::new(RetryTracker::new()),
            in_flight: Mutex::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(concurrency)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Wake the delivery loop, e.g. after new content was cached.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Handle producers use to wake the loop
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn lock_retries(&self) -> CacheResult<MutexGuard<'_, RetryTracker>> {
        self.retries.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Scheduled retries, soonest first
    pub fn scheduled_retries(&self) -> CacheResult<Vec<RetryState>> {
        Ok(self.lock_retries()?.scheduled())
    }

    fn claim(self: &Arc<Self>, id: &EntryId) -> CacheResult<Option<InFlightGuard>> {
        let mut in_flight = self.in_flight.lock().map_err(|_| CacheError::LockPoisoned)?;
        if !in_flight.insert(id.clone()) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            engine: Arc::clone(self),
            id: id.clone(),
        }))
    }

    /// One delivery pass over the cache tier.
    pub async fn run_once(self: &Arc<Self>, now: DateTime<Utc>) -> CacheResult<RunReport> {
        let pending = self.cache.pending()?;
        {
            let ids: Vec<EntryId> = pending.iter().map(|entry| entry.id.clone()).collect();
            self.lock_retries()?.retain_pending(&ids);
        }
        if pending.is_empty() {
            return Ok(RunReport::default());
        }

        let report = if self.settings.concurrency <= 1 {
            self.run_ordered(pending, now).await?
        } else {
            self.run_concurrent(pending, now).await?
        };
        if report.attempted() > 0 {
            debug!(
                connector = %self.cache.connector(),
                delivered = report.delivered(),
                retrying = report.retrying,
                errored = report.errored,
                "delivery pass finished"
            );
        }
        Ok(report)
    }

    async fn run_ordered(
        self: &Arc<Self>,
        pending: Vec<CacheEntry>,
        now: DateTime<Utc>,
    ) -> CacheResult<RunReport> {
        let mut report = RunReport::default();
        for entry in pending {
            if !self.lock_retries()?.is_eligible(&entry.id, now) {
                break;
            }
            let Some(guard) = self.claim(&entry.id)? else {
                break;
            };
            let outcome = Arc::clone(self).process(entry, now).await?;
            drop(guard);
            report.record(outcome);
            if outcome == Outcome::Retrying {
                break;
            }
        }
        Ok(report)
    }

    async fn run_concurrent(
        self: &Arc<Self>,
        pending: Vec<CacheEntry>,
        now: DateTime<Utc>,
    ) -> CacheResult<RunReport> {
        let mut report = RunReport::default();
        let mut tasks = JoinSet::new();
        for entry in pending {
            if !self.lock_retries()?.is_eligible(&entry.id, now) {
                continue;
            }
            let Some(guard) = self.claim(&entry.id)? else {
                continue;
            };
            let engine = Arc::clone(self);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Ok(Outcome::Skipped);
                };
                let outcome = engine.process(entry, now).await;
                drop(guard);
                outcome
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(connector = %self.cache.connector(), error = %e, "delivery task failed"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Deliver one entry and apply its transition
    async fn process(self: Arc<Self>, entry: CacheEntry, now: DateTime<Utc>) -> CacheResult<Outcome> {
        let connector = self.cache.connector().clone();
        let payload = match self.cache.read_payload(Tier::Cache, &entry.id) {
            Ok(payload) => payload,
            Err(CacheError::EntryNotFound { .. }) => {
                // Moved or removed by an operator since the pass started
                self.lock_retries()?.forget(&entry.id);
                return Ok(Outcome::Skipped);
            }
            Err(CacheError::CorruptEntry { reason, .. }) => {
                warn!(connector = %connector, entry = %entry.id, %reason, "skipping corrupt entry");
                self.lock_retries()?.forget(&entry.id);
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(
            self.settings.delivery_timeout,
            self.target.deliver(&entry, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::transient(format!(
                "delivery timed out after {:?}",
                self.settings.delivery_timeout
            ))),
        };

        // Retries are scheduled from the end of the attempt, not the pass
        let finished = chrono::Duration::from_std(started.elapsed())
            .ok()
            .and_then(|elapsed| now.checked_add_signed(elapsed))
            .unwrap_or(now);
        let transition = self.lock_retries()?.record(
            &self.settings.retry,
            self.settings.retention.archive_enabled,
            &entry.id,
            result.as_ref().map(|_| ()),
            finished,
        );
        if let Err(e) = &result {
            warn!(connector = %connector, entry = %entry.id, error = %e, "delivery failed");
        }
        self.apply(&entry, transition, finished)
    }

    fn apply(&self, entry: &CacheEntry, transition: Transition, now: DateTime<Utc>) -> CacheResult<Outcome> {
        let connector = self.cache.connector();
        let ids = [entry.id.clone()];
        match transition {
            Transition::Archive => match self.cache.move_entries(&ids, Tier::Cache, Tier::Archive) {
                Ok(_) => Ok(Outcome::Archived),
                Err(CacheError::CacheFull { .. }) => {
                    warn!(connector = %connector, entry = %entry.id, "archive full, delivered entry removed");
                    self.cache.remove(Tier::Cache, &ids)?;
                    Ok(Outcome::Deleted)
                }
                Err(e) => Err(e),
            },
            Transition::Delete => {
                self.cache.remove(Tier::Cache, &ids)?;
                Ok(Outcome::Deleted)
            }
            Transition::Retry(state) => {
                debug!(
                    connector = %connector,
                    entry = %entry.id,
                    attempts = state.attempts,
                    next_retry_at = %state.next_retry_at,
                    "delivery retry scheduled"
                );
                Ok(Outcome::Retrying)
            }
            Transition::Error => match self.cache.move_entries(&ids, Tier::Cache, Tier::Error) {
                Ok(_) => {
                    error!(connector = %connector, entry = %entry.id, "entry moved to error tier");
                    Ok(Outcome::Errored)
                }
                Err(CacheError::CacheFull { .. }) => {
                    warn!(connector = %connector, entry = %entry.id, "error tier full, entry kept in cache");
                    self.lock_retries()?.postpone(&self.settings.retry, &entry.id, now);
                    Ok(Outcome::Retrying)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Apply the retention policy to the archive and error tiers
    pub fn sweep(&self, now: DateTime<Utc>) -> CacheResult<SweepReport> {
        sweep(&self.cache, &self.settings.retention, now)
    }

    /// Deliver until cancelled.
    ///
    /// Returns the first cache error; the caller treats the connector as
    /// unhealthy. On cancellation a pass in progress gets `shutdown_timeout`
    /// to finish; an abandoned delivery leaves its entry in cache.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> CacheResult<()> {
        let connector = self.cache.connector().clone();
        info!(connector = %connector, concurrency = self.settings.concurrency, "delivery loop started");

        let mut cleanup = tokio::time::interval(self.settings.cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = cleanup.tick() => {
                    self.sweep(Utc::now())?;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.idle_poll) => {}
            }

            let pass = self.run_once(Utc::now());
            tokio::pin!(pass);
            tokio::select! {
                biased;
                result = &mut pass => {
                    result?;
                }
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(self.settings.shutdown_timeout, &mut pass).await {
                        Ok(result) => {
                            result?;
                        }
                        Err(_) => warn!(
                            connector = %connector,
                            timeout = ?self.settings.shutdown_timeout,
                            "delivery pass abandoned at shutdown"
                        ),
                    }
                    break;
                }
            }
        }

        info!(connector = %connector, "delivery loop stopped");
        Ok(())
    }
}
