//! Retry bookkeeping and the cache tier state machine
//!
//! ```text
//! cache --success------------------> archive (archiving enabled) | deleted
//! cache --failure, attempts < max--> cache (attempts += 1, retry later)
//! cache --failure, attempts >= max-> error
//! cache --permanent failure--------> error
//! ```

use super::error::DeliveryError;
use crate::cache::EntryId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// How failed deliveries are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an entry goes to the error tier
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::seconds(5),
        }
    }
}

/// Saturates at the latest representable instant
fn retry_at(now: DateTime<Utc>, policy: &RetryPolicy) -> DateTime<Utc> {
    now.checked_add_signed(policy.retry_interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry bookkeeping of one entry still in the cache tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub entry_id: EntryId,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Where an entry goes after a delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Archive,
    Delete,
    /// Stays in cache until `next_retry_at`
    Retry(RetryState),
    Error,
}

/// Decide the transition following a delivery attempt.
///
/// `previous` is the entry's state before this attempt, `None` on a first
/// attempt.
pub fn next_transition(
    policy: &RetryPolicy,
    archive_enabled: bool,
    entry_id: &EntryId,
    previous: Option<&RetryState>,
    outcome: Result<(), &DeliveryError>,
    now: DateTime<Utc>,
) -> Transition {
    let error = match outcome {
        Ok(()) if archive_enabled => return Transition::Archive,
        Ok(()) => return Transition::Delete,
        Err(error) => error,
    };
    if error.is_permanent() {
        return Transition::Error;
    }

    let attempts = previous.map_or(0, |state| state.attempts) + 1;
    if attempts >= policy.max_retries {
        return Transition::Error;
    }
    Transition::Retry(RetryState {
        entry_id: entry_id.clone(),
        attempts,
        next_retry_at: retry_at(now, policy),
    })
}

/// Retry states of a connector's pending entries
#[derive(Debug, Default)]
pub struct RetryTracker {
    states: HashMap<EntryId, RetryState>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntryId) -> Option<&RetryState> {
        self.states.get(id)
    }

    /// True if the entry has never failed or its retry time has come
    pub fn is_eligible(&self, id: &EntryId, now: DateTime<Utc>) -> bool {
        self.states
            .get(id)
            .map_or(true, |state| state.next_retry_at <= now)
    }

    /// Record the outcome of an attempt and return the resulting transition.
    ///
    /// The entry's state is kept only while it stays in the cache tier.
    pub fn record(
        &mut self,
        policy: &RetryPolicy,
        archive_enabled: bool,
        id: &EntryId,
        outcome: Result<(), &DeliveryError>,
        now: DateTime<Utc>,
    ) -> Transition {
        let transition = next_transition(
            policy,
            archive_enabled,
            id,
            self.states.get(id),
            outcome,
            now,
        );
        match &transition {
            Transition::Retry(state) => {
                self.states.insert(id.clone(), state.clone());
            }
            _ => {
                self.states.remove(id);
            }
        }
        transition
    }

    /// Keep an entry in cache and try again after `retry_interval`, without
    /// counting an attempt.
    pub fn postpone(&mut self, policy: &RetryPolicy, id: &EntryId, now: DateTime<Utc>) {
        let attempts = self.states.get(id).map_or(0, |state| state.attempts);
        self.states.insert(
            id.clone(),
            RetryState {
                entry_id: id.clone(),
                attempts,
                next_retry_at: retry_at(now, policy),
            },
        );
    }

    pub fn forget(&mut self, id: &EntryId) {
        self.states.remove(id);
    }

    /// Drop states of entries that left the cache tier by other means
    pub fn retain_pending(&mut self, pending: &[EntryId]) {
        self.states.retain(|id, _| pending.contains(id));
    }

    /// Scheduled retries, soonest first
    pub fn scheduled(&self) -> Vec<RetryState> {
        let mut states: Vec<_> = self.states.values().cloned().collect();
        states.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 16, 12, 0, 0).unwrap()
    }

    fn id() -> EntryId {
        EntryId::parse("entry1").unwrap()
    }

    #[test]
    fn success_archives_or_deletes() {
        let policy = RetryPolicy::default();
        assert_eq!(
            next_transition(&policy, true, &id(), None, Ok(()), now()),
            Transition::Archive
        );
        assert_eq!(
            next_transition(&policy, false, &id(), None, Ok(()), now()),
            Transition::Delete
        );
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let policy = RetryPolicy::default();
        let error = DeliveryError::permanent("bad payload");
        assert_eq!(
            next_transition(&policy, true, &id(), None, Err(&error), now()),
            Transition::Error
        );
    }

    #[test]
    fn third_failure_exhausts_three_retries() {
        let policy = RetryPolicy::default();
        let error = DeliveryError::transient("timeout");
        let mut tracker = RetryTracker::new();

        let first = tracker.record(&policy, true, &id(), Err(&error), now());
        let Transition::Retry(state) = first.clone() else {
            panic!("expected retry, got {:?}", first);
        };
        assert_eq!(state.attempts, 1);
        assert_eq!(state.next_retry_at, now() + Duration::seconds(5));
        assert!(!tracker.is_eligible(&id(), now()));
        assert!(tracker.is_eligible(&id(), state.next_retry_at));

        assert!(matches!(
            tracker.record(&policy, true, &id(), Err(&error), now()),
            Transition::Retry(RetryState { attempts: 2, .. })
        ));
        assert_eq!(
            tracker.record(&policy, true, &id(), Err(&error), now()),
            Transition::Error
        );
        assert!(tracker.scheduled().is_empty());
    }

    #[test]
    fn postpone_keeps_attempt_count() {
        let policy = RetryPolicy::default();
        let mut tracker = RetryTracker::new();
        tracker.record(&policy, true, &id(), Err(&DeliveryError::transient("x")), now());
        tracker.postpone(&policy, &id(), now() + Duration::seconds(5));

        let state = tracker.get(&id()).unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.next_retry_at, now() + Duration::seconds(10));
    }

    #[test]
    fn huge_interval_saturates() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_interval: Duration::milliseconds(i64::MAX),
        };
        let error = DeliveryError::transient("down");
        let Transition::Retry(state) = next_transition(&policy, true, &id(), None, Err(&error), now())
        else {
            panic!("expected retry");
        };
        assert_eq!(state.next_retry_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn retain_pending_drops_departed_entries() {
        let policy = RetryPolicy::default();
        let mut tracker = RetryTracker::new();
        tracker.record(&policy, true, &id(), Err(&DeliveryError::transient("x")), now());
        tracker.retain_pending(&[]);
        assert!(tracker.scheduled().is_empty());
    }
}
