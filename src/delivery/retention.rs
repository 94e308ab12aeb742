//! Archive and error tier retention

use crate::cache::{CacheResult, ContentCache, EntryId, SearchParams, Tier};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// How long delivered and failed content is kept. A zero duration keeps
/// entries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub archive_enabled: bool,
    pub archive_retention: Duration,
    pub error_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            archive_enabled: false,
            archive_retention: Duration::hours(72),
            error_retention: Duration::zero(),
        }
    }
}

/// What one retention sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub archive_removed: usize,
    pub error_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.archive_removed + self.error_removed
    }
}

fn expired(
    cache: &ContentCache,
    tier: Tier,
    retention: Duration,
    now: DateTime<Utc>,
) -> CacheResult<Vec<EntryId>> {
    if retention <= Duration::zero() {
        return Ok(Vec::new());
    }
    Ok(cache
        .search(tier, &SearchParams::default())?
        .into_iter()
        .filter(|entry| now - entry.metadata.created_at > retention)
        .map(|entry| entry.id)
        .collect())
}

/// Remove archive and error entries older than their retention.
///
/// With archiving disabled the whole archive tier is cleared.
pub fn sweep(
    cache: &ContentCache,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> CacheResult<SweepReport> {
    let archive_removed = if policy.archive_enabled {
        let ids = expired(cache, Tier::Archive, policy.archive_retention, now)?;
        cache.remove(Tier::Archive, &ids)?
    } else {
        cache.remove_all(Tier::Archive)?
    };
    let ids = expired(cache, Tier::Error, policy.error_retention, now)?;
    let error_removed = cache.remove(Tier::Error, &ids)?;

    let report = SweepReport {
        archive_removed,
        error_removed,
    };
    if report.total() > 0 {
        info!(
            connector = %cache.connector(),
            archive = archive_removed,
            error = error_removed,
            "retention sweep removed entries"
        );
    } else {
        debug!(connector = %cache.connector(), "retention sweep found nothing to remove");
    }
    Ok(report)
}
