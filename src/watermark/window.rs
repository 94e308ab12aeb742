//! Fetch windows derived from watermarks
//!
//! The scheduler triggers a run; the extraction task asks for the window
//! `[last, min(now, last + max_read_interval)]` and advances the watermark
//! once the window has been read. Long catch-up ranges can be split into
//! consecutive sub-intervals so one query never spans more than
//! `max_read_interval`.

use super::traits::{WatermarkResult, WatermarkStore};
use crate::ids::{ConnectorId, ItemId, ScanModeId};
use chrono::{DateTime, Duration, Utc};

/// An extraction range from `start` to `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// The next window after `last`, capped at `now`.
    ///
    /// `max_read_interval = None` (or a non-positive value) means unbounded.
    /// Returns `None` when `last` has already caught up with `now`.
    pub fn next(
        last: DateTime<Utc>,
        now: DateTime<Utc>,
        max_read_interval: Option<Duration>,
    ) -> Option<Self> {
        if last >= now {
            return None;
        }
        let end = match max_read_interval.filter(|d| *d > Duration::zero()) {
            Some(interval) => last
                .checked_add_signed(interval)
                .map_or(now, |capped| capped.min(now)),
            None => now,
        };
        Some(Self { start: last, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Split `[start, end]` into consecutive windows of at most `max_read_interval`.
///
/// A non-positive interval yields the whole range as one window; an empty
/// or inverted range yields nothing.
pub fn split_intervals(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_read_interval: Duration,
) -> Vec<FetchWindow> {
    if start >= end {
        return Vec::new();
    }
    if max_read_interval <= Duration::zero() {
        return vec![FetchWindow { start, end }];
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor
            .checked_add_signed(max_read_interval)
            .map_or(end, |t| t.min(end));
        windows.push(FetchWindow { start: cursor, end: next });
        cursor = next;
    }
    windows
}

/// Resolve the next window for an item, honouring the connector's granularity.
///
/// Per-item connectors read the item's own cursor; aggregate connectors read
/// the scan mode's `"all"` cursor. Without a stored cursor the window starts
/// at `default_start`.
pub fn next_fetch_window(
    store: &dyn WatermarkStore,
    connector: &ConnectorId,
    scan_mode: &ScanModeId,
    item: &ItemId,
    default_start: DateTime<Utc>,
    now: DateTime<Utc>,
    max_read_interval: Option<Duration>,
) -> WatermarkResult<Option<FetchWindow>> {
    let scope = if store.granularity(connector)?.is_per_item() {
        Some(item)
    } else {
        None
    };
    let last = store
        .get(connector, scan_mode, scope)?
        .unwrap_or(default_start);
    Ok(FetchWindow::next(last, now, max_read_interval))
}
