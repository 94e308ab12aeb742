//! Watermark store trait definitions

use crate::ids::{ConnectorId, ItemId, ItemScope, ScanModeId};
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during watermark operations
#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Watermark store lock poisoned")]
    LockPoisoned,

    /// Another writer holds the store while a reconciliation tries to begin.
    #[error("Reconciliation conflict on connector {0}")]
    ReconciliationConflict(ConnectorId),

    #[error("Granularity mismatch on connector {connector}: {reason}")]
    GranularityMismatch { connector: ConnectorId, reason: String },

    #[error("Item id \"all\" is reserved for aggregate watermarks")]
    ReservedItemId,
}

/// Result type for watermark operations
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// Cursor granularity of a connector.
///
/// The two forms are mutually exclusive: an aggregate connector holds at
/// most one `"all"` row per scan mode, a per-item connector holds only
/// item rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Aggregate,
    PerItem,
}

impl Granularity {
    pub fn from_per_item(per_item: bool) -> Self {
        if per_item {
            Self::PerItem
        } else {
            Self::Aggregate
        }
    }

    pub fn is_per_item(&self) -> bool {
        matches!(self, Self::PerItem)
    }
}

/// One persisted watermark row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkEntry {
    pub connector: ConnectorId,
    pub scan_mode: ScanModeId,
    pub item: ItemScope,
    pub max_instant: DateTime<Utc>,
}

/// Which scan mode an item is attached to, as seen by the configuration
/// after the mutation being reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAssignment {
    pub item: ItemId,
    pub scan_mode: ScanModeId,
}

impl ItemAssignment {
    pub fn new(item: impl Into<ItemId>, scan_mode: impl Into<ScanModeId>) -> Self {
        Self {
            item: item.into(),
            scan_mode: scan_mode.into(),
        }
    }
}

/// Trait for watermark storage backends
///
/// Implementations must be thread-safe (Send + Sync): every extraction task
/// of a connector shares one handle. Each reconciliation is a single atomic
/// transaction.
pub trait WatermarkStore: Send + Sync {
    /// Read the stored instant for a key. `item = None` reads the `"all"` row.
    fn get(
        &self,
        connector: &ConnectorId,
        scan_mode: &ScanModeId,
        item: Option<&ItemId>,
    ) -> WatermarkResult<Option<DateTime<Utc>>>;

    /// Move a cursor forward. Returns `false` (and changes nothing) when
    /// `instant` is not newer than the stored value.
    fn advance(
        &self,
        connector: &ConnectorId,
        scan_mode: &ScanModeId,
        item: Option<&ItemId>,
        instant: DateTime<Utc>,
    ) -> WatermarkResult<bool>;

    /// Active granularity of a connector (aggregate until toggled).
    fn granularity(&self, connector: &ConnectorId) -> WatermarkResult<Granularity>;

    /// All rows of a connector, ordered by scan mode then item
    fn list(&self, connector: &ConnectorId) -> WatermarkResult<Vec<WatermarkEntry>>;

    /// An item moved from `old_scan_mode` to `new_scan_mode`.
    ///
    /// `assignments` is the connector's item layout after the move.
    /// An existing cursor on the target scan mode is never overwritten.
    fn reconcile_item_scan_mode_changed(
        &self,
        connector: &ConnectorId,
        item: &ItemId,
        old_scan_mode: &ScanModeId,
        new_scan_mode: &ScanModeId,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<()>;

    /// An item was deleted. `assignments` no longer contains it.
    /// Returns the number of rows removed.
    fn reconcile_item_removed(
        &self,
        connector: &ConnectorId,
        item: &ItemId,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<usize>;

    /// Drop every row and the granularity record of a connector.
    fn reconcile_connector_removed(&self, connector: &ConnectorId) -> WatermarkResult<usize>;

    /// Switch a connector between aggregate and per-item cursors.
    ///
    /// Enabling splits each `"all"` row into one row per assigned item;
    /// disabling collapses each scan mode's item rows into one `"all"` row
    /// holding the maximum instant.
    fn reconcile_granularity_toggled(
        &self,
        connector: &ConnectorId,
        enable_per_item: bool,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: WatermarkStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> WatermarkResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> WatermarkResult<Self>;
}
