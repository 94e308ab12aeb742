//! Watermark store: per-item and per-scan-mode extraction cursors
//!
//! The store persists, per (connector, scan mode, item | "all"), the most
//! recent instant known to be extracted, and reconciles those rows when the
//! configuration changes. `SqliteWatermarkStore` is the persistent backend.

mod sqlite;
mod traits;
mod window;

pub use sqlite::SqliteWatermarkStore;
pub use traits::{
    Granularity, ItemAssignment, OpenStore, WatermarkEntry, WatermarkError, WatermarkResult,
    WatermarkStore,
};
pub use window::{next_fetch_window, split_intervals, FetchWindow};
