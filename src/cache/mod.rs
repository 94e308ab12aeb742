//! Durable content cache for north connectors
//!
//! Each north connector owns one [`ContentCache`] with three tiers:
//! - `cache`: content waiting to be delivered
//! - `archive`: delivered content kept for the retention period
//! - `error`: content that failed permanently or exhausted its retries

mod store;
mod types;

pub use store::ContentCache;
pub(crate) use types::is_safe_segment;
pub use types::{
    CacheEntry, CacheError, CacheMetadata, CacheResult, CacheStats, ContentType, CorruptEntry,
    EntryId, EntryMetadata, SearchParams, Tier, TierLimits, TierStats,
};
