//! Sluice: crash-safe cache and watermark core of a data-collection gateway
//!
//! Sits between source connectors that extract time series and files from
//! industrial systems and target connectors that deliver them onward.
//!
//! # Core Concepts
//!
//! - **Watermarks**: per (connector, scan mode, item | `"all"`) cursors
//!   recording how much history was already extracted, reconciled across
//!   configuration changes
//! - **Content cache**: per-connector `cache`/`archive`/`error` tiers holding
//!   payloads until a target confirms receipt
//! - **Delivery**: the retry and tier-transition loop feeding a target
//! - **Batching**: groups values into cache entries by count or interval
//!
//! # Example
//!
//! ```
//! use sluice::{ConnectorId, OpenStore, ScanModeId, SqliteWatermarkStore, WatermarkStore};
//!
//! let store = SqliteWatermarkStore::open_in_memory().unwrap();
//! let south = ConnectorId::from("south1");
//! assert!(store.get(&south, &ScanModeId::from("every_10s"), None).unwrap().is_none());
//! ```

pub mod batch;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod delivery;
pub mod gateway;
pub mod ids;
pub mod logging;
pub mod watermark;

pub use batch::{BatchAssembler, BatchSettings, TimeValue};
pub use cache::{
    CacheEntry, CacheError, CacheResult, ContentCache, EntryId, EntryMetadata, SearchParams, Tier,
    TierLimits,
};
pub use cancel::CancellationToken;
pub use config::{ConfigError, GatewayConfig};
pub use delivery::{DeliveryEngine, DeliveryError, DeliverySettings, DeliveryTarget};
pub use gateway::{ConnectorHealth, Gateway, GatewayError, GatewayResult};
pub use ids::{ConnectorId, ItemId, ItemScope, ScanModeId};
pub use watermark::{
    FetchWindow, Granularity, ItemAssignment, OpenStore, SqliteWatermarkStore, WatermarkError,
    WatermarkResult, WatermarkStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
