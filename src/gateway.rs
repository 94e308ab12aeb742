//! Transport-independent gateway facade.
//!
//! `Gateway` is the single entry point for everything outside the core:
//! extraction tasks record watermarks and hand over values and files, the
//! admin surface searches and moves cache content, and configuration
//! mutations reconcile watermark state. Transports never reach into the
//! watermark store or a connector cache directly.

use crate::batch::{BatchAssembler, TimeValue};
use crate::cache::{
    CacheEntry, CacheError, CacheStats, ContentCache, EntryId, SearchParams, Tier,
};
use crate::cancel::CancellationToken;
use crate::config::{ConfigError, GatewayConfig, SouthConfig};
use crate::delivery::{DeliveryEngine, DeliveryTarget};
use crate::ids::{ConnectorId, ItemId, ScanModeId};
use crate::watermark::{
    next_fetch_window, FetchWindow, Granularity, OpenStore, SqliteWatermarkStore, WatermarkEntry,
    WatermarkError, WatermarkStore,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors surfaced to gateway callers
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown connector: {0}")]
    UnknownConnector(ConnectorId),

    #[error("Unknown item {item} on connector {connector}")]
    UnknownItem { connector: ConnectorId, item: ItemId },

    #[error("Connector {connector} is unhealthy: {reason}")]
    Unhealthy { connector: ConnectorId, reason: String },

    #[error("Connector {0} is already running")]
    AlreadyRunning(ConnectorId),

    #[error("Gateway configuration lock poisoned")]
    LockPoisoned,
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Health of a north connector
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectorHealth {
    #[default]
    Healthy,
    /// Stopped after a failure it cannot recover from on its own
    Unhealthy(String),
}

struct RunningTasks {
    cancel: CancellationToken,
    delivery: JoinHandle<()>,
    batch: JoinHandle<()>,
}

/// Cache, batching and delivery of one north connector
pub struct NorthRuntime {
    id: ConnectorId,
    cache: Arc<ContentCache>,
    batch: Arc<BatchAssembler>,
    engine: Arc<DeliveryEngine>,
    health: Mutex<ConnectorHealth>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl NorthRuntime {
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    pub fn batch(&self) -> &Arc<BatchAssembler> {
        &self.batch
    }

    pub fn health(&self) -> ConnectorHealth {
        self.health
            .lock()
            .map(|health| health.clone())
            .unwrap_or_else(|_| ConnectorHealth::Unhealthy("health lock poisoned".to_string()))
    }

    fn ensure_healthy(&self) -> GatewayResult<()> {
        match self.health() {
            ConnectorHealth::Healthy => Ok(()),
            ConnectorHealth::Unhealthy(reason) => Err(GatewayError::Unhealthy {
                connector: self.id.clone(),
                reason,
            }),
        }
    }

    /// Flag the connector unhealthy and signal its tasks to stop
    fn fail(&self, reason: String) {
        error!(connector = %self.id, %reason, "connector stopped");
        if let Ok(mut health) = self.health.lock() {
            *health = ConnectorHealth::Unhealthy(reason);
        }
        if let Ok(tasks) = self.tasks.lock() {
            if let Some(tasks) = tasks.as_ref() {
                tasks.cancel.cancel();
            }
        }
    }

    /// Cache I/O failures stop the connector; everything else is the caller's
    fn check<T>(&self, result: Result<T, CacheError>) -> GatewayResult<T> {
        if let Err(CacheError::Io(e)) = &result {
            self.fail(format!("cache write failed: {}", e));
        }
        Ok(result?)
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.is_some())
            .unwrap_or(false)
    }
}

/// Single entry point for extraction tasks and admin operations.
pub struct Gateway {
    config: RwLock<GatewayConfig>,
    watermarks: Arc<dyn WatermarkStore>,
    north: DashMap<ConnectorId, Arc<NorthRuntime>>,
}

impl Gateway {
    /// Create a gateway over an existing watermark store.
    ///
    /// The configured granularity of every south connector is applied to the
    /// store, so a setting changed while the gateway was down is reconciled
    /// before any extraction runs.
    pub fn new(config: GatewayConfig, watermarks: Arc<dyn WatermarkStore>) -> GatewayResult<Self> {
        config.validate()?;
        for south in &config.south {
            let wanted = south.history.granularity();
            if watermarks.granularity(&south.id)? != wanted {
                warn!(connector = %south.id, per_item = wanted.is_per_item(), "reconciling watermark granularity with configuration");
                watermarks.reconcile_granularity_toggled(
                    &south.id,
                    wanted.is_per_item(),
                    &south.assignments(),
                )?;
            }
        }
        Ok(Self {
            config: RwLock::new(config),
            watermarks,
            north: DashMap::new(),
        })
    }

    /// Open the watermark database under the configured data directory.
    pub fn open(config: GatewayConfig) -> GatewayResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(WatermarkError::from)?;
        let store = SqliteWatermarkStore::open(config.watermark_db_path())?;
        Self::new(config, Arc::new(store))
    }

    fn read_config(&self) -> GatewayResult<RwLockReadGuard<'_, GatewayConfig>> {
        self.config.read().map_err(|_| GatewayError::LockPoisoned)
    }

    fn write_config(&self) -> GatewayResult<RwLockWriteGuard<'_, GatewayConfig>> {
        self.config.write().map_err(|_| GatewayError::LockPoisoned)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> GatewayResult<GatewayConfig> {
        Ok(self.read_config()?.clone())
    }

    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    // --- North connectors ---

    /// Open a north connector's cache and wire it to its delivery target.
    pub fn attach_north(
        &self,
        id: &ConnectorId,
        target: Arc<dyn DeliveryTarget>,
    ) -> GatewayResult<Arc<NorthRuntime>> {
        let (cache_dir, caching) = {
            let config = self.read_config()?;
            let north = config
                .north(id)
                .ok_or_else(|| GatewayError::UnknownConnector(id.clone()))?;
            (config.cache_dir(), north.caching.clone())
        };

        let cache = Arc::new(ContentCache::open(cache_dir, id.clone(), caching.tier_limits())?);
        let engine = Arc::new(DeliveryEngine::new(
            Arc::clone(&cache),
            target,
            caching.delivery_settings(),
        ));
        let batch = Arc::new(
            BatchAssembler::new(Arc::clone(&cache), caching.batch_settings())
                .with_flush_hook(engine.waker()),
        );
        let runtime = Arc::new(NorthRuntime {
            id: id.clone(),
            cache,
            batch,
            engine,
            health: Mutex::new(ConnectorHealth::Healthy),
            tasks: Mutex::new(None),
        });
        self.north.insert(id.clone(), Arc::clone(&runtime));
        info!(connector = %id, "north connector attached");
        Ok(runtime)
    }

    pub fn north(&self, id: &ConnectorId) -> GatewayResult<Arc<NorthRuntime>> {
        self.north
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| GatewayError::UnknownConnector(id.clone()))
    }

    pub fn north_ids(&self) -> Vec<ConnectorId> {
        let mut ids: Vec<_> = self.north.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn health(&self, id: &ConnectorId) -> GatewayResult<ConnectorHealth> {
        Ok(self.north(id)?.health())
    }

    /// Spawn the delivery and batching loops of a north connector.
    pub fn start_north(&self, id: &ConnectorId) -> GatewayResult<()> {
        let runtime = self.north(id)?;
        runtime.ensure_healthy()?;
        let mut tasks = runtime.tasks.lock().map_err(|_| GatewayError::LockPoisoned)?;
        if tasks.is_some() {
            return Err(GatewayError::AlreadyRunning(id.clone()));
        }

        let cancel = CancellationToken::new();
        let delivery = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = Arc::clone(&runtime.engine).run(cancel).await {
                    runtime.fail(format!("delivery loop failed: {}", e));
                }
            })
        };
        let batch = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = Arc::clone(&runtime.batch).run(cancel).await {
                    runtime.fail(format!("batch flush failed: {}", e));
                }
            })
        };
        *tasks = Some(RunningTasks {
            cancel,
            delivery,
            batch,
        });
        info!(connector = %id, "north connector started");
        Ok(())
    }

    /// Stop a north connector, giving its loops `timeout` to wind down.
    ///
    /// Loops still running after `timeout` are aborted; an aborted delivery
    /// leaves its entry in the cache tier.
    pub async fn stop_north(&self, id: &ConnectorId, timeout: Duration) -> GatewayResult<()> {
        let runtime = self.north(id)?;
        let tasks = runtime
            .tasks
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?
            .take();
        let Some(tasks) = tasks else {
            return Ok(());
        };

        tasks.cancel.cancel();
        for (name, mut handle) in [("delivery", tasks.delivery), ("batch", tasks.batch)] {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(connector = %id, task = name, ?timeout, "task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(connector = %id, "north connector stopped");
        Ok(())
    }

    // --- Extraction side ---

    /// Buffer values for a north connector.
    pub fn ingest_values(&self, north: &ConnectorId, values: Vec<TimeValue>) -> GatewayResult<Vec<CacheEntry>> {
        let runtime = self.north(north)?;
        runtime.ensure_healthy()?;
        runtime.check(runtime.batch.add_values(values))
    }

    /// Hand a file to a north connector.
    pub fn ingest_file(&self, north: &ConnectorId, path: &Path) -> GatewayResult<Option<CacheEntry>> {
        let runtime = self.north(north)?;
        runtime.ensure_healthy()?;
        runtime.check(runtime.batch.add_file(path))
    }

    fn south_config(&self, id: &ConnectorId) -> GatewayResult<SouthConfig> {
        self.read_config()?
            .south(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownConnector(id.clone()))
    }

    /// Next extraction window of an item, honouring the connector's
    /// granularity and `max_read_interval`.
    pub fn fetch_window(
        &self,
        south: &ConnectorId,
        scan_mode: &ScanModeId,
        item: &ItemId,
        default_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GatewayResult<Option<FetchWindow>> {
        let config = self.south_config(south)?;
        Ok(next_fetch_window(
            self.watermarks.as_ref(),
            south,
            scan_mode,
            item,
            default_start,
            now,
            config.history.max_read_interval(),
        )?)
    }

    /// Record a completed extraction. The cursor key follows the
    /// connector's granularity. Returns whether the watermark moved.
    pub fn record_extraction(
        &self,
        south: &ConnectorId,
        scan_mode: &ScanModeId,
        item: &ItemId,
        instant: DateTime<Utc>,
    ) -> GatewayResult<bool> {
        let scope = match self.watermarks.granularity(south)? {
            Granularity::PerItem => Some(item),
            Granularity::Aggregate => None,
        };
        Ok(self.watermarks.advance(south, scan_mode, scope, instant)?)
    }

    pub fn list_watermarks(&self, south: &ConnectorId) -> GatewayResult<Vec<WatermarkEntry>> {
        Ok(self.watermarks.list(south)?)
    }

    // --- Configuration mutations ---
    //
    // Each mutation is applied to a copy of the configuration, reconciled in
    // the watermark store, then committed. A failed reconciliation leaves the
    // configuration unchanged.

    /// Move an item to another scan mode.
    pub fn move_item(
        &self,
        south: &ConnectorId,
        item: &ItemId,
        new_scan_mode: &ScanModeId,
    ) -> GatewayResult<()> {
        let mut config = self.write_config()?;
        let mut next = config.clone();
        let south_cfg = next
            .south_mut(south)
            .ok_or_else(|| GatewayError::UnknownConnector(south.clone()))?;
        let item_cfg = south_cfg
            .items
            .iter_mut()
            .find(|i| &i.id == item)
            .ok_or_else(|| GatewayError::UnknownItem {
                connector: south.clone(),
                item: item.clone(),
            })?;
        if &item_cfg.scan_mode == new_scan_mode {
            return Ok(());
        }
        let old_scan_mode = std::mem::replace(&mut item_cfg.scan_mode, new_scan_mode.clone());
        let assignments = south_cfg.assignments();
        next.validate()?;

        self.watermarks.reconcile_item_scan_mode_changed(
            south,
            item,
            &old_scan_mode,
            new_scan_mode,
            &assignments,
        )?;
        *config = next;
        info!(connector = %south, %item, from = %old_scan_mode, to = %new_scan_mode, "item moved");
        Ok(())
    }

    /// Delete an item and its cursor.
    pub fn remove_item(&self, south: &ConnectorId, item: &ItemId) -> GatewayResult<()> {
        let mut config = self.write_config()?;
        let mut next = config.clone();
        let south_cfg = next
            .south_mut(south)
            .ok_or_else(|| GatewayError::UnknownConnector(south.clone()))?;
        let before = south_cfg.items.len();
        south_cfg.items.retain(|i| &i.id != item);
        if south_cfg.items.len() == before {
            return Err(GatewayError::UnknownItem {
                connector: south.clone(),
                item: item.clone(),
            });
        }
        let assignments = south_cfg.assignments();

        let removed = self
            .watermarks
            .reconcile_item_removed(south, item, &assignments)?;
        *config = next;
        info!(connector = %south, %item, rows = removed, "item removed");
        Ok(())
    }

    /// Delete a south connector and all of its watermark state.
    pub fn remove_south(&self, south: &ConnectorId) -> GatewayResult<()> {
        let mut config = self.write_config()?;
        let mut next = config.clone();
        let before = next.south.len();
        next.south.retain(|s| &s.id != south);
        if next.south.len() == before {
            return Err(GatewayError::UnknownConnector(south.clone()));
        }

        let removed = self.watermarks.reconcile_connector_removed(south)?;
        *config = next;
        info!(connector = %south, rows = removed, "south connector removed");
        Ok(())
    }

    /// Switch a south connector between per-item and aggregate watermarks.
    pub fn set_per_item_granularity(&self, south: &ConnectorId, enable: bool) -> GatewayResult<()> {
        let mut config = self.write_config()?;
        let mut next = config.clone();
        let south_cfg = next
            .south_mut(south)
            .ok_or_else(|| GatewayError::UnknownConnector(south.clone()))?;
        south_cfg.history.max_instant_per_item = enable;
        let assignments = south_cfg.assignments();

        self.watermarks
            .reconcile_granularity_toggled(south, enable, &assignments)?;
        *config = next;
        info!(connector = %south, per_item = enable, "watermark granularity set");
        Ok(())
    }

    // --- Admin cache operations ---

    pub fn search(&self, north: &ConnectorId, tier: Tier, params: &SearchParams) -> GatewayResult<Vec<CacheEntry>> {
        Ok(self.north(north)?.cache.search(tier, params)?)
    }

    pub fn read_content(&self, north: &ConnectorId, tier: Tier, id: &EntryId) -> GatewayResult<File> {
        Ok(self.north(north)?.cache.read_content(tier, id)?)
    }

    pub fn move_entries(
        &self,
        north: &ConnectorId,
        ids: &[EntryId],
        from: Tier,
        to: Tier,
    ) -> GatewayResult<usize> {
        let runtime = self.north(north)?;
        let moved = runtime.cache.move_entries(ids, from, to)?;
        if moved > 0 && to == Tier::Cache {
            runtime.engine.notify();
        }
        Ok(moved)
    }

    pub fn move_all(&self, north: &ConnectorId, from: Tier, to: Tier) -> GatewayResult<usize> {
        let runtime = self.north(north)?;
        let moved = runtime.cache.move_all(from, to)?;
        if moved > 0 && to == Tier::Cache {
            runtime.engine.notify();
        }
        Ok(moved)
    }

    pub fn remove(&self, north: &ConnectorId, tier: Tier, ids: &[EntryId]) -> GatewayResult<usize> {
        Ok(self.north(north)?.cache.remove(tier, ids)?)
    }

    pub fn remove_all(&self, north: &ConnectorId, tier: Tier) -> GatewayResult<usize> {
        Ok(self.north(north)?.cache.remove_all(tier)?)
    }

    pub fn stats(&self, north: &ConnectorId) -> GatewayResult<CacheStats> {
        Ok(self.north(north)?.cache.stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryError;
    use crate::watermark::ItemAssignment;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NullTarget;

    #[async_trait]
    impl DeliveryTarget for NullTarget {
        async fn deliver(&self, _entry: &CacheEntry, _payload: Vec<u8>) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn config(data_dir: &Path, per_item: bool) -> GatewayConfig {
        let raw = format!(
            r#"
data_dir: {}
scan_modes:
  - {{ id: scan_prev, name: Previous, cron: "* * * * * *" }}
  - {{ id: scan_new, name: New, cron: "* * * * * *" }}
south:
  - id: south1
    name: Historian
    settings: {{ type: opcua, url: "opc.tcp://plc:4840" }}
    history: {{ max_instant_per_item: {} }}
    items:
      - {{ id: item1, name: One, scan_mode: scan_prev }}
      - {{ id: item2, name: Two, scan_mode: scan_prev }}
north:
  - id: north1
    name: Target
    caching: {{ batch: {{ group_count: 2 }} }}
"#,
            data_dir.display(),
            per_item
        );
        GatewayConfig::from_yaml_str(&raw).unwrap()
    }

    fn feb(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).unwrap()
    }

    fn ids() -> (ConnectorId, ScanModeId, ScanModeId) {
        (
            ConnectorId::from("south1"),
            ScanModeId::from("scan_prev"),
            ScanModeId::from("scan_new"),
        )
    }

    #[test]
    fn move_item_reconciles_and_commits_config() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), true)).unwrap();
        let (south, prev, new) = ids();
        let item1 = ItemId::from("item1");
        gateway.record_extraction(&south, &prev, &item1, feb(16)).unwrap();

        gateway.move_item(&south, &item1, &new).unwrap();

        assert_eq!(gateway.watermarks().get(&south, &new, Some(&item1)).unwrap(), Some(feb(16)));
        assert_eq!(gateway.watermarks().get(&south, &prev, Some(&item1)).unwrap(), None);
        let config = gateway.config().unwrap();
        assert_eq!(config.south(&south).unwrap().item(&item1).unwrap().scan_mode, new);
    }

    #[test]
    fn invalid_move_leaves_config_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), true)).unwrap();
        let (south, _, _) = ids();
        let item1 = ItemId::from("item1");

        let err = gateway
            .move_item(&south, &item1, &ScanModeId::from("undeclared"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        let config = gateway.config().unwrap();
        assert_eq!(
            config.south(&south).unwrap().assignments()[0],
            ItemAssignment::new("item1", "scan_prev")
        );
    }

    #[test]
    fn configured_granularity_is_applied_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), true)).unwrap();
        let (south, _, _) = ids();
        assert_eq!(gateway.watermarks().granularity(&south).unwrap(), Granularity::PerItem);

        gateway.set_per_item_granularity(&south, false).unwrap();
        assert_eq!(gateway.watermarks().granularity(&south).unwrap(), Granularity::Aggregate);
        assert!(!gateway.config().unwrap().south(&south).unwrap().history.max_instant_per_item);
    }

    #[test]
    fn aggregate_extraction_advances_all_row() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), false)).unwrap();
        let (south, prev, _) = ids();
        gateway
            .record_extraction(&south, &prev, &ItemId::from("item2"), feb(20))
            .unwrap();

        let window = gateway
            .fetch_window(&south, &prev, &ItemId::from("item1"), feb(1), feb(21))
            .unwrap()
            .unwrap();
        assert_eq!(window.start, feb(20));
    }

    #[test]
    fn unknown_connector_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), false)).unwrap();
        let err = gateway
            .search(&ConnectorId::from("north9"), Tier::Cache, &SearchParams::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownConnector(_)));
    }

    #[tokio::test]
    async fn ingest_then_start_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::open(config(dir.path(), false)).unwrap();
        let north = ConnectorId::from("north1");
        gateway.attach_north(&north, Arc::new(NullTarget)).unwrap();

        let values = (0..2)
            .map(|i| TimeValue::new("p", feb(16), serde_json::json!(i)))
            .collect();
        assert_eq!(gateway.ingest_values(&north, values).unwrap().len(), 1);

        gateway.start_north(&north).unwrap();
        assert!(matches!(gateway.start_north(&north), Err(GatewayError::AlreadyRunning(_))));
        for _ in 0..100 {
            if gateway.stats(&north).unwrap().cache.entries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gateway.stop_north(&north, Duration::from_secs(5)).await.unwrap();

        assert_eq!(gateway.stats(&north).unwrap().cache.entries, 0);
        assert_eq!(gateway.health(&north).unwrap(), ConnectorHealth::Healthy);
    }
}
