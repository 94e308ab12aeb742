//! Gateway configuration
//!
//! Loaded once from YAML and validated before any connector starts. South
//! connector settings are a closed tagged union keyed by `type`, versioned
//! through `settings_version`.

use crate::batch::BatchSettings;
use crate::cache::{is_safe_segment, TierLimits};
use crate::delivery::{DeliverySettings, RetentionPolicy, RetryPolicy};
use crate::ids::{ConnectorId, ItemId, ScanModeId};
use crate::watermark::{Granularity, ItemAssignment};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Highest south settings layout this build understands
pub const SETTINGS_VERSION: u32 = 1;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Connector {connector} uses unsupported settings version {version}")]
    UnsupportedSettingsVersion { connector: ConnectorId, version: u32 },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

fn default_settings_version() -> u32 {
    SETTINGS_VERSION
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root of the watermark database and connector caches
    pub data_dir: PathBuf,
    #[serde(default)]
    pub scan_modes: Vec<ScanModeConfig>,
    #[serde(default)]
    pub south: Vec<SouthConfig>,
    #[serde(default)]
    pub north: Vec<NorthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanModeConfig {
    pub id: ScanModeId,
    pub name: String,
    /// Cron expression, interpreted by the external scheduler
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SouthConfig {
    pub id: ConnectorId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settings_version")]
    pub settings_version: u32,
    pub settings: SouthSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

/// Protocol settings of a south connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SouthSettings {
    Opcua(OpcuaSettings),
    Modbus(ModbusSettings),
    Mqtt(MqttSettings),
    Sql(SqlSettings),
}

impl SouthSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Opcua(_) => "opcua",
            Self::Modbus(_) => "modbus",
            Self::Mqtt(_) => "mqtt",
            Self::Sql(_) => "sql",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Opcua(s) if !s.url.starts_with("opc.tcp://") => {
                Err(format!("OPCUA url {:?} must start with opc.tcp://", s.url))
            }
            Self::Modbus(s) if s.host.is_empty() => Err("Modbus host is empty".to_string()),
            Self::Modbus(s) if s.port == 0 => Err("Modbus port must be non-zero".to_string()),
            Self::Mqtt(s) if s.qos > 2 => Err(format!("MQTT qos {} is not 0, 1 or 2", s.qos)),
            Self::Sql(s) if s.query.trim().is_empty() => Err("SQL query is empty".to_string()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcuaSettings {
    pub url: String,
    #[serde(default)]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
}

fn default_slave_id() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    pub url: String,
    #[serde(default)]
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlSettings {
    pub driver: String,
    pub connection: String,
    pub query: String,
}

/// History extraction settings of a south connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Keep one watermark per item instead of one per scan mode
    pub max_instant_per_item: bool,
    /// Longest range a single query may cover; 0 is unbounded
    pub max_read_interval_secs: u64,
    pub read_delay_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_instant_per_item: false,
            max_read_interval_secs: 0,
            read_delay_ms: 200,
        }
    }
}

impl HistorySettings {
    pub fn granularity(&self) -> Granularity {
        Granularity::from_per_item(self.max_instant_per_item)
    }

    pub fn max_read_interval(&self) -> Option<chrono::Duration> {
        match self.max_read_interval_secs {
            0 => None,
            secs => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
                Some(chrono::Duration::seconds(secs))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub id: ItemId,
    pub name: String,
    pub scan_mode: ScanModeId,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NorthConfig {
    pub id: ConnectorId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub caching: CachingConfig,
}

/// Cache, retry and batching settings of a north connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    /// Tier size limits in bytes; 0 is unlimited
    pub max_cache_size: u64,
    pub max_archive_size: u64,
    pub max_error_size: u64,
    pub retry_count: u32,
    pub retry_interval_ms: u64,
    pub delivery_concurrency: usize,
    pub delivery_timeout_ms: u64,
    pub archive: ArchiveConfig,
    /// 0 keeps errored content forever
    pub error_retention_hours: u64,
    pub batch: BatchConfig,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 0,
            max_archive_size: 0,
            max_error_size: 0,
            retry_count: 3,
            retry_interval_ms: 5_000,
            delivery_concurrency: 1,
            delivery_timeout_ms: 30_000,
            archive: ArchiveConfig::default(),
            error_retention_hours: 0,
            batch: BatchConfig::default(),
        }
    }
}

fn limit(bytes: u64) -> Option<u64> {
    Some(bytes).filter(|b| *b > 0)
}

fn hours(h: u64) -> chrono::Duration {
    let h = i64::try_from(h).unwrap_or(i64::MAX).min(i64::MAX / 3_600_000);
    chrono::Duration::hours(h)
}

impl CachingConfig {
    pub fn tier_limits(&self) -> TierLimits {
        TierLimits {
            cache: limit(self.max_cache_size),
            archive: limit(self.max_archive_size),
            error: limit(self.max_error_size),
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            retry: RetryPolicy {
                max_retries: self.retry_count,
                retry_interval: chrono::Duration::milliseconds(
                    i64::try_from(self.retry_interval_ms).unwrap_or(i64::MAX),
                ),
            },
            retention: RetentionPolicy {
                archive_enabled: self.archive.enabled,
                archive_retention: hours(self.archive.retention_hours),
                error_retention: hours(self.error_retention_hours),
            },
            concurrency: self.delivery_concurrency,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..DeliverySettings::default()
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            group_count: self.batch.group_count,
            max_send_count: self.batch.max_send_count,
            send_interval: Duration::from_millis(self.batch.send_interval_ms),
            send_file_immediately: self.batch.send_file_immediately,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    /// 0 keeps archived content forever
    pub retention_hours: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_hours: 72,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub group_count: usize,
    pub max_send_count: usize,
    pub send_interval_ms: u64,
    pub send_file_immediately: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let settings = BatchSettings::default();
        Self {
            group_count: settings.group_count,
            max_send_count: settings.max_send_count,
            send_interval_ms: u64::try_from(settings.send_interval.as_millis()).unwrap_or(u64::MAX),
            send_file_immediately: settings.send_file_immediately,
        }
    }
}

/// Default configuration file location (`<config dir>/sluice/gateway.yaml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sluice")
        .join("gateway.yaml")
}

impl GatewayConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Watermark database location
    pub fn watermark_db_path(&self) -> PathBuf {
        self.data_dir.join("watermarks.db")
    }

    /// Parent directory of every north connector cache
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn south(&self, id: &ConnectorId) -> Option<&SouthConfig> {
        self.south.iter().find(|s| &s.id == id)
    }

    pub fn south_mut(&mut self, id: &ConnectorId) -> Option<&mut SouthConfig> {
        self.south.iter_mut().find(|s| &s.id == id)
    }

    pub fn north(&self, id: &ConnectorId) -> Option<&NorthConfig> {
        self.north.iter().find(|n| &n.id == id)
    }

    /// Check every cross-reference and constraint
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut scan_modes = HashSet::new();
        for scan_mode in &self.scan_modes {
            if !scan_modes.insert(&scan_mode.id) {
                return invalid(format!("duplicate scan mode {}", scan_mode.id));
            }
        }

        let mut connectors = HashSet::new();
        let ids = self.south.iter().map(|s| &s.id).chain(self.north.iter().map(|n| &n.id));
        for id in ids {
            if id.as_str().is_empty() {
                return invalid("empty connector id".to_string());
            }
            if !connectors.insert(id) {
                return invalid(format!("duplicate connector id {}", id));
            }
        }

        for south in &self.south {
            south.validate(&scan_modes)?;
        }
        for north in &self.north {
            if north.caching.delivery_concurrency == 0 {
                return invalid(format!("north {}: delivery_concurrency must be at least 1", north.id));
            }
            if !is_safe_segment(north.id.as_str()) {
                return invalid(format!("north {}: id cannot name a cache directory", north.id));
            }
        }
        Ok(())
    }
}

impl SouthConfig {
    fn validate(&self, scan_modes: &HashSet<&ScanModeId>) -> ConfigResult<()> {
        if self.settings_version == 0 || self.settings_version > SETTINGS_VERSION {
            return Err(ConfigError::UnsupportedSettingsVersion {
                connector: self.id.clone(),
                version: self.settings_version,
            });
        }
        self.settings
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("south {}: {}", self.id, reason)))?;

        let mut items = HashSet::new();
        for item in &self.items {
            if item.id.is_reserved() {
                return Err(ConfigError::Invalid(format!(
                    "south {}: item id {:?} is reserved",
                    self.id,
                    item.id.as_str()
                )));
            }
            if !items.insert(&item.id) {
                return Err(ConfigError::Invalid(format!(
                    "south {}: duplicate item {}",
                    self.id, item.id
                )));
            }
            if !scan_modes.contains(&item.scan_mode) {
                return Err(ConfigError::Invalid(format!(
                    "south {}: item {} uses undeclared scan mode {}",
                    self.id, item.id, item.scan_mode
                )));
            }
        }
        Ok(())
    }

    /// Item to scan mode layout handed to watermark reconciliation
    pub fn assignments(&self) -> Vec<ItemAssignment> {
        self.items
            .iter()
            .map(|item| ItemAssignment::new(item.id.clone(), item.scan_mode.clone()))
            .collect()
    }

    pub fn item(&self, id: &ItemId) -> Option<&ItemConfig> {
        self.items.iter().find(|item| &item.id == id)
    }
}
