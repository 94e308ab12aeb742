//! Cache entry, tier and search types

use crate::ids::ConnectorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The write or move would push a tier past its size limit.
    #[error("Cache full for connector {connector} ({tier}): {requested} bytes requested, {available} available")]
    CacheFull {
        connector: ConnectorId,
        tier: Tier,
        requested: u64,
        available: u64,
    },

    #[error("Corrupt entry {id} in {tier}: {reason}")]
    CorruptEntry { tier: Tier, id: String, reason: String },

    #[error("Entry {id} not found in {tier}")]
    EntryNotFound { tier: Tier, id: EntryId },

    #[error("Invalid entry id: {0:?}")]
    InvalidEntryId(String),

    #[error("Connector id {0:?} cannot name a cache directory")]
    InvalidConnectorId(String),

    #[error("Unknown tier: {0:?}")]
    UnknownTier(String),

    #[error("Cache index lock poisoned")]
    LockPoisoned,
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Storage tier of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Pending delivery
    Cache,
    /// Delivered and retained
    Archive,
    /// Permanently failed
    Error,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Cache, Tier::Archive, Tier::Error];

    /// Directory name of the tier under a connector's cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Archive => "archive",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Tier {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cache" => Ok(Self::Cache),
            "archive" => Ok(Self::Archive),
            "error" => Ok(Self::Error),
            _ => Err(CacheError::UnknownTier(s.to_string())),
        }
    }
}

/// True if `name` is usable as a single path segment (`[A-Za-z0-9_-]+`)
pub(crate) fn is_safe_segment(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Identifier of a cache entry, also the base name of its files.
///
/// Only `[A-Za-z0-9_-]` is accepted so an id can never name a path outside
/// its tier directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// New time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn parse(raw: impl Into<String>) -> CacheResult<Self> {
        let raw = raw.into();
        if is_safe_segment(&raw) {
            Ok(Self(raw))
        } else {
            Err(CacheError::InvalidEntryId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntryId {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of payload held by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// JSON array of time values assembled into a batch
    TimeValues,
    /// Opaque file content
    Any,
}

/// What the producer supplies when writing an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub content_type: ContentType,
    pub item_count: Option<u64>,
    pub source_name: Option<String>,
}

impl EntryMetadata {
    pub fn time_values(count: usize) -> Self {
        Self {
            content_type: ContentType::TimeValues,
            item_count: Some(count as u64),
            source_name: None,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Any,
            item_count: None,
            source_name: Some(name.into()),
        }
    }
}

/// Sidecar metadata persisted next to each payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub created_at: DateTime<Utc>,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub content_size: u64,
}

/// An entry as seen through the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: EntryId,
    pub connector: ConnectorId,
    pub tier: Tier,
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    /// Display name used by `name_contains` searches
    pub fn name(&self) -> &str {
        self.metadata
            .source_name
            .as_deref()
            .unwrap_or_else(|| self.id.as_str())
    }
}

/// An entry whose payload and metadata disagree on disk.
///
/// Flagged entries are excluded from searches and left on disk for an
/// operator to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    pub tier: Tier,
    pub base_name: String,
    pub reason: String,
}

/// Filter criteria for searching a tier
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Inclusive lower bound on `created_at`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub end: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the entry name
    pub name_contains: Option<String>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_name(mut self, name_contains: impl Into<String>) -> Self {
        self.name_contains = Some(name_contains.into());
        self
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        let created = entry.metadata.created_at;
        if self.start.is_some_and(|start| created < start) {
            return false;
        }
        if self.end.is_some_and(|end| created > end) {
            return false;
        }
        match &self.name_contains {
            Some(needle) => entry
                .name()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Maximum total payload bytes per tier; `None` is unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierLimits {
    pub cache: Option<u64>,
    pub archive: Option<u64>,
    pub error: Option<u64>,
}

impl TierLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn for_tier(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Cache => self.cache,
            Tier::Archive => self.archive,
            Tier::Error => self.error,
        }
    }
}

/// Entry count and payload bytes of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Per-tier statistics of a connector cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cache: TierStats,
    pub archive: TierStats,
    pub error: TierStats,
    pub corrupt: usize,
}

impl CacheStats {
    pub fn tier(&self, tier: Tier) -> TierStats {
        match tier {
            Tier::Cache => self.cache,
            Tier::Archive => self.archive,
            Tier::Error => self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: Option<&str>, hour: u32) -> CacheEntry {
        CacheEntry {
            id: EntryId::parse("0190abc").unwrap(),
            connector: ConnectorId::from("north1"),
            tier: Tier::Cache,
            metadata: CacheMetadata {
                created_at: Utc.with_ymd_and_hms(2024, 2, 16, hour, 0, 0).unwrap(),
                content_type: ContentType::Any,
                item_count: None,
                source_name: name.map(str::to_string),
                content_size: 0,
            },
        }
    }

    #[test]
    fn entry_id_rejects_path_segments() {
        assert!(EntryId::parse("../etc/passwd").is_err());
        assert!(EntryId::parse("a/b").is_err());
        assert!(EntryId::parse("").is_err());
        assert!(EntryId::parse("0190-abc_DEF").is_ok());
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = EntryId::generate();
        assert!(EntryId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Archive".parse::<Tier>().unwrap(), Tier::Archive);
        assert!("trash".parse::<Tier>().is_err());
    }

    #[test]
    fn search_range_is_inclusive() {
        let at = |h| Utc.with_ymd_and_hms(2024, 2, 16, h, 0, 0).unwrap();
        let params = SearchParams::new().with_start(at(10)).with_end(at(12));
        assert!(params.matches(&entry(None, 10)));
        assert!(params.matches(&entry(None, 12)));
        assert!(!params.matches(&entry(None, 13)));
    }

    #[test]
    fn name_match_is_case_insensitive_and_falls_back_to_id() {
        let params = SearchParams::new().with_name("REPORT");
        assert!(params.matches(&entry(Some("daily-report.csv"), 1)));
        assert!(!params.matches(&entry(Some("values.json"), 1)));
        assert!(SearchParams::new().with_name("abc").matches(&entry(None, 1)));
    }
}
