//! File-backed tiered content cache
//!
//! Layout under the cache base directory:
//!
//! ```text
//! <base>/<connector>/.staging/          writes in progress, never visible
//! <base>/<connector>/{cache,archive,error}/<id>.payload
//! <base>/<connector>/{cache,archive,error}/<id>.json    sidecar metadata
//! ```
//!
//! The metadata rename is the commit point: an entry is visible once its
//! sidecar sits next to its payload in a tier directory. The in-memory index
//! is rebuilt from a full directory scan at open and maintained under one
//! mutex afterwards, so every mutation of a connector's cache is serialized.

use super::types::{
    is_safe_segment, CacheEntry, CacheError, CacheMetadata, CacheResult, CacheStats,
    CorruptEntry, EntryId, EntryMetadata, SearchParams, Tier, TierLimits, TierStats,
};
use crate::ids::ConnectorId;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const PAYLOAD_EXT: &str = "payload";
const METADATA_EXT: &str = "json";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
struct Indexed {
    /// Arrival order within the connector
    seq: u64,
    metadata: CacheMetadata,
}

#[derive(Debug, Default)]
struct TierIndex {
    entries: HashMap<EntryId, Indexed>,
    bytes: u64,
}

impl TierIndex {
    fn put(&mut self, id: EntryId, indexed: Indexed) {
        self.bytes += indexed.metadata.content_size;
        if let Some(previous) = self.entries.insert(id, indexed) {
            self.bytes = self.bytes.saturating_sub(previous.metadata.content_size);
        }
    }

    fn take(&mut self, id: &EntryId) -> Option<Indexed> {
        let removed = self.entries.remove(id)?;
        self.bytes = self.bytes.saturating_sub(removed.metadata.content_size);
        Some(removed)
    }

    /// Entries in arrival order
    fn ordered(&self) -> Vec<(&EntryId, &Indexed)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, indexed)| indexed.seq);
        entries
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    cache: TierIndex,
    archive: TierIndex,
    error: TierIndex,
    next_seq: u64,
    corrupt: Vec<CorruptEntry>,
}

impl CacheIndex {
    fn tier(&self, tier: Tier) -> &TierIndex {
        match tier {
            Tier::Cache => &self.cache,
            Tier::Archive => &self.archive,
            Tier::Error => &self.error,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierIndex {
        match tier {
            Tier::Cache => &mut self.cache,
            Tier::Archive => &mut self.archive,
            Tier::Error => &mut self.error,
        }
    }

    fn insert(&mut self, tier: Tier, id: EntryId, metadata: CacheMetadata) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tier_mut(tier).put(id, Indexed { seq, metadata });
    }

    fn relocate(&mut self, id: &EntryId, from: Tier, to: Tier) {
        if let Some(indexed) = self.tier_mut(from).take(id) {
            self.tier_mut(to).put(id.clone(), indexed);
        }
    }

    fn flag(&mut self, tier: Tier, base_name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        error!(tier = %tier, entry = base_name, %reason, "corrupt cache entry");
        self.corrupt.push(CorruptEntry {
            tier,
            base_name: base_name.to_string(),
            reason,
        });
    }

    fn is_flagged(&self, tier: Tier, base_name: &str) -> bool {
        self.corrupt
            .iter()
            .any(|c| c.tier == tier && c.base_name == base_name)
    }
}

/// Base names found in one tier directory
#[derive(Debug, Default)]
struct TierListing {
    payloads: BTreeSet<String>,
    metadata: BTreeSet<String>,
}

impl TierListing {
    fn metadata_only(&self) -> Vec<String> {
        self.metadata.difference(&self.payloads).cloned().collect()
    }

    fn payload_only(&self) -> Vec<String> {
        self.payloads.difference(&self.metadata).cloned().collect()
    }
}

fn file_name(base: &str, ext: &str) -> String {
    format!("{}.{}", base, ext)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Durable per-connector cache with `cache`, `archive` and `error` tiers
#[derive(Debug)]
pub struct ContentCache {
    connector: ConnectorId,
    root: PathBuf,
    limits: TierLimits,
    index: Mutex<CacheIndex>,
}

impl ContentCache {
    /// Open (or create) the cache of `connector` under `base_dir`.
    ///
    /// Rebuilds the index from disk, finishing writes and moves that were
    /// interrupted between their two renames.
    pub fn open(
        base_dir: impl AsRef<Path>,
        connector: ConnectorId,
        limits: TierLimits,
    ) -> CacheResult<Self> {
        if !is_safe_segment(connector.as_str()) {
            return Err(CacheError::InvalidConnectorId(connector.to_string()));
        }
        let root = base_dir.as_ref().join(connector.as_str());
        for tier in Tier::ALL {
            fs::create_dir_all(root.join(tier.dir_name()))?;
        }
        fs::create_dir_all(root.join(STAGING_DIR))?;

        let cache = Self {
            connector,
            root,
            limits,
            index: Mutex::new(CacheIndex::default()),
        };
        let index = cache.rebuild_index()?;
        *cache.lock_index()? = index;
        Ok(cache)
    }

    pub fn connector(&self) -> &ConnectorId {
        &self.connector
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    fn lock_index(&self) -> CacheResult<MutexGuard<'_, CacheIndex>> {
        self.index.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn payload_path(&self, tier: Tier, base: &str) -> PathBuf {
        self.tier_dir(tier).join(file_name(base, PAYLOAD_EXT))
    }

    fn metadata_path(&self, tier: Tier, base: &str) -> PathBuf {
        self.tier_dir(tier).join(file_name(base, METADATA_EXT))
    }

    fn to_entry(&self, tier: Tier, id: &EntryId, indexed: &Indexed) -> CacheEntry {
        CacheEntry {
            id: id.clone(),
            connector: self.connector.clone(),
            tier,
            metadata: indexed.metadata.clone(),
        }
    }

    // === Startup scan ===

    fn rebuild_index(&self) -> CacheResult<CacheIndex> {
        self.recover_staging()?;

        let mut listings = HashMap::new();
        for tier in Tier::ALL {
            listings.insert(tier, self.list_tier(tier)?);
        }
        self.recover_interrupted_moves(&mut listings)?;

        let mut index = CacheIndex::default();
        let mut loaded = Vec::new();
        for tier in Tier::ALL {
            let listing = &listings[&tier];
            for base in &listing.metadata {
                if !listing.payloads.contains(base) {
                    index.flag(tier, base, "metadata without payload");
                    continue;
                }
                let Ok(id) = EntryId::parse(base.as_str()) else {
                    index.flag(tier, base, "invalid entry name");
                    continue;
                };
                let parsed = fs::read(self.metadata_path(tier, base))
                    .map_err(CacheError::from)
                    .and_then(|raw| Ok(serde_json::from_slice::<CacheMetadata>(&raw)?));
                match parsed {
                    Ok(metadata) => loaded.push((tier, id, metadata)),
                    Err(e) => index.flag(tier, base, format!("unreadable metadata: {}", e)),
                }
            }
            for base in listing.payload_only() {
                index.flag(tier, &base, "payload without metadata");
            }
        }

        // Ids are time-ordered, so (created_at, id) restores arrival order
        loaded.sort_by(|a, b| (a.2.created_at, &a.1).cmp(&(b.2.created_at, &b.1)));
        for (tier, id, metadata) in loaded {
            index.insert(tier, id, metadata);
        }

        let cache_count = index.cache.entries.len();
        if cache_count > 0 {
            info!(connector = %self.connector, entries = cache_count, bytes = index.cache.bytes, "content in cache");
        } else {
            debug!(connector = %self.connector, "no content in cache");
        }
        if !index.error.entries.is_empty() {
            warn!(connector = %self.connector, entries = index.error.entries.len(), "content errored");
        }
        debug!(connector = %self.connector, entries = index.archive.entries.len(), "content archived");

        Ok(index)
    }

    fn list_tier(&self, tier: Tier) -> CacheResult<TierListing> {
        let mut listing = TierListing::default();
        for dir_entry in fs::read_dir(self.tier_dir(tier))? {
            let path = dir_entry?.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            match ext {
                PAYLOAD_EXT => {
                    listing.payloads.insert(stem.to_string());
                }
                METADATA_EXT => {
                    listing.metadata.insert(stem.to_string());
                }
                _ => debug!(path = %path.display(), "ignoring unknown file in cache tier"),
            }
        }
        Ok(listing)
    }

    /// Finish writes whose payload reached the cache tier before the crash;
    /// discard everything else left in staging.
    fn recover_staging(&self) -> CacheResult<()> {
        for dir_entry in fs::read_dir(self.staging_dir())? {
            let path = dir_entry?.path();
            let stem = path.file_stem().and_then(|s| s.to_str()).map(str::to_string);
            let is_metadata = path.extension().and_then(|s| s.to_str()) == Some(METADATA_EXT);

            if let (Some(base), true) = (stem, is_metadata) {
                let payload = self.payload_path(Tier::Cache, &base);
                let metadata = self.metadata_path(Tier::Cache, &base);
                if payload.exists() && !metadata.exists() {
                    fs::rename(&path, &metadata)?;
                    warn!(connector = %self.connector, entry = %base, "completed interrupted cache write");
                    continue;
                }
            }
            remove_if_present(&path)?;
            debug!(path = %path.display(), "discarded staged file");
        }
        Ok(())
    }

    /// A move renames the payload first, then the metadata. A crash in
    /// between leaves the metadata in the source tier and the payload in
    /// the destination; roll the move forward.
    fn recover_interrupted_moves(&self, listings: &mut HashMap<Tier, TierListing>) -> CacheResult<()> {
        for from in Tier::ALL {
            for base in listings[&from].metadata_only() {
                let target = Tier::ALL.into_iter().find(|to| {
                    *to != from
                        && listings[to].payloads.contains(&base)
                        && !listings[to].metadata.contains(&base)
                });
                let Some(to) = target else { continue };

                fs::rename(self.metadata_path(from, &base), self.metadata_path(to, &base))?;
                warn!(connector = %self.connector, entry = %base, from = %from, to = %to,
                    "completed interrupted move");
                if let Some(listing) = listings.get_mut(&from) {
                    listing.metadata.remove(&base);
                }
                if let Some(listing) = listings.get_mut(&to) {
                    listing.metadata.insert(base);
                }
            }
        }
        Ok(())
    }

    // === Writes ===

    fn ensure_capacity(&self, index: &CacheIndex, tier: Tier, requested: u64) -> CacheResult<()> {
        let Some(limit) = self.limits.for_tier(tier) else {
            return Ok(());
        };
        let available = limit.saturating_sub(index.tier(tier).bytes);
        if requested > available {
            return Err(CacheError::CacheFull {
                connector: self.connector.clone(),
                tier,
                requested,
                available,
            });
        }
        Ok(())
    }

    /// Store a payload in the `cache` tier.
    ///
    /// Rejected with [`CacheError::CacheFull`] before anything touches the
    /// disk when the payload does not fit.
    pub fn write(&self, payload: &[u8], metadata: EntryMetadata) -> CacheResult<CacheEntry> {
        let size = payload.len() as u64;
        let mut index = self.lock_index()?;
        self.ensure_capacity(&index, Tier::Cache, size)?;

        let id = EntryId::generate();
        let staged = self.staging_dir().join(file_name(id.as_str(), PAYLOAD_EXT));
        if let Err(e) = write_synced(&staged, payload) {
            let _ = remove_if_present(&staged);
            return Err(e.into());
        }
        self.commit_staged(&mut index, id, size, metadata)
    }

    /// Copy a file into the `cache` tier through the same staging path.
    pub fn write_file(&self, source: &Path, metadata: EntryMetadata) -> CacheResult<CacheEntry> {
        let size = fs::metadata(source)?.len();
        let mut index = self.lock_index()?;
        self.ensure_capacity(&index, Tier::Cache, size)?;

        let id = EntryId::generate();
        let staged = self.staging_dir().join(file_name(id.as_str(), PAYLOAD_EXT));
        let copied = fs::copy(source, &staged).and_then(|n| {
            File::open(&staged)?.sync_all()?;
            Ok(n)
        });
        match copied {
            Ok(n) if n == size => self.commit_staged(&mut index, id, n, metadata),
            Ok(n) => {
                let _ = remove_if_present(&staged);
                Err(CacheError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} changed size while copying ({} of {} bytes)", source.display(), n, size),
                )))
            }
            Err(e) => {
                let _ = remove_if_present(&staged);
                Err(e.into())
            }
        }
    }

    fn commit_staged(
        &self,
        index: &mut CacheIndex,
        id: EntryId,
        size: u64,
        metadata: EntryMetadata,
    ) -> CacheResult<CacheEntry> {
        let metadata = CacheMetadata {
            created_at: Utc::now(),
            content_type: metadata.content_type,
            item_count: metadata.item_count,
            source_name: metadata.source_name,
            content_size: size,
        };
        let staged_payload = self.staging_dir().join(file_name(id.as_str(), PAYLOAD_EXT));
        let staged_metadata = self.staging_dir().join(file_name(id.as_str(), METADATA_EXT));
        let payload = self.payload_path(Tier::Cache, id.as_str());

        let committed = serde_json::to_vec(&metadata)
            .map_err(CacheError::from)
            .and_then(|raw| Ok(write_synced(&staged_metadata, &raw)?))
            .and_then(|_| Ok(fs::rename(&staged_payload, &payload)?))
            .and_then(|_| Ok(fs::rename(&staged_metadata, self.metadata_path(Tier::Cache, id.as_str()))?));

        if let Err(e) = committed {
            // Nothing was committed: the entry never became visible
            let _ = remove_if_present(&staged_payload);
            let _ = remove_if_present(&staged_metadata);
            let _ = remove_if_present(&payload);
            return Err(e);
        }

        debug!(connector = %self.connector, entry = %id, bytes = size, "entry written to cache");
        index.insert(Tier::Cache, id.clone(), metadata.clone());
        Ok(CacheEntry {
            id,
            connector: self.connector.clone(),
            tier: Tier::Cache,
            metadata,
        })
    }

    // === Queries ===

    /// Entries of `tier` matching `params`, in arrival order
    pub fn search(&self, tier: Tier, params: &SearchParams) -> CacheResult<Vec<CacheEntry>> {
        let index = self.lock_index()?;
        Ok(index
            .tier(tier)
            .ordered()
            .into_iter()
            .map(|(id, indexed)| self.to_entry(tier, id, indexed))
            .filter(|entry| params.matches(entry))
            .collect())
    }

    /// Entries awaiting delivery, oldest first
    pub fn pending(&self) -> CacheResult<Vec<CacheEntry>> {
        self.search(Tier::Cache, &SearchParams::default())
    }

    pub fn get(&self, tier: Tier, id: &EntryId) -> CacheResult<Option<CacheEntry>> {
        let index = self.lock_index()?;
        Ok(index
            .tier(tier)
            .entries
            .get(id)
            .map(|indexed| self.to_entry(tier, id, indexed)))
    }

    /// Open the payload of an entry for reading.
    ///
    /// A payload that vanished from under its metadata is flagged corrupt
    /// and dropped from the index.
    pub fn read_content(&self, tier: Tier, id: &EntryId) -> CacheResult<File> {
        let mut index = self.lock_index()?;
        if !index.tier(tier).entries.contains_key(id) {
            if index.is_flagged(tier, id.as_str()) {
                return Err(CacheError::CorruptEntry {
                    tier,
                    id: id.to_string(),
                    reason: "flagged corrupt".to_string(),
                });
            }
            return Err(CacheError::EntryNotFound { tier, id: id.clone() });
        }

        match File::open(self.payload_path(tier, id.as_str())) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                index.tier_mut(tier).take(id);
                index.flag(tier, id.as_str(), "metadata without payload");
                Err(CacheError::CorruptEntry {
                    tier,
                    id: id.to_string(),
                    reason: "metadata without payload".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole payload into memory
    pub fn read_payload(&self, tier: Tier, id: &EntryId) -> CacheResult<Vec<u8>> {
        let mut file = self.read_content(tier, id)?;
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        Ok(payload)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let index = self.lock_index()?;
        let tier_stats = |tier: Tier| TierStats {
            entries: index.tier(tier).entries.len(),
            bytes: index.tier(tier).bytes,
        };
        Ok(CacheStats {
            cache: tier_stats(Tier::Cache),
            archive: tier_stats(Tier::Archive),
            error: tier_stats(Tier::Error),
            corrupt: index.corrupt.len(),
        })
    }

    pub fn corrupt_entries(&self) -> CacheResult<Vec<CorruptEntry>> {
        Ok(self.lock_index()?.corrupt.clone())
    }

    // === Tier transitions ===

    fn move_files(&self, id: &EntryId, from: Tier, to: Tier) -> CacheResult<()> {
        let base = id.as_str();
        fs::rename(self.payload_path(from, base), self.payload_path(to, base))?;
        if let Err(e) = fs::rename(self.metadata_path(from, base), self.metadata_path(to, base)) {
            // Put the payload back so the entry stays whole in its source tier
            let _ = fs::rename(self.payload_path(to, base), self.payload_path(from, base));
            return Err(e.into());
        }
        Ok(())
    }

    /// Move entries between tiers. Returns how many entries moved.
    ///
    /// Moving to the current tier is a no-op. Ids absent from `from` are
    /// skipped. Each entry moves atomically; a destination that runs out of
    /// room stops the batch with [`CacheError::CacheFull`].
    pub fn move_entries(&self, ids: &[EntryId], from: Tier, to: Tier) -> CacheResult<usize> {
        if from == to {
            return Ok(0);
        }
        let mut index = self.lock_index()?;
        let mut moved = 0;
        for id in ids {
            let Some(size) = index
                .tier(from)
                .entries
                .get(id)
                .map(|indexed| indexed.metadata.content_size)
            else {
                if index.tier(to).entries.contains_key(id) {
                    debug!(connector = %self.connector, entry = %id, tier = %to, "entry already in tier");
                } else {
                    warn!(connector = %self.connector, entry = %id, tier = %from, "entry not found, not moved");
                }
                continue;
            };

            self.ensure_capacity(&index, to, size)?;
            self.move_files(id, from, to)?;
            index.relocate(id, from, to);
            moved += 1;
            debug!(connector = %self.connector, entry = %id, from = %from, to = %to, "entry moved");
        }
        Ok(moved)
    }

    pub fn move_all(&self, from: Tier, to: Tier) -> CacheResult<usize> {
        let ids: Vec<EntryId> = self.search(from, &SearchParams::default())?
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        self.move_entries(&ids, from, to)
    }

    /// Delete entries from a tier. Returns how many entries were removed.
    pub fn remove(&self, tier: Tier, ids: &[EntryId]) -> CacheResult<usize> {
        let mut index = self.lock_index()?;
        let mut removed = 0;
        for id in ids {
            if !index.tier(tier).entries.contains_key(id) {
                debug!(connector = %self.connector, entry = %id, tier = %tier, "entry not found, not removed");
                continue;
            }
            // Metadata first: once it is gone the entry is no longer visible
            remove_if_present(&self.metadata_path(tier, id.as_str()))?;
            remove_if_present(&self.payload_path(tier, id.as_str()))?;
            index.tier_mut(tier).take(id);
            removed += 1;
        }
        if removed > 0 {
            debug!(connector = %self.connector, tier = %tier, removed, "entries removed");
        }
        Ok(removed)
    }

    pub fn remove_all(&self, tier: Tier) -> CacheResult<usize> {
        let ids: Vec<EntryId> = self.search(tier, &SearchParams::default())?
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        self.remove(tier, &ids)
    }
}
