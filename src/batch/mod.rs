//! Batch assembly of values and files ahead of the content cache
//!
//! Values are buffered and written to the cache as one JSON array when the
//! buffer reaches `group_count` or `max_send_count`, or when `send_interval`
//! elapses, whichever comes first. Files are either cached on arrival or
//! queued until the next interval tick.

use crate::cache::{CacheEntry, CacheError, CacheResult, ContentCache, EntryMetadata};
use crate::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// One value read from a source item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeValue {
    pub point_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl TimeValue {
    pub fn new(point_id: impl Into<String>, timestamp: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp,
            data,
        }
    }
}

/// Flush triggers of a connector. A zero count disables that trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub group_count: usize,
    /// Hard cap on values per batch
    pub max_send_count: usize,
    /// Zero disables the time trigger
    pub send_interval: Duration,
    pub send_file_immediately: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            group_count: 1000,
            max_send_count: 10_000,
            send_interval: Duration::from_secs(10),
            send_file_immediately: true,
        }
    }
}

impl BatchSettings {
    /// Buffer size that triggers an immediate flush
    pub fn flush_threshold(&self) -> Option<usize> {
        [self.group_count, self.max_send_count]
            .into_iter()
            .filter(|count| *count > 0)
            .min()
    }

    fn chunk_size(&self) -> Option<usize> {
        Some(self.max_send_count).filter(|count| *count > 0)
    }
}

#[derive(Debug, Default)]
struct Buffer {
    values: Vec<TimeValue>,
    files: Vec<PathBuf>,
}

/// Buffers a connector's values and files and writes them to its cache
#[derive(Debug)]
pub struct BatchAssembler {
    cache: Arc<ContentCache>,
    settings: BatchSettings,
    buffer: Mutex<Buffer>,
    on_flush: Option<Arc<Notify>>,
}

impl BatchAssembler {
    pub fn new(cache: Arc<ContentCache>, settings: BatchSettings) -> Self {
        Self {
            cache,
            settings,
            buffer: Mutex::new(Buffer::default()),
            on_flush: None,
        }
    }

    /// Notify `waker` whenever a batch reaches the cache
    pub fn with_flush_hook(mut self, waker: Arc<Notify>) -> Self {
        self.on_flush = Some(waker);
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    fn lock_buffer(&self) -> CacheResult<MutexGuard<'_, Buffer>> {
        self.buffer.lock().map_err(|_| CacheError::LockPoisoned)
    }

    pub fn buffered_values(&self) -> CacheResult<usize> {
        Ok(self.lock_buffer()?.values.len())
    }

    pub fn queued_files(&self) -> CacheResult<usize> {
        Ok(self.lock_buffer()?.files.len())
    }

    fn notify(&self, written: &[CacheEntry]) {
        if written.is_empty() {
            return;
        }
        if let Some(waker) = &self.on_flush {
            waker.notify_one();
        }
    }

    /// Write the first `count` buffered values as one entry. On failure the
    /// values stay at the head of the buffer.
    fn write_head(&self, buffer: &mut Buffer, count: usize) -> CacheResult<CacheEntry> {
        let chunk: Vec<TimeValue> = buffer.values.drain(..count).collect();
        let written = serde_json::to_vec(&chunk)
            .map_err(CacheError::from)
            .and_then(|payload| {
                self.cache
                    .write(&payload, EntryMetadata::time_values(chunk.len()))
            });
        if written.is_err() {
            let rest = std::mem::replace(&mut buffer.values, chunk);
            buffer.values.extend(rest);
        }
        written
    }

    /// Write full batches from the head of the buffer
    fn flush_full(&self, buffer: &mut Buffer, written: &mut Vec<CacheEntry>) -> CacheResult<()> {
        let Some(threshold) = self.settings.flush_threshold() else {
            return Ok(());
        };
        while buffer.values.len() >= threshold {
            written.push(self.write_head(buffer, threshold)?);
        }
        Ok(())
    }

    /// Buffer values, flushing full batches right away.
    ///
    /// Returns the entries written. If the cache rejects the first batch
    /// holding any of `values`, none of them is kept and the error is
    /// returned, so the caller can back off and resend them as is. Values
    /// buffered by earlier calls stay buffered.
    pub fn add_values(&self, values: Vec<TimeValue>) -> CacheResult<Vec<CacheEntry>> {
        let mut buffer = self.lock_buffer()?;
        let mut written = Vec::new();

        // A full backlog left by an earlier rejection goes first
        if let Err(e) = self.flush_full(&mut buffer, &mut written) {
            self.notify(&written);
            return Err(e);
        }

        let kept = buffer.values.len();
        let backlog_batches = written.len();
        buffer.values.extend(values);
        trace!(connector = %self.cache.connector(), buffered = buffer.values.len(), "values buffered");

        if let Err(e) = self.flush_full(&mut buffer, &mut written) {
            self.notify(&written);
            if written.len() == backlog_batches {
                buffer.values.truncate(kept);
                return Err(e);
            }
            if !matches!(e, CacheError::CacheFull { .. }) {
                return Err(e);
            }
            warn!(
                connector = %self.cache.connector(),
                buffered = buffer.values.len(),
                error = %e,
                "batch rejected, values kept for the next flush"
            );
            return Ok(written);
        }
        if !written.is_empty() {
            debug!(connector = %self.cache.connector(), batches = written.len(), "max flush");
        }
        self.notify(&written);
        Ok(written)
    }

    /// Cache a file now, or queue it for the next tick. Returns the entry
    /// when the file was cached.
    pub fn add_file(&self, path: &Path) -> CacheResult<Option<CacheEntry>> {
        if self.settings.send_file_immediately {
            let entry = self.cache.write_file(path, file_metadata(path))?;
            self.notify(std::slice::from_ref(&entry));
            return Ok(Some(entry));
        }
        self.lock_buffer()?.files.push(path.to_path_buf());
        Ok(None)
    }

    /// Time flush: write every buffered value, in chunks of at most
    /// `max_send_count`, then every queued file.
    pub fn flush(&self) -> CacheResult<Vec<CacheEntry>> {
        let mut buffer = self.lock_buffer()?;
        let mut written = Vec::new();
        let result = self.flush_locked(&mut buffer, &mut written);
        self.notify(&written);
        if !written.is_empty() {
            debug!(connector = %self.cache.connector(), entries = written.len(), "time flush");
        }
        result.map(|_| written)
    }

    fn flush_locked(&self, buffer: &mut Buffer, written: &mut Vec<CacheEntry>) -> CacheResult<()> {
        while !buffer.values.is_empty() {
            let count = self
                .settings
                .chunk_size()
                .map_or(buffer.values.len(), |max| max.min(buffer.values.len()));
            written.push(self.write_head(buffer, count)?);
        }
        while let Some(path) = buffer.files.first().cloned() {
            written.push(self.cache.write_file(&path, file_metadata(&path))?);
            buffer.files.remove(0);
        }
        Ok(())
    }

    /// Time flush that leaves rejected batches buffered for the next tick
    fn flush_or_hold(&self) -> CacheResult<Vec<CacheEntry>> {
        match self.flush() {
            Err(CacheError::CacheFull { requested, available, .. }) => {
                let buffer = self.lock_buffer()?;
                warn!(
                    connector = %self.cache.connector(),
                    requested,
                    available,
                    values = buffer.values.len(),
                    files = buffer.files.len(),
                    "cache full, holding batch"
                );
                Ok(Vec::new())
            }
            result => result,
        }
    }

    /// Flush on every `send_interval` tick until cancelled, then flush once
    /// more so nothing buffered is lost at shutdown.
    ///
    /// A full cache only postpones the flush. Any other cache error ends the
    /// loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> CacheResult<()> {
        let period = self.settings.send_interval;
        if period.is_zero() {
            cancel.cancelled().await;
        } else {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush_or_hold()?;
                    }
                }
            }
        }
        let remaining = self.flush_or_hold()?;
        info!(connector = %self.cache.connector(), flushed = remaining.len(), "batch assembler stopped");
        Ok(())
    }
}

fn file_metadata(path: &Path) -> EntryMetadata {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    EntryMetadata::file(name)
}
