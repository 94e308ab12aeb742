//! Shared helpers for sluice integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sluice::cache::{CacheEntry, ContentCache, TierLimits};
use sluice::{ConnectorId, DeliveryError, DeliveryTarget, ItemId, ScanModeId};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn south() -> ConnectorId {
    ConnectorId::from("south1")
}

pub fn north() -> ConnectorId {
    ConnectorId::from("north1")
}

pub fn scan(id: &str) -> ScanModeId {
    ScanModeId::from(id)
}

pub fn item(id: &str) -> ItemId {
    ItemId::from(id)
}

/// Midnight UTC of the given day in February 2024
pub fn feb(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).unwrap()
}

pub fn open_cache(dir: &Path, limits: TierLimits) -> Arc<ContentCache> {
    Arc::new(ContentCache::open(dir, north(), limits).unwrap())
}

/// Delivery target that records payloads and answers from a script.
///
/// Each call pops the next scripted outcome; once the script is exhausted
/// every delivery succeeds.
pub struct ScriptedTarget {
    script: Mutex<Vec<Result<(), DeliveryError>>>,
    delay: Duration,
    pub delivered: Mutex<Vec<Vec<u8>>>,
    pub calls: AtomicUsize,
}

impl ScriptedTarget {
    pub fn new(script: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
        Self::slow(script, Duration::ZERO)
    }

    /// Answers only after `delay` has passed
    pub fn slow(script: Vec<Result<(), DeliveryError>>, delay: Duration) -> Arc<Self> {
        let mut script = script;
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            delay,
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn always_failing(n: usize) -> Arc<Self> {
        Self::new(vec![Err(DeliveryError::transient("target unreachable")); n])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTarget for ScriptedTarget {
    async fn deliver(&self, _entry: &CacheEntry, payload: Vec<u8>) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop().unwrap_or(Ok(()));
        if next.is_ok() {
            self.delivered.lock().unwrap().push(payload);
        }
        next
    }
}
