use super::clock::{Clock, SystemClock};
use super::types::UsageRecord;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Storage for per-key usage records.
///
/// Operations never fail. Every read that depends on expiry takes the
/// caller's `now_ms` so limiters and store agree on a single clock.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Get the live record for `key`. Expired records are deleted and reported as absent.
    async fn get(&self, key: &str, now_ms: u64) -> Option<UsageRecord>;

    /// Overwrite the record for `key`
    async fn set(&self, key: &str, record: UsageRecord);

    /// Count one hit for `key`, initializing a fresh record when absent or expired
    async fn increment(&self, key: &str, now_ms: u64) -> UsageRecord;

    /// Delete the record for `key`
    async fn reset(&self, key: &str);

    /// Delete every record
    async fn clear(&self);
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

/// In-memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStoreConfig {
    /// Window applied by `increment` when it initializes a record
    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,
    /// Interval between background sweeps of expired records
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            default_window_ms: default_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Process-local quota store backed by a concurrent map.
///
/// When created inside a Tokio runtime the store owns a background task that
/// evicts expired records every `sweep_interval_ms`. The task is aborted by
/// [`MemoryStore::destroy`] or when the store is dropped.
pub struct MemoryStore {
    records: Arc<DashMap<String, UsageRecord>>,
    default_window_ms: u64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store with default settings and the system clock
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default(), Arc::new(SystemClock))
    }

    /// Create a store whose sweep task reads `clock`
    pub fn with_config(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let records = Arc::new(DashMap::new());
        let sweeper = Self::spawn_sweeper(records.clone(), clock, config.sweep_interval_ms);

        Self {
            records,
            default_window_ms: config.default_window_ms,
            sweeper: Mutex::new(sweeper),
        }
    }

    fn spawn_sweeper(
        records: Arc<DashMap<String, UsageRecord>>,
        clock: Arc<dyn Clock>,
        interval_ms: u64,
    ) -> Option<JoinHandle<()>> {
        if interval_ms == 0 {
            info!("Quota store sweep disabled");
            return None;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No Tokio runtime available, quota store sweep not started");
                return None;
            }
        };

        Some(handle.spawn(async move {
            let mut sweep_interval = tokio::time::interval(Duration::from_millis(interval_ms));
            // The first tick completes immediately.
            sweep_interval.tick().await;

            debug!(interval_ms, "Started quota store sweep");

            loop {
                sweep_interval.tick().await;
                sweep_records(&records, clock.now_ms());
            }
        }))
    }

    /// Remove every record that has expired at `now_ms`
    pub fn sweep(&self, now_ms: u64) -> usize {
        sweep_records(&self.records, now_ms)
    }

    /// Number of records currently held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the background sweep task is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the sweep task and drop all records. Safe to call more than once.
    pub fn destroy(&self) {
        let handle = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            handle.abort();
            info!("Quota store sweep stopped");
        }

        self.records.clear();
    }
}

fn sweep_records(records: &DashMap<String, UsageRecord>, now_ms: u64) -> usize {
    let before = records.len();
    records.retain(|_, record| !record.is_expired(now_ms));
    let removed = before.saturating_sub(records.len());

    if removed > 0 {
        debug!(removed, "Swept expired quota records");
        crate::metrics::record_store_swept(removed);
    }

    removed
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let handle = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get(&self, key: &str, now_ms: u64) -> Option<UsageRecord> {
        // Removal is conditional so a concurrent fresh `set` is not lost.
        if let Some((_, record)) = self
            .records
            .remove_if(key, |_, record| record.is_expired(now_ms))
        {
            debug!(key, reset_time = record.reset_time, "Evicted expired quota record");
            return None;
        }

        self.records.get(key).map(|record| *record)
    }

    async fn set(&self, key: &str, record: UsageRecord) {
        self.records.insert(key.to_string(), record);
    }

    async fn increment(&self, key: &str, now_ms: u64) -> UsageRecord {
        let fresh = UsageRecord {
            count: 1,
            reset_time: now_ms + self.default_window_ms,
            tokens: 1.0,
            last_refill_time: now_ms,
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.is_expired(now_ms) {
                    *record = fresh;
                } else {
                    record.count += 1;
                }
                *record
            }
            Entry::Vacant(entry) => *entry.insert(fresh),
        }
    }

    async fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    async fn clear(&self) {
        self.records.clear();
    }
}
