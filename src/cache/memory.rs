//! In-process hot cache implementation.
//!
//! A `HashMap` guarded by a mutex, with per-entry expiry instants. Expired
//! entries are dropped lazily on access and swept wholesale once the map
//! crosses a size watermark, so unread keys cannot accumulate without
//! bound.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CacheResult, HotCache};

/// Sweep the whole map when it grows past this many entries.
const SWEEP_WATERMARK: usize = 4096;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory [`HotCache`] with per-key TTLs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // a poisoned cache mutex is unrecoverable state corruption
        self.entries.lock().expect("cache mutex poisoned")
    }

    fn sweep_if_needed(map: &mut HashMap<String, Entry>) {
        if map.len() > SWEEP_WATERMARK {
            let now = Instant::now();
            map.retain(|_, entry| !entry.is_expired(now));
        }
    }
}

#[async_trait]
impl HotCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut map = self.lock();
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        let mut map = self.lock();
        Self::sweep_if_needed(&mut map);
        map.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|key, _| !key.starts_with(prefix));
        Ok((before - map.len()) as u64)
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<Value>>> {
        let mut map = self.lock();
        let now = Instant::now();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match map.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    map.remove(key);
                    out.push(None);
                }
                Some(entry) => out.push(Some(entry.value.clone())),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> CacheResult<bool> {
        let mut map = self.lock();
        let now = Instant::now();
        if let Some(entry) = map.get(key) {
            if !entry.is_expired(now) {
                return Ok(false);
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::String(owner.to_string()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> CacheResult<bool> {
        let mut map = self.lock();
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                Ok(false)
            }
            Some(entry) if entry.value.as_str() == Some(owner) => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
