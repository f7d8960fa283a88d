//! # Bounded Importance Cache
//!
//! A memory-budgeted key/value cache with optional per-entry TTL. When space
//! is needed it evicts the live entry with the lowest importance score:
//!
//! ```text
//! score(entry) = (access_count + 1) * recency / ln(size_bytes + 1)
//! recency      = 1 / (1 + seconds_since_last_access)
//! ```
//!
//! Frequently and recently used, size-efficient entries survive; large,
//! stale, rarely read entries go first.
//!
//! ## Invariant
//!
//! After every mutating call returns, the sum of `size_bytes` over live
//! entries is at most `max_memory`.
//!
//! The cache itself is synchronous. Callers that share it across tasks wrap
//! it in a mutex, which also makes reads and writes on the same key
//! linearizable.

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CoreError, Result};

/// Size charged for values whose serialized form cannot be produced
pub const FALLBACK_SIZE_BYTES: usize = 1024;

/// Memory usage at or above which pressure is `High`
pub const HIGH_PRESSURE_PCT: f64 = 85.0;
/// Memory usage at or above which pressure is `Critical`
pub const CRITICAL_PRESSURE_PCT: f64 = 95.0;
const MODERATE_PRESSURE_PCT: f64 = 70.0;

/// Eviction target after a sweep under `High` pressure
const HIGH_PRESSURE_TARGET_PCT: f64 = 85.0;
/// Eviction target after a sweep under `Critical` pressure
const CRITICAL_PRESSURE_TARGET_PCT: f64 = 70.0;

/// Approximate in-memory footprint of a cached value.
///
/// Strings count two bytes per UTF-16 code unit, scalars a fixed constant,
/// byte buffers their exact length. Structured values use
/// [`serialized_size_estimate`].
pub trait ApproximateSize {
    fn approximate_size(&self) -> usize;
}

impl ApproximateSize for String {
    fn approximate_size(&self) -> usize {
        self.as_str().approximate_size()
    }
}

impl ApproximateSize for str {
    fn approximate_size(&self) -> usize {
        self.encode_utf16().count() * 2
    }
}

impl ApproximateSize for Vec<u8> {
    fn approximate_size(&self) -> usize {
        self.len()
    }
}

impl ApproximateSize for bool {
    fn approximate_size(&self) -> usize {
        4
    }
}

macro_rules! numeric_size {
    ($($ty:ty),*) => {
        $(impl ApproximateSize for $ty {
            fn approximate_size(&self) -> usize {
                8
            }
        })*
    };
}

numeric_size!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// Serialized-length estimate for structured values.
///
/// Counts the JSON form at two bytes per character, falling back to
/// [`FALLBACK_SIZE_BYTES`] when the value cannot be serialized.
#[must_use]
pub fn serialized_size_estimate<T: Serialize + ?Sized>(value: &T) -> usize {
    match serde_json::to_string(value) {
        Ok(json) => json.approximate_size(),
        Err(e) => {
            trace!("Falling back to constant size estimate: {e}");
            FALLBACK_SIZE_BYTES
        }
    }
}

/// Memory pressure bands derived from usage percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    #[must_use]
    pub fn from_usage_pct(pct: f64) -> Self {
        if pct >= CRITICAL_PRESSURE_PCT {
            Self::Critical
        } else if pct >= HIGH_PRESSURE_PCT {
            Self::High
        } else if pct >= MODERATE_PRESSURE_PCT {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

/// Why an entry left the cache without an explicit delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionReason {
    /// Room was needed for an insert or a smaller budget
    Capacity,
    /// Proactive eviction during a sweep under memory pressure
    Pressure,
    /// TTL ran out
    Expired,
}

type EvictionListener = Box<dyn Fn(&str, EvictionReason) + Send + Sync>;

/// A live cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub size_bytes: usize,
    pub created_at: Instant,
    pub access_count: u64,
    pub last_access_at: Instant,
    pub ttl: Option<Duration>,
    /// Monotonic LRU position, bumped on every read or write
    lru_tick: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
    }

    /// Lower evicts first
    fn eviction_score(&self, now: Instant) -> f64 {
        let age_secs = now.saturating_duration_since(self.last_access_at).as_secs_f64();
        let recency = 1.0 / (1.0 + age_secs);
        #[allow(clippy::cast_precision_loss)]
        let frequency = (self.access_count + 1) as f64;
        #[allow(clippy::cast_precision_loss)]
        let size_penalty = ((self.size_bytes + 1) as f64).ln().max(f64::MIN_POSITIVE);
        frequency * recency / size_penalty
    }
}

/// Counters and derived figures reported by [`BoundedImportanceCache::statistics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_size: usize,
    pub item_count: usize,
    pub max_memory: usize,
    /// Percentage, rounded to two decimals
    pub hit_rate: f64,
    pub memory_usage_pct: f64,
    pub pressure_level: PressureLevel,
}

/// Outcome of a periodic sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

/// Generic memory-budgeted cache keyed by string
pub struct BoundedImportanceCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    max_memory: usize,
    total_size: usize,
    default_ttl: Option<Duration>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    tick: u64,
    on_evict: Option<EvictionListener>,
}

impl<T> std::fmt::Debug for BoundedImportanceCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedImportanceCache")
            .field("items", &self.entries.len())
            .field("total_size", &self.total_size)
            .field("max_memory", &self.max_memory)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + ApproximateSize> BoundedImportanceCache<T> {
    /// Create an empty cache with the given byte budget
    #[must_use]
    pub fn new(max_memory: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_memory,
            total_size: 0,
            default_ttl: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            tick: 0,
            on_evict: None,
        }
    }

    /// TTL applied by [`Self::set`] when the caller gives none
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Register a callback fired for every eviction or expiry
    pub fn set_eviction_listener(&mut self, listener: impl Fn(&str, EvictionReason) + Send + Sync + 'static) {
        self.on_evict = Some(Box::new(listener));
    }

    /// Insert or replace `key`. Returns `false` when the value alone exceeds
    /// the budget or enough room could not be freed.
    pub fn set(&mut self, key: &str, value: T, ttl: Option<Duration>) -> bool {
        match self.try_set(key, value, ttl) {
            Ok(()) => true,
            Err(e) => {
                warn!("Not caching `{key}`: {e}");
                false
            }
        }
    }

    /// Like [`Self::set`] but reports why a write was rejected
    pub fn try_set(&mut self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
        let size = value.approximate_size();
        if size > self.max_memory {
            return Err(CoreError::CacheCapacityExceeded {
                key: key.to_string(),
                size,
                budget: self.max_memory,
            });
        }

        // The old value no longer counts against the budget.
        self.remove_entry(key);

        if !self.ensure_capacity(size) {
            return Err(CoreError::CacheCapacityExceeded {
                key: key.to_string(),
                size,
                budget: self.max_memory.saturating_sub(self.total_size),
            });
        }

        let now = Instant::now();
        let tick = self.next_tick();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                size_bytes: size,
                created_at: now,
                access_count: 0,
                last_access_at: now,
                ttl: ttl.or(self.default_ttl),
                lru_tick: tick,
            },
        );
        self.total_size += size;
        trace!("Cached `{key}` ({size} bytes, {} total)", self.total_size);
        Ok(())
    }

    /// Look up `key`, counting a hit or a miss. Expired entries are removed
    /// and count as misses.
    pub fn get(&mut self, key: &str) -> Option<T> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.remove_entry(key);
            self.expirations += 1;
            self.misses += 1;
            self.notify(key, EvictionReason::Expired);
            return None;
        }

        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access_at = now;
        entry.lru_tick = tick;
        self.hits += 1;
        Some(entry.value.clone())
    }

    /// True if a live, unexpired entry exists. Does not touch statistics.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.remove_entry(key).is_some()
    }

    /// Drop every entry. Counters are kept. Returns how many entries were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.total_size = 0;
        count
    }

    /// Change the budget. Shrinking evicts immediately down to the new ceiling.
    pub fn set_max_memory(&mut self, max_memory: usize) {
        self.max_memory = max_memory;
        let evicted = self.evict_down_to(max_memory, EvictionReason::Capacity);
        if evicted > 0 {
            debug!("Budget reduced to {max_memory} bytes, evicted {evicted} entries");
        }
    }

    #[must_use]
    pub const fn max_memory(&self) -> usize {
        self.max_memory
    }

    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn memory_usage_pct(&self) -> f64 {
        if self.max_memory == 0 {
            return if self.total_size == 0 { 0.0 } else { 100.0 };
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.total_size as f64 / self.max_memory as f64 * 100.0;
        pct
    }

    #[must_use]
    pub fn pressure_level(&self) -> PressureLevel {
        PressureLevel::from_usage_pct(self.memory_usage_pct())
    }

    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        let lookups = self.hits + self.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
        };

        CacheStatistics {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            total_size: self.total_size,
            item_count: self.entries.len(),
            max_memory: self.max_memory,
            hit_rate,
            memory_usage_pct: (self.memory_usage_pct() * 100.0).round() / 100.0,
            pressure_level: self.pressure_level(),
        }
    }

    /// Periodic maintenance: drop expired entries, then evict proactively
    /// when memory pressure is high or critical.
    pub fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let expired_keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired_keys {
            self.remove_entry(key);
            self.expirations += 1;
            self.notify(key, EvictionReason::Expired);
        }

        let target_pct = match self.pressure_level() {
            PressureLevel::Critical => Some(CRITICAL_PRESSURE_TARGET_PCT),
            PressureLevel::High => Some(HIGH_PRESSURE_TARGET_PCT),
            PressureLevel::Low | PressureLevel::Moderate => None,
        };

        let evicted = target_pct.map_or(0, |pct| {
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let target = (self.max_memory as f64 * pct / 100.0) as usize;
            self.evict_down_to(target, EvictionReason::Pressure)
        });

        if !expired_keys.is_empty() || evicted > 0 {
            debug!(
                "Cache sweep: {} expired, {evicted} evicted, {:.1}% used",
                expired_keys.len(),
                self.memory_usage_pct()
            );
        }

        SweepReport {
            expired: expired_keys.len(),
            evicted,
        }
    }

    /// Evict worst-scoring entries until `incoming` more bytes fit. The
    /// number of attempts is bounded by the current entry count.
    fn ensure_capacity(&mut self, incoming: usize) -> bool {
        let max_attempts = self.entries.len() + 1;
        let mut attempts = 0;

        while self.total_size + incoming > self.max_memory && attempts < max_attempts {
            attempts += 1;
            if self.evict_one(EvictionReason::Capacity).is_none() {
                break;
            }
        }

        self.total_size + incoming <= self.max_memory
    }

    fn evict_down_to(&mut self, target: usize, reason: EvictionReason) -> usize {
        let max_attempts = self.entries.len();
        let mut evicted = 0;
        while self.total_size > target && evicted < max_attempts {
            if self.evict_one(reason).is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn evict_one(&mut self, reason: EvictionReason) -> Option<String> {
        let now = Instant::now();
        let victim = self
            .entries
            .values()
            .min_by(|a, b| {
                a.eviction_score(now)
                    .partial_cmp(&b.eviction_score(now))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.lru_tick.cmp(&b.lru_tick))
            })
            .map(|e| e.key.clone())?;

        let entry = self.remove_entry(&victim)?;
        self.evictions += 1;
        debug!(
            "Evicted `{victim}` ({} bytes, {} accesses, {reason:?})",
            entry.size_bytes, entry.access_count
        );
        self.notify(&victim, reason);
        Some(victim)
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.total_size -= entry.size_bytes;
        Some(entry)
    }

    fn notify(&self, key: &str, reason: EvictionReason) {
        if let Some(listener) = &self.on_evict {
            listener(key, reason);
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// On-disk form of an entry. Monotonic instants are converted to wall-clock
/// time on save and back on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry<T> {
    pub key: String,
    pub value: T,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
}

fn to_wall_clock(at: Instant, now: Instant, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    let age = now.saturating_duration_since(at);
    wall_now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

fn to_instant(at: DateTime<Utc>, now: Instant, wall_now: DateTime<Utc>) -> Instant {
    let age = (wall_now - at).to_std().unwrap_or(Duration::ZERO);
    now.checked_sub(age).unwrap_or(now)
}

/// Creation instant and TTL for a restored entry, or `None` when its
/// wall-clock lifetime is over. An entry older than the monotonic clock can
/// express is rebased to `now` with only its remaining TTL.
fn restored_lifetime(
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
    now: Instant,
    wall_now: DateTime<Utc>,
) -> Option<(Instant, Option<Duration>)> {
    let age = (wall_now - created_at).to_std().unwrap_or(Duration::ZERO);
    if ttl.is_some_and(|ttl| age >= ttl) {
        return None;
    }
    Some(match now.checked_sub(age) {
        Some(created) => (created, ttl),
        None => (now, ttl.map(|ttl| ttl.saturating_sub(age))),
    })
}

impl<T: Clone + ApproximateSize + Serialize + DeserializeOwned> BoundedImportanceCache<T> {
    /// Unexpired entries, least recently used first
    #[must_use]
    pub fn snapshot(&self) -> Vec<PersistedEntry<T>> {
        let now = Instant::now();
        let wall_now = Utc::now();

        let mut live: Vec<&CacheEntry<T>> = self
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .collect();
        live.sort_by_key(|e| e.lru_tick);

        live.into_iter()
            .map(|e| PersistedEntry {
                key: e.key.clone(),
                value: e.value.clone(),
                access_count: e.access_count,
                created_at: to_wall_clock(e.created_at, now, wall_now),
                last_access_at: to_wall_clock(e.last_access_at, now, wall_now),
                ttl_ms: e.ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect()
    }

    /// Load persisted entries, skipping expired ones. Entries still go
    /// through capacity checks. Returns how many were restored.
    pub fn restore(&mut self, entries: Vec<PersistedEntry<T>>) -> usize {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut restored = 0;

        for persisted in entries {
            let Some((created_at, ttl)) = restored_lifetime(
                persisted.created_at,
                persisted.ttl_ms.map(Duration::from_millis),
                now,
                wall_now,
            ) else {
                continue;
            };

            let key = persisted.key;
            let size = persisted.value.approximate_size();
            if size > self.max_memory {
                continue;
            }
            self.remove_entry(&key);
            if !self.ensure_capacity(size) {
                continue;
            }

            let tick = self.next_tick();
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    value: persisted.value,
                    size_bytes: size,
                    created_at,
                    access_count: persisted.access_count,
                    last_access_at: to_instant(persisted.last_access_at, now, wall_now),
                    ttl,
                    lru_tick: tick,
                },
            );
            self.total_size += size;
            restored += 1;
        }

        restored
    }

    /// Write a JSON snapshot to `path`, replacing it atomically
    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let entries = self.snapshot();
        let json = serde_json::to_vec(&entries)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(entries.len())
    }

    /// Restore from a JSON snapshot. A missing file restores nothing.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(path)?;
        let entries: Vec<PersistedEntry<T>> = serde_json::from_slice(&bytes)?;
        Ok(self.restore(entries))
    }
}
