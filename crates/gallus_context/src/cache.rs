//! Bounded extraction cache with TTL expiry and emergency eviction.
//!
//! Extraction results (including absent ones, which matter for the expensive
//! clinical-sign path) are cached under a short fingerprint of
//! `(text, kind)`. The cache never grows past its configured cap: `put`
//! sweeps first and drops the write if the sweep was not enough. A separate
//! emergency ceiling acts as a circuit breaker and clears everything.
//!
//! All multi-step sequences (read-check-then-write in `put`, the two-phase
//! `cleanup`, the emergency clear) run under one mutex; concurrent request
//! handlers share a single instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::extraction::{ExtractionKind, ScalarValue};

/// Width of the cache-key fingerprint, in hex characters.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Smallest number of entries the size trim will retain.
const CLEANUP_RETAIN_FLOOR: usize = 5;

/// One cached extraction result. `value` is `None` for a cached miss.
struct CacheEntry {
    value: Option<ScalarValue>,
    created_at: Instant,
}

struct CacheInner {
    enabled: bool,
    entries: HashMap<String, CacheEntry>,
}

/// Diagnostics snapshot for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

/// Bounded key→value store for extraction results.
pub struct ExtractionCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    ttl: Duration,
    emergency_ceiling: usize,
}

impl ExtractionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                enabled: config.enabled,
                entries: HashMap::new(),
            }),
            max_size: config.max_entries,
            ttl: Duration::from_secs(config.ttl_secs),
            emergency_ceiling: config.emergency_ceiling,
        }
    }

    /// Look up a cached extraction.
    ///
    /// Outer `None` is a miss; `Some(inner)` is a hit, where `inner` is the
    /// cached result (possibly a cached absence). An expired entry counts as
    /// a miss and is removed on the spot.
    pub fn get(&self, text: &str, kind: ExtractionKind) -> Option<Option<ScalarValue>> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("extraction cache mutex poisoned; recomputing without cache");
                let mut guard = poisoned.into_inner();
                guard.entries.clear();
                return None;
            }
        };

        if self.emergency_check(&mut inner) {
            return None;
        }

        let key = fingerprint(text, kind);
        let found = inner
            .entries
            .get(&key)
            .map(|entry| (entry.created_at.elapsed() <= self.ttl, entry.value.clone()));
        match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Insert an extraction result.
    ///
    /// No-op when caching is disabled or the text is empty. When the cache
    /// is full, a cleanup runs first; if it is still full afterwards the
    /// write is dropped rather than growing past the cap.
    pub fn put(&self, text: &str, kind: ExtractionKind, value: Option<ScalarValue>) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("extraction cache mutex poisoned; dropping write");
                let mut guard = poisoned.into_inner();
                guard.entries.clear();
                return;
            }
        };

        if self.emergency_check(&mut inner) {
            return;
        }
        if text.is_empty() {
            return;
        }

        if inner.entries.len() >= self.max_size {
            self.cleanup_locked(&mut inner);
        }
        if inner.entries.len() >= self.max_size {
            debug!(kind = kind.as_str(), "extraction cache full after cleanup; write dropped");
            return;
        }

        inner.entries.insert(
            fingerprint(text, kind),
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    /// Two-phase sweep: drop expired entries, then trim to the newest
    /// `max(5, max_size / 2)` if still over the cap.
    pub fn cleanup(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            self.cleanup_locked(&mut inner);
        }
    }

    /// Unconditionally clear the whole cache.
    pub fn emergency_cleanup(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let dropped = inner.entries.len();
            inner.entries.clear();
            warn!(dropped, "extraction cache emergency cleanup");
        }
    }

    /// Operator action: clear everything.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }

    /// Toggle caching at runtime. Disabling clears on the next operation.
    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.enabled = enabled;
        }
    }

    pub fn status(&self) -> CacheStatus {
        let (enabled, size) = match self.inner.lock() {
            Ok(inner) => (inner.enabled, inner.entries.len()),
            Err(_) => (false, 0),
        };
        CacheStatus {
            enabled,
            size,
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Circuit breaker, checked at the start of every cache operation.
    /// Returns true when the operation should stop (cache unusable).
    fn emergency_check(&self, inner: &mut CacheInner) -> bool {
        if !inner.enabled {
            if !inner.entries.is_empty() {
                let dropped = inner.entries.len();
                inner.entries.clear();
                warn!(dropped, "caching disabled at runtime; cache cleared");
            }
            return true;
        }
        if inner.entries.len() > self.emergency_ceiling {
            let dropped = inner.entries.len();
            inner.entries.clear();
            warn!(
                dropped,
                ceiling = self.emergency_ceiling,
                "extraction cache exceeded emergency ceiling; cleared"
            );
            return true;
        }
        false
    }

    fn cleanup_locked(&self, inner: &mut CacheInner) {
        // Phase 1: TTL sweep.
        let ttl = self.ttl;
        inner.entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);

        // Phase 2: size trim, keeping the newest entries. Recent
        // conversational context beats hit rate here. Trimming at capacity
        // (not only above it) is what admits the next write.
        if inner.entries.len() >= self.max_size {
            let keep = CLEANUP_RETAIN_FLOOR.max(self.max_size / 2);
            let mut by_recency: Vec<(String, Instant)> = inner
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.created_at))
                .collect();
            by_recency.sort_by(|a, b| b.1.cmp(&a.1));
            let keep_keys: std::collections::HashSet<String> =
                by_recency.into_iter().take(keep).map(|(key, _)| key).collect();
            inner.entries.retain(|key, _| keep_keys.contains(key));
            debug!(kept = inner.entries.len(), "extraction cache trimmed to newest entries");
        }
    }
}

/// Short fingerprint of `(text, kind)`. Truncated SHA-256; wide enough that
/// practical collisions (which would surface a wrong cached value) do not
/// occur.
fn fingerprint(text: &str, kind: ExtractionKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_HEX_LEN / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn config(max_entries: usize, ttl_secs: u64, emergency_ceiling: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            max_entries,
            ttl_secs,
            emergency_ceiling,
        }
    }

    fn age(days: u8) -> Option<ScalarValue> {
        Some(ScalarValue::Age(days))
    }

    #[test]
    fn hit_returns_cached_value() {
        let cache = ExtractionCache::new(&config(10, 60, 100));
        cache.put("21 jours", ExtractionKind::AgeDays, age(21));

        assert_eq!(cache.get("21 jours", ExtractionKind::AgeDays), Some(age(21)));
        assert_eq!(cache.get("autre texte", ExtractionKind::AgeDays), None);
    }

    #[test]
    fn cached_absence_is_a_hit() {
        let cache = ExtractionCache::new(&config(10, 60, 100));
        cache.put("tout va bien", ExtractionKind::Signs, None);

        // Outer Some = hit, inner None = we already know there is no sign
        assert_eq!(cache.get("tout va bien", ExtractionKind::Signs), Some(None));
    }

    #[test]
    fn same_text_different_kind_does_not_collide() {
        let cache = ExtractionCache::new(&config(10, 60, 100));
        cache.put("ross 308", ExtractionKind::Line, None);

        assert_eq!(cache.get("ross 308", ExtractionKind::Species), None);
    }

    #[test]
    fn size_never_exceeds_cap() {
        let cache = ExtractionCache::new(&config(10, 60, 100));
        for i in 0..50 {
            cache.put(&format!("texte {i}"), ExtractionKind::AgeDays, age(1));
            assert!(cache.status().size <= 10);
        }
    }

    #[test]
    fn put_at_capacity_trims_to_newest_half() {
        // Long TTL: cleanup's phase 1 removes nothing, phase 2 trims to 5
        let cache = ExtractionCache::new(&config(10, 3600, 100));
        for i in 0..10 {
            cache.put(&format!("texte {i}"), ExtractionKind::AgeDays, age(1));
        }
        assert_eq!(cache.status().size, 10);

        // Triggers cleanup: trimmed to max(5, 10/2) = 5, then the new write lands
        cache.put("texte neuf", ExtractionKind::AgeDays, age(2));
        assert_eq!(cache.status().size, 6);
        assert_eq!(cache.get("texte neuf", ExtractionKind::AgeDays), Some(age(2)));
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let cache = ExtractionCache::new(&config(10, 0, 100));
        cache.put("21 jours", ExtractionKind::AgeDays, age(21));

        sleep(Duration::from_millis(20));
        assert_eq!(cache.get("21 jours", ExtractionKind::AgeDays), None);
        // The expired entry was removed, not just hidden
        assert_eq!(cache.status().size, 0);
    }

    #[test]
    fn cleanup_keeps_newest_entries() {
        let cache = ExtractionCache::new(&config(10, 3600, 100));
        for i in 0..10 {
            cache.put(&format!("texte {i}"), ExtractionKind::AgeDays, age(i as u8));
            sleep(Duration::from_millis(2));
        }

        // Forces the size trim; the newest insertions survive
        cache.put("texte 10", ExtractionKind::AgeDays, age(10));
        assert_eq!(cache.get("texte 9", ExtractionKind::AgeDays), Some(age(9)));
        assert_eq!(cache.get("texte 0", ExtractionKind::AgeDays), None);
    }

    #[test]
    fn emergency_ceiling_clears_everything() {
        // Ceiling below max_size to force the breaker without overfilling
        let cache = ExtractionCache::new(&config(10, 3600, 3));
        for i in 0..4 {
            cache.put(&format!("texte {i}"), ExtractionKind::AgeDays, age(1));
        }
        // 4 > ceiling 3: the next operation trips the breaker and is aborted
        cache.put("encore", ExtractionKind::AgeDays, age(1));
        assert_eq!(cache.status().size, 0);
        assert_eq!(cache.get("encore", ExtractionKind::AgeDays), None);
    }

    #[test]
    fn runtime_disable_clears_on_next_operation() {
        let cache = ExtractionCache::new(&config(10, 3600, 100));
        cache.put("21 jours", ExtractionKind::AgeDays, age(21));
        assert_eq!(cache.status().size, 1);

        cache.set_enabled(false);
        assert_eq!(cache.get("21 jours", ExtractionKind::AgeDays), None);
        assert_eq!(cache.status().size, 0);

        // Writes stay no-ops while disabled
        cache.put("autre", ExtractionKind::AgeDays, age(3));
        assert_eq!(cache.status().size, 0);
    }

    #[test]
    fn disabled_by_config_is_inert() {
        let mut cfg = config(10, 3600, 100);
        cfg.enabled = false;
        let cache = ExtractionCache::new(&cfg);

        cache.put("21 jours", ExtractionKind::AgeDays, age(21));
        assert_eq!(cache.get("21 jours", ExtractionKind::AgeDays), None);
        assert_eq!(cache.status().size, 0);
        assert!(!cache.status().enabled);
    }

    #[test]
    fn empty_text_is_never_cached() {
        let cache = ExtractionCache::new(&config(10, 3600, 100));
        cache.put("", ExtractionKind::AgeDays, age(21));
        assert_eq!(cache.status().size, 0);
    }

    #[test]
    fn status_reports_configuration() {
        let cache = ExtractionCache::new(&config(25, 120, 100));
        let status = cache.status();
        assert!(status.enabled);
        assert_eq!(status.size, 0);
        assert_eq!(status.max_size, 25);
        assert_eq!(status.ttl_seconds, 120);
    }
}
