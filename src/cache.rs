// Score Cache - memoizes expensive, time-sensitive derived scores
//
// Keys combine the layer, coordinates rounded to ~11 m, and a time bucket
// whose granularity depends on the layer. Entries disappear on TTL expiry
// or dependency-tag invalidation, whichever comes first. One coarse lock
// guards the whole store; the cache is a constructed component with an
// explicit lifecycle, never ambient global state.

use crate::error::Result;
use crate::normalize::round_coord;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

// ============================================================================
// LAYER TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    /// Location+time spending-propensity index; varies slowly within an hour
    SpendingPropensity,

    /// Crowd-energy index derived from foot traffic and sentiment
    CrowdEnergy,

    /// Demand layer sensitive to calendar effects (day, month, weekday)
    CalendarDemand,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::SpendingPropensity => "spending_propensity",
            LayerType::CrowdEnergy => "crowd_energy",
            LayerType::CalendarDemand => "calendar_demand",
        }
    }

    /// Per-layer TTL, independent of (and on top of) tag invalidation.
    pub fn ttl(&self) -> Duration {
        match self {
            LayerType::SpendingPropensity => Duration::hours(1),
            LayerType::CrowdEnergy => Duration::hours(1),
            LayerType::CalendarDemand => Duration::hours(2),
        }
    }

    /// Time-bucket component of the cache key.
    fn time_bucket(&self, t: DateTime<Utc>) -> String {
        let weekday = t.weekday().num_days_from_monday();
        match self {
            LayerType::SpendingPropensity | LayerType::CrowdEnergy => {
                format!("h{}_wd{}", t.hour(), weekday)
            }
            LayerType::CalendarDemand => {
                format!("h{}_d{}_m{}_wd{}", t.hour(), t.day(), t.month(), weekday)
            }
        }
    }

    fn dependency_tags(&self, lat: f64, lng: f64, t: DateTime<Utc>) -> Vec<String> {
        let mut tags = vec![
            format!("layer_{}", self.as_str()),
            format!("time_hour_{}", t.hour()),
            format!("time_weekday_{}", t.weekday().num_days_from_monday()),
            format!("location_{:.4}_{:.4}", round_coord(lat), round_coord(lng)),
        ];
        if *self == LayerType::CalendarDemand {
            tags.push(format!("time_day_{}", t.day()));
            tags.push(format!("time_month_{}", t.month()));
        }
        tags
    }
}

// ============================================================================
// CONFIG + ENTRY
// ============================================================================

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Minimum gap between full invalidation sweeps, to avoid thrash under
    /// bursty triggers
    pub min_full_sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            min_full_sweep_interval: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: f64,
    dependency_tags: Vec<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    last_full_sweep: Option<DateTime<Utc>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// ============================================================================
// SCORE CACHE
// ============================================================================

pub struct ScoreCache {
    pub config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ScoreCache {
    pub fn new() -> Self {
        ScoreCache {
            config: CacheConfig::default(),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn with_config(config: CacheConfig) -> Self {
        ScoreCache {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn cache_key(layer: LayerType, lat: f64, lng: f64, t: DateTime<Utc>) -> String {
        format!(
            "{}|{:.4}|{:.4}|{}",
            layer.as_str(),
            round_coord(lat),
            round_coord(lng),
            layer.time_bucket(t)
        )
    }

    /// Return the cached value for (layer, location, time bucket), invoking
    /// `compute` only on a miss. A miss is never an error.
    pub fn get_or_compute<F>(
        &self,
        layer: LayerType,
        lat: f64,
        lng: f64,
        t: DateTime<Utc>,
        compute: F,
    ) -> Result<f64>
    where
        F: FnOnce() -> Result<f64>,
    {
        self.get_or_compute_at(Utc::now(), layer, lat, lng, t, compute)
    }

    /// Clock-injected variant so TTL expiry is testable without sleeping.
    pub fn get_or_compute_at<F>(
        &self,
        now: DateTime<Utc>,
        layer: LayerType,
        lat: f64,
        lng: f64,
        t: DateTime<Utc>,
        compute: F,
    ) -> Result<f64>
    where
        F: FnOnce() -> Result<f64>,
    {
        let key = Self::cache_key(layer, lat, lng, t);
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get(&key) {
            if entry.expires_at > now {
                let value = entry.value;
                inner.hits += 1;
                return Ok(value);
            }
        }
        if inner.entries.remove(&key).is_some() {
            inner.evictions += 1;
        }

        inner.misses += 1;
        let value = compute()?;
        debug!(key = %key, value, "computed and cached layer score");
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                dependency_tags: layer.dependency_tags(lat, lng, t),
                expires_at: now + layer.ttl(),
            },
        );
        Ok(value)
    }

    /// Remove every entry whose tag set contains `tag`. Callers never need
    /// to know individual keys.
    pub fn invalidate_by_dependency(&self, tag: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| !entry.dependency_tags.iter().any(|t| t == tag));
        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        if removed > 0 {
            debug!(tag, removed, "invalidated cache entries by dependency");
        }
        removed
    }

    /// Drop entries from every hour bucket except the current one. The
    /// orchestrator calls this when a refresh cycle crosses an hour boundary.
    pub fn invalidate_time_tags(&self, now: DateTime<Utc>) -> usize {
        let current = now.hour();
        let mut removed = 0;
        for hour in 0..24 {
            if hour != current {
                removed += self.invalidate_by_dependency(&format!("time_hour_{}", hour));
            }
        }
        removed
    }

    /// Unconditional full reset. Nothing stale survives this call.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.evictions += dropped as u64;
        info!(dropped, "score cache cleared");
    }

    /// Gated full sweep: returns false (and does nothing) when invoked again
    /// within the configured minimum interval.
    pub fn recalculate_all(&self) -> bool {
        self.recalculate_all_at(Utc::now())
    }

    pub fn recalculate_all_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if let Some(last) = inner.last_full_sweep {
            if now - last < self.config.min_full_sweep_interval {
                debug!("full cache sweep skipped: within minimum interval");
                return false;
            }
        }

        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.evictions += dropped as u64;
        inner.last_full_sweep = Some(now);
        info!(dropped, "full cache sweep completed");
        true
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

impl Default for ScoreCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::Cell;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_compute_invoked_once_within_ttl() {
        let cache = ScoreCache::new();
        let calls = Cell::new(0);
        let t = at(14);

        let v1 = cache
            .get_or_compute_at(t, LayerType::SpendingPropensity, 39.1012, -94.5844, t, || {
                calls.set(calls.get() + 1);
                Ok(0.42)
            })
            .unwrap();
        let v2 = cache
            .get_or_compute_at(t, LayerType::SpendingPropensity, 39.1012, -94.5844, t, || {
                calls.set(calls.get() + 1);
                Ok(0.99)
            })
            .unwrap();

        assert_eq!(v1, 0.42);
        assert_eq!(v2, 0.42);
        assert_eq!(calls.get(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_ttl_expiry_forces_recompute() {
        let cache = ScoreCache::new();
        let calls = Cell::new(0);
        let t = at(14);

        let mut compute = || {
            calls.set(calls.get() + 1);
            Ok(0.5)
        };

        cache
            .get_or_compute_at(t, LayerType::SpendingPropensity, 39.1, -94.58, t, &mut compute)
            .unwrap();
        // 2 h later: the 1 h TTL has lapsed even though the bucket key is
        // derived from the same requested time
        cache
            .get_or_compute_at(
                t + Duration::hours(2),
                LayerType::SpendingPropensity,
                39.1,
                -94.58,
                t,
                &mut compute,
            )
            .unwrap();

        assert_eq!(calls.get(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_by_hour_tag_is_targeted() {
        let cache = ScoreCache::new();
        let t14 = at(14);
        let t15 = at(15);

        cache
            .get_or_compute_at(t14, LayerType::SpendingPropensity, 39.1, -94.58, t14, || Ok(0.1))
            .unwrap();
        cache
            .get_or_compute_at(t15, LayerType::SpendingPropensity, 39.1, -94.58, t15, || Ok(0.2))
            .unwrap();

        let removed = cache.invalidate_by_dependency("time_hour_14");
        assert_eq!(removed, 1);

        // Hour 15 entry still served from cache
        let calls = Cell::new(0);
        let v = cache
            .get_or_compute_at(t15, LayerType::SpendingPropensity, 39.1, -94.58, t15, || {
                calls.set(calls.get() + 1);
                Ok(0.9)
            })
            .unwrap();
        assert_eq!(v, 0.2);
        assert_eq!(calls.get(), 0);

        // Hour 14 entry recomputes
        let v = cache
            .get_or_compute_at(t14, LayerType::SpendingPropensity, 39.1, -94.58, t14, || Ok(0.7))
            .unwrap();
        assert_eq!(v, 0.7);
    }

    #[test]
    fn test_bucket_granularity_per_layer() {
        // Same hour and weekday one week apart: the hour+weekday layers
        // share a bucket, the calendar layer does not
        let a = Utc.with_ymd_and_hms(2026, 3, 3, 14, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();

        assert_eq!(
            ScoreCache::cache_key(LayerType::SpendingPropensity, 39.1, -94.58, a),
            ScoreCache::cache_key(LayerType::SpendingPropensity, 39.1, -94.58, b),
        );
        assert_ne!(
            ScoreCache::cache_key(LayerType::CalendarDemand, 39.1, -94.58, a),
            ScoreCache::cache_key(LayerType::CalendarDemand, 39.1, -94.58, b),
        );
    }

    #[test]
    fn test_coordinate_rounding_shares_keys() {
        // ~6 m apart: identical at 4-decimal precision
        let t = at(14);
        assert_eq!(
            ScoreCache::cache_key(LayerType::CrowdEnergy, 39.10121, -94.58441, t),
            ScoreCache::cache_key(LayerType::CrowdEnergy, 39.101222, -94.584422, t),
        );
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = ScoreCache::new();
        let t = at(14);

        cache
            .get_or_compute_at(t, LayerType::CrowdEnergy, 39.1, -94.58, t, || Ok(0.3))
            .unwrap();
        cache.clear();

        assert_eq!(cache.stats().entries, 0);

        let calls = Cell::new(0);
        cache
            .get_or_compute_at(t, LayerType::CrowdEnergy, 39.1, -94.58, t, || {
                calls.set(calls.get() + 1);
                Ok(0.3)
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_recalculate_all_enforces_minimum_interval() {
        let cache = ScoreCache::new();
        let t = at(14);

        assert!(cache.recalculate_all_at(t));
        // Bursty retrigger inside the 5-minute window is a no-op
        assert!(!cache.recalculate_all_at(t + Duration::minutes(2)));
        assert!(cache.recalculate_all_at(t + Duration::minutes(6)));
    }

    #[test]
    fn test_invalidate_time_tags_keeps_current_hour() {
        let cache = ScoreCache::new();
        let t14 = at(14);
        let t15 = at(15);

        cache
            .get_or_compute_at(t14, LayerType::SpendingPropensity, 39.1, -94.58, t14, || Ok(0.1))
            .unwrap();
        cache
            .get_or_compute_at(t15, LayerType::SpendingPropensity, 39.1, -94.58, t15, || Ok(0.2))
            .unwrap();

        let removed = cache.invalidate_time_tags(t15);
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().entries, 1);
    }
}
