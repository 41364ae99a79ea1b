//! Dispatch statistics.
//!
//! Counters for the hot path and for cache maintenance, for monitoring and
//! tuning cache sizes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by an engine.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    // =========================================================================
    // Hot Path
    // =========================================================================
    call_cache_hits: AtomicU64,
    call_cache_misses: AtomicU64,
    exact_table_hits: AtomicU64,
    slow_lookups: AtomicU64,

    // =========================================================================
    // Maintenance
    // =========================================================================
    compilations: AtomicU64,
    invalidations: AtomicU64,
    promotions: AtomicU64,
    abandoned_promotions: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn record_call_cache_hit(&self) {
        self.call_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_call_cache_miss(&self) {
        self.call_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_exact_table_hit(&self) {
        self.exact_table_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_slow_lookup(&self) {
        self.slow_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned_promotion(&self) {
        self.abandoned_promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub(crate) fn snapshot(&self) -> EngineStats {
        EngineStats {
            call_cache_hits: self.call_cache_hits.load(Ordering::Relaxed),
            call_cache_misses: self.call_cache_misses.load(Ordering::Relaxed),
            exact_table_hits: self.exact_table_hits.load(Ordering::Relaxed),
            slow_lookups: self.slow_lookups.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            abandoned_promotions: self.abandoned_promotions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls answered by the call-site cache.
    pub call_cache_hits: u64,
    /// Calls that missed the call-site cache.
    pub call_cache_misses: u64,
    /// Call-site misses answered by the exact argument-type table.
    pub exact_table_hits: u64,
    /// Lookups that missed every cache and ran method matching.
    pub slow_lookups: u64,
    /// Code instances compiled.
    pub compilations: u64,
    /// Code instances whose window was clipped.
    pub invalidations: u64,
    /// Successful promotions to the current world.
    pub promotions: u64,
    /// Promotions abandoned because a new world appeared.
    pub abandoned_promotions: u64,
}

impl EngineStats {
    /// Fraction of calls answered by the call-site cache.
    pub fn call_cache_hit_rate(&self) -> f64 {
        let total = self.call_cache_hits + self.call_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.call_cache_hits as f64 / total as f64
        }
    }
}
