//! Atomic counters shared between an arena and the pool that owns it.
//!
//! Mirrors the shape of Netty's `PoolArenaMetric`/`PoolChunkListMetric`:
//! plain running totals, read with `Relaxed` ordering since they are
//! diagnostic, not used for synchronization.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Running allocated/freed/peak/current byte counts for one resource class.
#[derive(Debug, Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatCountSnapshot {
        StatCountSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatCountSnapshot {
    pub allocated: i64,
    pub freed: i64,
    pub peak: i64,
    pub current: i64,
}

/// A plain event counter (cache hits/misses, chunks created, ...).
#[derive(Debug, Default)]
pub struct StatCounter {
    count: AtomicU64,
}

impl StatCounter {
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Pool-wide and per-arena statistics threaded through the allocate/free paths.
///
/// Not part of the allocation fast path's correctness — purely observational,
/// per §B of SPEC_FULL.md.
#[derive(Debug, Default)]
pub struct ArenaStats {
    pub bytes_allocated: StatCount,
    pub chunks_created: StatCounter,
    pub chunks_released: StatCounter,
    pub cache_hits: StatCounter,
    pub cache_misses: StatCounter,
    pub huge_allocations: StatCounter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_count_tracks_current_and_peak() {
        let s = StatCount::default();
        s.increase(100);
        s.increase(50);
        s.decrease(30);
        let snap = s.snapshot();
        assert_eq!(snap.current, 120);
        assert_eq!(snap.peak, 150);
        assert_eq!(snap.allocated, 150);
        assert_eq!(snap.freed, 30);
    }

    #[test]
    fn stat_counter_counts_events() {
        let c = StatCounter::default();
        c.increment();
        c.increment();
        assert_eq!(c.get(), 2);
    }
}
