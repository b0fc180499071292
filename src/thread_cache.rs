//! ThreadCache — per-thread front end to an arena, §4.4.
//!
//! Every thread that allocates gets its own `ThreadCache`, bucketed the same
//! way as the arena's lists (32 tiny classes, `num_small_classes` small
//! classes, one queue per normal order). A hit here never touches the
//! arena's lock; a miss falls through to `Arena::allocate`/`Arena::free`.
//!
//! Real lock-freedom would need an SPSC/MPSC ring buffer per class; this
//! crate uses a plain `VecDeque` behind a `parking_lot::Mutex` instead; the
//! mutex is uncontended in the overwhelmingly common case (only the owning
//! thread touches it) and only sees real contention from the periodic
//! dead-thread sweep in `registry.rs`, so the two-tier cache/arena split
//! still does its job of keeping the arena lock off the hot path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::handle::Handle;
use crate::size_class::{self, SizeClass, SizeClassKind};

#[derive(Clone, Copy)]
pub struct CacheEntry {
    pub chunk_idx: usize,
    pub handle: Handle,
    pub class: SizeClass,
}

struct Queue {
    entries: VecDeque<CacheEntry>,
    capacity: usize,
}

impl Queue {
    fn new(capacity: usize) -> Queue {
        Queue {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    fn pop(&mut self) -> Option<CacheEntry> {
        self.entries.pop_front()
    }

    fn push(&mut self, entry: CacheEntry) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    fn trim_half(&mut self) -> Vec<CacheEntry> {
        let target = self.entries.len() / 2;
        let mut drained = Vec::with_capacity(self.entries.len() - target);
        while self.entries.len() > target {
            if let Some(e) = self.entries.pop_back() {
                drained.push(e);
            }
        }
        drained
    }
}

pub struct ThreadCacheInner {
    tiny: Vec<Queue>,
    small: Vec<Queue>,
    normal: Vec<Queue>,
    /// Allocations served (hit or miss) since the last trim, §4.4 "periodic
    /// trim": once this reaches `trim_interval`, `pop` halves every queue.
    allocations: usize,
}

/// Guarded for the cleanup sweep in `registry.rs`, which runs on a different
/// thread than the owner; the owning thread pays an uncontended-lock cost on
/// every hit (§ top-of-file note).
pub struct ThreadCache {
    inner: Mutex<ThreadCacheInner>,
    trim_interval: usize,
}

impl ThreadCache {
    pub fn new(cfg: &PoolConfig) -> ThreadCache {
        let num_small = size_class::num_small_classes(cfg.page_size);
        ThreadCache {
            inner: Mutex::new(ThreadCacheInner {
                tiny: (0..=size_class::TINY_CLASSES)
                    .map(|_| Queue::new(cfg.tiny_cache_size))
                    .collect(),
                small: (0..num_small)
                    .map(|_| Queue::new(cfg.small_cache_size))
                    .collect(),
                normal: (0..=cfg.max_order as usize)
                    .map(|_| Queue::new(cfg.normal_cache_size))
                    .collect(),
                allocations: 0,
            }),
            trim_interval: (cfg.cache_trim_interval as usize).max(1),
        }
    }

    fn queue_for(inner: &mut ThreadCacheInner, class: SizeClass) -> Option<&mut Queue> {
        match class.kind {
            SizeClassKind::Tiny => inner.tiny.get_mut(class.index),
            SizeClassKind::Small => inner.small.get_mut(class.index),
            SizeClassKind::Normal => inner.normal.get_mut(class.index),
            SizeClassKind::Huge => None,
        }
    }

    fn trim_half_all(inner: &mut ThreadCacheInner) -> Vec<CacheEntry> {
        let mut drained = Vec::new();
        let ThreadCacheInner { tiny, small, normal, .. } = inner;
        for q in tiny.iter_mut().chain(small.iter_mut()).chain(normal.iter_mut()) {
            drained.extend(q.trim_half());
        }
        drained
    }

    /// §4.4 "pop": lock-free fast path from the caller's point of view (no
    /// arena lock touched either way). Counts toward the per-thread trim
    /// trigger; once `cache_trim_interval` allocations have been served
    /// since the last trim, halves every queue and hands back what it
    /// evicted (entries not served since the last trim) so the caller can
    /// free each one back to its arena.
    pub fn pop(&self, class: SizeClass) -> (Option<CacheEntry>, Vec<CacheEntry>) {
        let mut inner = self.inner.lock();
        let hit = Self::queue_for(&mut inner, class).and_then(Queue::pop);
        inner.allocations += 1;
        let trimmed = if inner.allocations >= self.trim_interval {
            inner.allocations = 0;
            Self::trim_half_all(&mut inner)
        } else {
            Vec::new()
        };
        (hit, trimmed)
    }

    /// §4.4 "push". Returns `false` (cache declined the entry, caller must
    /// free to the arena) when the class's queue is already full.
    pub fn push(&self, class: SizeClass, entry: CacheEntry) -> bool {
        let mut inner = self.inner.lock();
        match Self::queue_for(&mut inner, class) {
            Some(q) => q.push(entry),
            None => false,
        }
    }

    /// Drains every queue outright (thread death or allocator shutdown).
    pub fn drain_all(&self) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        let ThreadCacheInner { tiny, small, normal, .. } = &mut *inner;
        for q in tiny.iter_mut().chain(small.iter_mut()).chain(normal.iter_mut()) {
            while let Some(e) = q.pop() {
                drained.push(e);
            }
        }
        drained
    }
}

/// Round-robins newly created thread caches across an arena array, §3
/// "Router". Each `PooledAllocator` owns one `Router` per heap/direct pair.
pub struct Router {
    next: AtomicUsize,
}

impl Router {
    pub fn new() -> Router {
        Router {
            next: AtomicUsize::new(0),
        }
    }

    /// Assigns the next thread to one of `num_arenas` arenas.
    pub fn assign(&self, num_arenas: usize) -> usize {
        debug_assert!(num_arenas > 0);
        self.next.fetch_add(1, Ordering::Relaxed) % num_arenas
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_round_robins_across_arenas() {
        let router = Router::new();
        let assignments: Vec<usize> = (0..6).map(|_| router.assign(3)).collect();
        assert_eq!(assignments, vec![0, 1, 2, 0, 1, 2]);
    }

    fn class(kind: SizeClassKind, index: usize) -> SizeClass {
        SizeClass { kind, index, size: 32 }
    }

    #[test]
    fn push_then_pop_returns_same_entry() {
        let cfg = PoolConfig::default();
        let cache = ThreadCache::new(&cfg);
        let c = class(SizeClassKind::Tiny, 2);
        let entry = CacheEntry {
            chunk_idx: 0,
            handle: Handle::Subpage { node_id: 5, bitmap_idx: 1 },
            class: c,
        };
        assert!(cache.push(c, entry));
        let (popped, trimmed) = cache.pop(c);
        let popped = popped.unwrap();
        assert_eq!(popped.chunk_idx, entry.chunk_idx);
        assert_eq!(popped.handle, entry.handle);
        assert!(trimmed.is_empty());
    }

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let cfg = PoolConfig::default();
        let cache = ThreadCache::new(&cfg);
        let (hit, trimmed) = cache.pop(class(SizeClassKind::Small, 0));
        assert!(hit.is_none());
        assert!(trimmed.is_empty());
    }

    #[test]
    fn tiny_class_at_the_top_index_does_not_panic() {
        // classify() can hand back tiny index 32 (the top of 1..=32); the
        // cache's tiny table must have a slot for it.
        let cfg = PoolConfig::default();
        let cache = ThreadCache::new(&cfg);
        let c = class(SizeClassKind::Tiny, 32);
        let entry = CacheEntry {
            chunk_idx: 0,
            handle: Handle::Normal { node_id: 1 },
            class: c,
        };
        assert!(cache.push(c, entry));
        let (hit, _) = cache.pop(c);
        assert!(hit.is_some());
    }

    #[test]
    fn pop_triggers_trim_once_the_allocation_interval_is_reached() {
        let mut cfg = PoolConfig::default();
        cfg.cache_trim_interval = 4;
        cfg.tiny_cache_size = 16;
        let cache = ThreadCache::new(&cfg);
        let c = class(SizeClassKind::Tiny, 1);
        for i in 0..6u32 {
            cache.push(
                c,
                CacheEntry {
                    chunk_idx: 0,
                    handle: Handle::Normal { node_id: i },
                    class: c,
                },
            );
        }
        let mut trimmed_total = Vec::new();
        for _ in 0..4 {
            let (_, trimmed) = cache.pop(class(SizeClassKind::Small, 0));
            trimmed_total.extend(trimmed);
        }
        assert!(
            !trimmed_total.is_empty(),
            "expected a trim after reaching cache_trim_interval allocations"
        );
    }

    #[test]
    fn push_respects_capacity() {
        let mut cfg = PoolConfig::default();
        cfg.tiny_cache_size = 2;
        let cache = ThreadCache::new(&cfg);
        let c = class(SizeClassKind::Tiny, 0);
        let entry = CacheEntry {
            chunk_idx: 0,
            handle: Handle::Normal { node_id: 1 },
            class: c,
        };
        assert!(cache.push(c, entry));
        assert!(cache.push(c, entry));
        assert!(!cache.push(c, entry));
    }

    #[test]
    fn drain_all_empties_every_queue() {
        let cfg = PoolConfig::default();
        let cache = ThreadCache::new(&cfg);
        let c = class(SizeClassKind::Tiny, 0);
        let entry = CacheEntry {
            chunk_idx: 0,
            handle: Handle::Normal { node_id: 1 },
            class: c,
        };
        cache.push(c, entry);
        let drained = cache.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(cache.pop(c).0.is_none());
    }
}
