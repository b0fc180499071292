//! Dead-thread cache registry and cleanup sweep, §4.4 / §9.
//!
//! Each thread's `ThreadCache` is registered here, paired with the arena it
//! was routed to, by a `Weak` reference when the thread first allocates. A
//! background sweep thread wakes up every `cache_cleanup_interval_ms` and
//! prunes any entry whose owning thread has exited (`Weak::upgrade` fails).
//! Live caches are left alone here — their periodic trim is allocation-count
//! driven and happens inline in `ThreadCache::pop` (§4.4) — and the sweep
//! self-descends once the registry is empty, re-armed the next time a thread
//! registers a fresh cache (§9 "self-descheduling cleanup").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::thread_cache::ThreadCache;

struct Entry {
    arena: Arc<Arena>,
    cache: Weak<ThreadCache>,
}

pub struct Registry {
    entries: Mutex<Vec<Entry>>,
    running: AtomicBool,
    interval: Duration,
}

impl Registry {
    pub fn new(cleanup_interval_ms: u64) -> Arc<Registry> {
        Arc::new(Registry {
            entries: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            interval: Duration::from_millis(cleanup_interval_ms.max(1)),
        })
    }

    /// Registers a new thread's cache and arms the sweep thread if it isn't
    /// already running.
    pub fn register(self: &Arc<Self>, arena: Arc<Arena>, cache: &Arc<ThreadCache>) {
        self.entries.lock().push(Entry {
            arena,
            cache: Arc::downgrade(cache),
        });
        if !self.running.swap(true, Ordering::AcqRel) {
            self.spawn_sweep();
        }
    }

    /// Drains every still-live cache (allocator shutdown) straight back into
    /// its arena.
    pub fn drain_all(&self) {
        let entries = self.entries.lock();
        for e in entries.iter() {
            if let Some(cache) = e.cache.upgrade() {
                for entry in cache.drain_all() {
                    e.arena.free(entry.chunk_idx, entry.handle, entry.class);
                }
            }
        }
    }

    /// Reaps dead thread caches only. Per-thread trimming of *live* caches
    /// is allocation-count-driven and happens inline in `ThreadCache::pop`
    /// (§4.4) — the sweep does not force a trim on threads that are still
    /// allocating.
    fn sweep_once(self: &Arc<Self>) -> bool {
        let mut entries = self.entries.lock();
        let mut dead = 0;
        entries.retain(|e| {
            if e.cache.upgrade().is_some() {
                true
            } else {
                dead += 1;
                false
            }
        });
        if dead > 0 {
            debug!("registry: pruned {dead} dead thread caches");
        }
        entries.is_empty()
    }

    fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(registry.interval);
            if registry.sweep_once() {
                registry.running.store(false, Ordering::Release);
                break;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::os::HeapChunkProvider;
    use crate::size_class;

    fn test_arena(cfg: &PoolConfig) -> Arc<Arena> {
        Arc::new(Arena::new(
            cfg.page_size,
            cfg.max_order,
            false,
            size_class::num_small_classes(cfg.page_size),
            Box::new(HeapChunkProvider),
        ))
    }

    #[test]
    fn register_and_drain_sees_live_cache() {
        let cfg = PoolConfig::default();
        let registry = Registry::new(50);
        let cache = Arc::new(ThreadCache::new(&cfg));
        registry.register(test_arena(&cfg), &cache);
        registry.drain_all(); // should not panic with an empty cache
    }

    #[test]
    fn sweep_prunes_dropped_caches() {
        let cfg = PoolConfig::default();
        let registry = Registry::new(20);
        {
            let cache = Arc::new(ThreadCache::new(&cfg));
            registry.register(test_arena(&cfg), &cache);
        } // cache dropped here, only the registry's Weak remains
        assert!(registry.sweep_once());
    }
}
