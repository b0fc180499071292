//! `PooledAllocator` — the crate's public entry point.
//!
//! Wires a set of heap arenas and a set of direct (off-heap) arenas, each
//! behind its own `Router`, to the per-thread caches a calling thread picks
//! up the first time it allocates. §3 "Data flow": `new_*_buffer` tries the
//! calling thread's cache first, falls through to its assigned arena on a
//! miss, and registers the cache with the cleanup `Registry` the first time
//! it is created.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::{Allocation, Arena};
use crate::buffer::PooledBuffer;
use crate::config::PoolConfig;
use crate::error::PoolResult;
use crate::os::{ChunkProvider, DirectChunkProvider, HeapChunkProvider};
use crate::registry::Registry;
use crate::size_class::{self, classify, SizeClass, SizeClassKind};
use crate::thread_cache::{Router, ThreadCache};

struct ThreadSlot {
    heap: (Arc<ThreadCache>, usize),
    direct: (Arc<ThreadCache>, usize),
}

thread_local! {
    static SLOTS: RefCell<HashMap<usize, ThreadSlot>> = RefCell::new(HashMap::new());
}

pub struct PooledAllocator {
    cfg: PoolConfig,
    heap_arenas: Vec<Arc<Arena>>,
    direct_arenas: Vec<Arc<Arena>>,
    heap_router: Router,
    direct_router: Router,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("cfg", &self.cfg)
            .field("heap_arenas", &self.heap_arenas.len())
            .field("direct_arenas", &self.direct_arenas.len())
            .finish_non_exhaustive()
    }
}

impl PooledAllocator {
    pub fn new(cfg: PoolConfig) -> PoolResult<Arc<PooledAllocator>> {
        cfg.validate()?;
        let num_small = size_class::num_small_classes(cfg.page_size);
        let heap_arenas = (0..cfg.num_heap_arenas.max(1))
            .map(|_| {
                Arc::new(Arena::new(
                    cfg.page_size,
                    cfg.max_order,
                    false,
                    num_small,
                    Box::new(HeapChunkProvider) as Box<dyn ChunkProvider>,
                ))
            })
            .collect();
        let direct_arenas = (0..cfg.num_direct_arenas.max(1))
            .map(|_| {
                Arc::new(Arena::new(
                    cfg.page_size,
                    cfg.max_order,
                    true,
                    num_small,
                    Box::new(DirectChunkProvider) as Box<dyn ChunkProvider>,
                ))
            })
            .collect();
        let registry = Registry::new(cfg.cache_cleanup_interval_ms);
        Ok(Arc::new(PooledAllocator {
            cfg,
            heap_arenas,
            direct_arenas,
            heap_router: Router::new(),
            direct_router: Router::new(),
            registry,
        }))
    }

    pub fn new_heap_buffer(
        self: &Arc<Self>,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> PoolResult<PooledBuffer> {
        self.new_buffer(initial_capacity, max_capacity, false)
    }

    pub fn new_direct_buffer(
        self: &Arc<Self>,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> PoolResult<PooledBuffer> {
        self.new_buffer(initial_capacity, max_capacity, true)
    }

    /// §6 `is_direct_pooled()`: whether this allocator was configured with
    /// any direct arenas at all (Netty `isDirectBufferPooled()` ==
    /// `directArenas != null`), not a per-request query.
    pub fn is_direct_pooled(&self) -> bool {
        self.cfg.num_direct_arenas > 0
    }

    /// Drains every still-live thread cache back into its arena. Dropping
    /// the last `Arc<PooledAllocator>` afterwards releases the arenas'
    /// chunks in turn (§B "explicit shutdown").
    pub fn shutdown(&self) {
        self.registry.drain_all();
    }

    fn arenas(&self, is_direct: bool) -> &[Arc<Arena>] {
        if is_direct {
            &self.direct_arenas
        } else {
            &self.heap_arenas
        }
    }

    fn thread_cache(self: &Arc<Self>, is_direct: bool) -> (Arc<ThreadCache>, Arc<Arena>) {
        let key = Arc::as_ptr(self) as usize;
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.entry(key).or_insert_with(|| {
                let heap_idx = self.heap_router.assign(self.heap_arenas.len());
                let direct_idx = self.direct_router.assign(self.direct_arenas.len());
                let heap_cache = Arc::new(ThreadCache::new(&self.cfg));
                let direct_cache = Arc::new(ThreadCache::new(&self.cfg));
                self.registry
                    .register(Arc::clone(&self.heap_arenas[heap_idx]), &heap_cache);
                self.registry
                    .register(Arc::clone(&self.direct_arenas[direct_idx]), &direct_cache);
                ThreadSlot {
                    heap: (heap_cache, heap_idx),
                    direct: (direct_cache, direct_idx),
                }
            });
            let (cache, idx) = if is_direct { &slot.direct } else { &slot.heap };
            let arena = Arc::clone(&self.arenas(is_direct)[*idx]);
            (Arc::clone(cache), arena)
        })
    }

    fn new_buffer(
        self: &Arc<Self>,
        initial_capacity: usize,
        max_capacity: usize,
        is_direct: bool,
    ) -> PoolResult<PooledBuffer> {
        let initial_capacity = initial_capacity.max(1);
        let max_capacity = max_capacity.max(initial_capacity);
        let chunk_size = self.cfg.chunk_size();
        let (cache, arena) = self.thread_cache(is_direct);

        // §7 "Overflow": a ceiling past what any chunk can ever hold can
        // never be served from the pool, regardless of how small the
        // initial request is — route straight to the unpooled huge path.
        if max_capacity > chunk_size {
            arena.stats.huge_allocations.increment();
            let class = SizeClass {
                kind: SizeClassKind::Huge,
                index: 0,
                size: initial_capacity,
            };
            return match arena.allocate(class, initial_capacity)? {
                Allocation::Huge { storage } => Ok(PooledBuffer::huge(storage)),
                Allocation::Pooled { .. } => unreachable!("huge class never yields a pooled allocation"),
            };
        }

        let class = classify(&self.cfg, initial_capacity);

        if class.kind != SizeClassKind::Huge {
            let (hit, trimmed) = cache.pop(class);
            for entry in trimmed {
                arena.free(entry.chunk_idx, entry.handle, entry.class);
            }
            if let Some(entry) = hit {
                arena.stats.cache_hits.increment();
                let ptr = arena.raw_ptr_for(entry.chunk_idx, entry.handle, class.size);
                let cacheable = class.size <= self.cfg.max_cached_buffer_capacity;
                return Ok(PooledBuffer::pooled(
                    arena,
                    cache,
                    cacheable,
                    entry.chunk_idx,
                    entry.handle,
                    class,
                    ptr,
                    class.size,
                ));
            }
        }

        match arena.allocate(class, initial_capacity)? {
            Allocation::Huge { storage } => Ok(PooledBuffer::huge(storage)),
            Allocation::Pooled {
                chunk_idx,
                handle,
                class,
            } => {
                let ptr = arena.raw_ptr_for(chunk_idx, handle, class.size);
                let cacheable = class.size <= self.cfg.max_cached_buffer_capacity;
                Ok(PooledBuffer::pooled(
                    arena, cache, cacheable, chunk_idx, handle, class, ptr, class.size,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocation_is_pooled_and_round_trips() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let mut buf = allocator.new_heap_buffer(128, 128).unwrap();
        assert_eq!(buf.len(), 128);
        buf.as_mut_slice().fill(7);
        assert!(buf.as_slice().iter().all(|&b| b == 7));
    }

    #[test]
    fn freeing_and_reallocating_the_same_size_reuses_the_cache() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let buf = allocator.new_heap_buffer(64, 64).unwrap();
        drop(buf);
        let buf2 = allocator.new_heap_buffer(64, 64).unwrap();
        assert_eq!(buf2.len(), 64);
    }

    #[test]
    fn huge_request_bypasses_the_pool() {
        let cfg = PoolConfig::default();
        let chunk_size = cfg.chunk_size();
        let allocator = PooledAllocator::new(cfg).unwrap();
        let buf = allocator
            .new_heap_buffer(chunk_size + 1, chunk_size + 1)
            .unwrap();
        assert!(buf.is_huge());
        assert_eq!(buf.len(), chunk_size + 1);
    }

    #[test]
    fn max_capacity_above_chunk_size_overflows_even_for_a_small_request() {
        let cfg = PoolConfig::default();
        let chunk_size = cfg.chunk_size();
        let allocator = PooledAllocator::new(cfg).unwrap();
        let buf = allocator.new_heap_buffer(64, chunk_size + 1).unwrap();
        assert!(buf.is_huge());
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn direct_buffer_is_independent_of_heap_arenas() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let heap_buf = allocator.new_heap_buffer(256, 256).unwrap();
        let direct_buf = allocator.new_direct_buffer(256, 256).unwrap();
        assert_eq!(heap_buf.len(), direct_buf.len());
    }

    #[test]
    fn is_direct_pooled_reflects_configured_arena_count() {
        let mut cfg = PoolConfig::default();
        cfg.num_direct_arenas = 0;
        let allocator = PooledAllocator::new(cfg).unwrap();
        assert!(!allocator.is_direct_pooled());

        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        assert!(allocator.is_direct_pooled());
    }

    #[test]
    fn shutdown_drains_thread_caches_without_panicking() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let buf = allocator.new_heap_buffer(32, 32).unwrap();
        drop(buf);
        allocator.shutdown();
    }
}
