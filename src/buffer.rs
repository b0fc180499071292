//! The allocation handed back to callers. The spec treats the actual
//! ring-buffer/byte-buffer object as an external collaborator (§1
//! "Non-goals"); `PooledBuffer` is the minimal owning handle this crate
//! provides, proving the allocate/free round trip end to end.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::arena::Arena;
use crate::chunk::ChunkStorage;
use crate::handle::Handle;
use crate::size_class::SizeClass;
use crate::thread_cache::{CacheEntry, ThreadCache};

enum Origin {
    Pooled {
        arena: Arc<Arena>,
        cache: Arc<ThreadCache>,
        /// Below `max_cached_buffer_capacity`: worth offering back to the
        /// thread cache on drop instead of going straight to the arena.
        cacheable: bool,
        chunk_idx: usize,
        handle: Handle,
        class: SizeClass,
    },
    Huge {
        storage: ChunkStorage,
    },
}

/// An owning handle to one allocation. Dropping it releases the memory back
/// to its arena (or, for a huge allocation, back to the OS).
pub struct PooledBuffer {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

// SAFETY: `ptr` addresses a region exclusively owned by this buffer (no
// other `PooledBuffer` overlaps it, §8 invariant 5 "non-overlap"), and the
// backing chunk/storage outlives the buffer via the `Arc<Arena>` / owned
// `ChunkStorage` it holds.
unsafe impl Send for PooledBuffer {}

impl PooledBuffer {
    pub(crate) fn pooled(
        arena: Arc<Arena>,
        cache: Arc<ThreadCache>,
        cacheable: bool,
        chunk_idx: usize,
        handle: Handle,
        class: SizeClass,
        ptr: NonNull<u8>,
        len: usize,
    ) -> PooledBuffer {
        PooledBuffer {
            ptr,
            len,
            origin: Origin::Pooled {
                arena,
                cache,
                cacheable,
                chunk_idx,
                handle,
                class,
            },
        }
    }

    pub(crate) fn huge(mut storage: ChunkStorage) -> PooledBuffer {
        let len = storage.len();
        let ptr = NonNull::new(storage.as_mut_ptr()).expect("provider returned a null pointer");
        PooledBuffer {
            ptr,
            len,
            origin: Origin::Huge { storage },
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_huge(&self) -> bool {
        matches!(self.origin, Origin::Huge { .. })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr`/`len` describe a region owned exclusively by this
        // buffer for its whole lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Origin::Pooled {
            arena,
            cache,
            cacheable,
            chunk_idx,
            handle,
            class,
        } = &self.origin
        {
            let entry = CacheEntry {
                chunk_idx: *chunk_idx,
                handle: *handle,
                class: *class,
            };
            if !*cacheable || !cache.push(*class, entry) {
                arena.free(*chunk_idx, *handle, *class);
            }
        }
        // `Origin::Huge` frees itself when `storage: ChunkStorage` drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::os::{ChunkProvider, HeapChunkProvider};
    use crate::size_class;

    #[test]
    fn huge_buffer_exposes_its_full_length() {
        let storage = HeapChunkProvider::default().acquire(4096).unwrap();
        let buf = PooledBuffer::huge(storage);
        assert_eq!(buf.len(), 4096);
        assert!(buf.is_huge());
    }

    #[test]
    fn pooled_buffer_round_trips_writes() {
        let cfg = PoolConfig::default();
        let arena = Arc::new(crate::arena::Arena::new(
            cfg.page_size,
            cfg.max_order,
            false,
            size_class::num_small_classes(cfg.page_size),
            Box::new(HeapChunkProvider),
        ));
        let class = size_class::classify(&cfg, 64);
        let alloc = arena.allocate(class, 64).unwrap();
        let crate::arena::Allocation::Pooled {
            chunk_idx, handle, ..
        } = alloc
        else {
            panic!("expected pooled allocation");
        };
        let ptr = arena.raw_ptr_for(chunk_idx, handle, class.size);
        let cache = Arc::new(ThreadCache::new(&cfg));
        let mut buf = PooledBuffer::pooled(
            arena, cache, true, chunk_idx, handle, class, ptr, class.size,
        );
        assert!(!buf.is_huge());
        buf.as_mut_slice().fill(0x42);
        assert!(buf.as_slice().iter().all(|&b| b == 0x42));
    }
}
