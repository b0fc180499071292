//! Pooled byte-buffer allocator core.
//!
//! Chunked buddy arenas, bitmap subpages, and per-thread caches in front of
//! them — the allocation path a runtime's buffer pool runs on, without the
//! buffer/ring-buffer type itself (see `PooledBuffer` for the minimal owning
//! handle this crate does provide). Entry point: [`PooledAllocator`].

mod allocator;
mod arena;
mod buffer;
mod chunk;
mod config;
mod error;
mod handle;
mod os;
mod registry;
mod size_class;
mod stats;
mod subpage;
mod thread_cache;

pub use allocator::PooledAllocator;
pub use buffer::PooledBuffer;
pub use config::{PoolConfig, MAX_CHUNK_SIZE};
pub use error::{PoolError, PoolResult};
pub use size_class::{SizeClass, SizeClassKind};
pub use stats::{ArenaStats, StatCount, StatCountSnapshot, StatCounter};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn end_to_end_allocate_free_cycle() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let mut buf = allocator.new_heap_buffer(4096, 4096).unwrap();
        buf.as_mut_slice().fill(0x11);
        assert!(buf.as_slice().iter().all(|&b| b == 0x11));
        drop(buf);
        allocator.shutdown();
    }

    #[test]
    fn concurrent_threads_each_get_their_own_cache() {
        let allocator = PooledAllocator::new(PoolConfig::default()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let buf = allocator.new_heap_buffer(64, 64).unwrap();
                        assert_eq!(buf.len(), 64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        allocator.shutdown();
    }

    #[test]
    fn bad_config_is_rejected_before_any_arena_is_built() {
        let mut cfg = PoolConfig::default();
        cfg.page_size = 3000;
        let err = PooledAllocator::new(cfg).unwrap_err();
        assert!(matches!(err, PoolError::BadConfig(_)));
    }
}
