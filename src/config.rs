//! Allocator configuration, §6 of SPEC_FULL.md.
//!
//! A plain value type rather than the teacher's global `option_get`/
//! `option_is_enabled` statics: this crate is embedded by a runtime, not a
//! process-wide `malloc` replacement, so each `PooledAllocator` carries its
//! own config.

use crate::error::{PoolError, PoolResult};

/// Largest capacity a request may have before it bypasses the pool entirely
/// (the "huge" size class, §3).
pub const MAX_CHUNK_SIZE: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_heap_arenas: usize,
    pub num_direct_arenas: usize,
    pub page_size: usize,
    pub max_order: u32,
    pub tiny_cache_size: usize,
    pub small_cache_size: usize,
    pub normal_cache_size: usize,
    pub max_cached_buffer_capacity: usize,
    pub cache_trim_interval: u64,
    pub cache_cleanup_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        // min(cores, max_heap / chunk_size / 6) with a conservative stand-in
        // for "max_heap" (we don't poll the OS for total RAM here: that is
        // a chunk-provider concern, out of scope per §1).
        let heap_cap = (cores * 4).max(1);
        PoolConfig {
            num_heap_arenas: cores.min(heap_cap),
            num_direct_arenas: cores.min(heap_cap),
            page_size: 8192,
            max_order: 11,
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            cache_trim_interval: 8192,
            cache_cleanup_interval_ms: 5000,
        }
    }
}

impl PoolConfig {
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    /// Validates the config per the error table in §7; called once by
    /// `PooledAllocator::new`.
    pub fn validate(&self) -> PoolResult<()> {
        if self.page_size < 4096 || !self.page_size.is_power_of_two() {
            return Err(PoolError::BadConfig(
                "pageSize must be power of two >= 4096".into(),
            ));
        }
        if self.max_order > 14 {
            return Err(PoolError::BadConfig("maxOrder expected 0-14".into()));
        }
        let chunk_size = (self.page_size as u128) << self.max_order;
        if chunk_size > MAX_CHUNK_SIZE as u128 {
            return Err(PoolError::BadConfig(
                "chunkSize overflow: pageSize << maxOrder exceeds 2^30".into(),
            ));
        }
        if self.tiny_cache_size == 0 || self.small_cache_size == 0 || self.normal_cache_size == 0
        {
            return Err(PoolError::BadConfig(
                "cache sizes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
