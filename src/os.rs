//! Chunk storage providers, SPEC_FULL.md §B "ChunkProvider".
//!
//! The arena asks a provider for `chunk_size` fresh bytes and never again
//! touches the OS directly; `HeapChunkProvider` is a boxed-slice allocation,
//! `DirectChunkProvider` reserves anonymous off-heap memory the way the
//! teacher's `os_mem_alloc`/`os_mem_free` pair did, on whichever platform is
//! compiled.

use std::ptr::NonNull;

use log::warn;

use crate::chunk::ChunkStorage;
use crate::error::{PoolError, PoolResult};

/// Supplies backing storage for new chunks. Implementations must hand back
/// zeroed, exclusively-owned memory of exactly the requested length.
pub trait ChunkProvider: Send + Sync {
    fn acquire(&self, size: usize) -> PoolResult<ChunkStorage>;
}

#[derive(Debug, Default)]
pub struct HeapChunkProvider;

impl ChunkProvider for HeapChunkProvider {
    fn acquire(&self, size: usize) -> PoolResult<ChunkStorage> {
        Ok(ChunkStorage::Heap(vec![0u8; size].into_boxed_slice()))
    }
}

#[derive(Debug, Default)]
pub struct DirectChunkProvider;

impl ChunkProvider for DirectChunkProvider {
    fn acquire(&self, size: usize) -> PoolResult<ChunkStorage> {
        let ptr = unsafe { raw_alloc(size) }.ok_or(PoolError::OutOfMemory { requested: size })?;
        Ok(ChunkStorage::Direct { ptr, len: size })
    }
}

/// Reserves and commits `size` anonymous, zeroed, read-write bytes.
///
/// # Safety
/// `size` must be greater than zero.
#[cfg(unix)]
unsafe fn raw_alloc(size: usize) -> Option<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        warn!("mmap({size}) failed: errno {}", errno::errno());
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

#[cfg(windows)]
unsafe fn raw_alloc(size: usize) -> Option<NonNull<u8>> {
    let ptr = winapi::um::memoryapi::VirtualAlloc(
        std::ptr::null_mut(),
        size,
        winapi::um::winnt::MEM_COMMIT | winapi::um::winnt::MEM_RESERVE,
        winapi::um::winnt::PAGE_READWRITE,
    );
    if ptr.is_null() {
        warn!(
            "VirtualAlloc({size}) failed: GetLastError = {}",
            winapi::um::errhandlingapi::GetLastError()
        );
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

/// Releases memory previously returned by `raw_alloc`.
///
/// # Safety
/// `ptr`/`len` must be exactly the pair returned by a prior `raw_alloc` call
/// that has not already been freed.
#[cfg(unix)]
pub(crate) unsafe fn raw_free(ptr: NonNull<u8>, len: usize) {
    if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
        warn!("munmap failed: errno {}", errno::errno());
    }
}

#[cfg(windows)]
pub(crate) unsafe fn raw_free(ptr: NonNull<u8>, _len: usize) {
    if winapi::um::memoryapi::VirtualFree(ptr.as_ptr() as *mut _, 0, winapi::um::winnt::MEM_RELEASE)
        == 0
    {
        warn!(
            "VirtualFree failed: GetLastError = {}",
            winapi::um::errhandlingapi::GetLastError()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_provider_zeroes_requested_length() {
        let storage = HeapChunkProvider.acquire(4096).unwrap();
        assert_eq!(storage.len(), 4096);
        assert!(storage.iter().all(|&b| b == 0));
    }

    #[test]
    fn direct_provider_round_trips_reads_and_writes() {
        let mut storage = DirectChunkProvider.acquire(8192).unwrap();
        assert_eq!(storage.len(), 8192);
        storage[0] = 0xAB;
        storage[8191] = 0xCD;
        assert_eq!(storage[0], 0xAB);
        assert_eq!(storage[8191], 0xCD);
    }
}
