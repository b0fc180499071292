//! Chunk — per-arena buddy page allocator, §4.1.
//!
//! A chunk is one large backing region, viewed as a complete binary tree of
//! page runs. `memory_map[id]` holds the shallowest depth at which `id` (or
//! one of its descendants) still has free space; `max_order + 1` means
//! "nothing free here." Allocation descends toward a target depth following
//! whichever child is freer (left on ties, §4.1 "Tie-breaks"); free restores
//! a leaf to its original depth and re-derives ancestors bottom-up.
//!
//! Subpage list-membership *policy* (when a subpage joins/leaves its arena's
//! per-class LRU list) lives in `arena.rs`, since that list spans every
//! chunk the arena owns; this module only flips bits and hands back facts.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::handle::Handle;
use crate::os;
use crate::subpage::{Subpage, SubpageKey};

/// Sentinel stored in `memory_map` once a node (or everything beneath it) is
/// fully allocated.
fn unusable(max_order: u32) -> u8 {
    (max_order + 1) as u8
}

fn depth_of(node_id: u32) -> u32 {
    debug_assert!(node_id >= 1);
    31 - node_id.leading_zeros()
}

/// A chunk's backing bytes, from either provider (§B "ChunkProvider").
/// `Direct` owns raw OS-mapped memory and unmaps it on drop; `Heap` is a
/// plain boxed slice.
pub enum ChunkStorage {
    Heap(Box<[u8]>),
    Direct { ptr: NonNull<u8>, len: usize },
}

// SAFETY: a `ChunkStorage` is only ever reachable through the arena it
// belongs to, which serializes mutation behind its lock; the `Direct`
// pointer is exclusively owned, same as a `Box<[u8]>`.
unsafe impl Send for ChunkStorage {}
unsafe impl Sync for ChunkStorage {}

impl ChunkStorage {
    pub fn len(&self) -> usize {
        match self {
            ChunkStorage::Heap(b) => b.len(),
            ChunkStorage::Direct { len, .. } => *len,
        }
    }
}

impl Deref for ChunkStorage {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            ChunkStorage::Heap(b) => b,
            // SAFETY: `ptr` was obtained from the OS with `len` readable and
            // writable bytes, held exclusively for the lifetime of `self`.
            ChunkStorage::Direct { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }
}

impl DerefMut for ChunkStorage {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ChunkStorage::Heap(b) => b,
            ChunkStorage::Direct { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }
}

impl Drop for ChunkStorage {
    fn drop(&mut self) {
        if let ChunkStorage::Direct { ptr, len } = self {
            unsafe { os::raw_free(*ptr, *len) };
        }
    }
}

pub struct Chunk {
    storage: ChunkStorage,
    memory_map: Vec<u8>,
    depth_map: Vec<u8>,
    subpages: Vec<Option<Subpage>>,
    pub free_bytes: usize,
    pub chunk_size: usize,
    pub page_size: usize,
    max_order: u32,
    /// Intrusive doubly-linked-list membership within the owning arena's
    /// q-band lists (§3 "Arena", §9 "List migration between q-bands").
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub tier: UsageTier,
    /// `true` until the chunk has seen its first allocation (§4.3: `qInit`
    /// never migrates backwards to `q000`).
    pub fresh: bool,
    /// Whether this chunk's storage came from a direct (off-heap) provider;
    /// carried so the arena knows which `ChunkProvider` to return it to.
    pub is_direct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageTier {
    QInit,
    Q000,
    Q025,
    Q050,
    Q075,
    Q100,
}

/// What freeing a handle did, for the arena's list/tier bookkeeping.
pub enum FreeOutcome {
    NormalRunFreed,
    /// A subpage slot was released. `page_released` is `true` only if the
    /// caller (the arena) had already decided to hand the page back to the
    /// tree before this call returned (see `Chunk::release_subpage_page`).
    SubpageSlotFreed { page_became_fully_free: bool },
}

impl Chunk {
    pub fn new(storage: ChunkStorage, page_size: usize, max_order: u32, is_direct: bool) -> Chunk {
        let chunk_size = page_size << max_order;
        debug_assert_eq!(storage.len(), chunk_size);
        let num_nodes = 1usize << (max_order + 1);
        let mut memory_map = vec![0u8; num_nodes];
        let mut depth_map = vec![0u8; num_nodes];
        for (id, slot) in memory_map.iter_mut().enumerate().skip(1) {
            let d = depth_of(id as u32) as u8;
            *slot = d;
            depth_map[id] = d;
        }
        let num_pages = 1usize << max_order;
        Chunk {
            storage,
            memory_map,
            depth_map,
            subpages: (0..num_pages).map(|_| None).collect(),
            free_bytes: chunk_size,
            chunk_size,
            page_size,
            max_order,
            prev: None,
            next: None,
            tier: UsageTier::QInit,
            fresh: true,
            is_direct,
        }
    }

    pub fn usage_percent(&self) -> f64 {
        100.0 - (self.free_bytes as f64 * 100.0 / self.chunk_size as f64)
    }

    pub fn num_pages(&self) -> usize {
        1usize << self.max_order
    }

    pub fn page_index_of(&self, leaf_id: u32) -> usize {
        leaf_id as usize - self.num_pages()
    }

    fn leaf_id_of(&self, page_index: usize) -> u32 {
        (page_index + self.num_pages()) as u32
    }

    fn restore_parents(&mut self, mut id: u32) {
        id /= 2;
        while id >= 1 {
            let left = self.memory_map[(2 * id) as usize];
            let right = self.memory_map[(2 * id + 1) as usize];
            self.memory_map[id as usize] = left.min(right);
            id /= 2;
        }
    }

    /// Steps 1-5 of §4.1. `size_in_pages` must be a power of two.
    pub fn allocate_run(&mut self, size_in_pages: usize) -> Option<u32> {
        debug_assert!(size_in_pages.is_power_of_two());
        let k = size_in_pages.trailing_zeros();
        if k > self.max_order {
            return None;
        }
        let target_depth = self.max_order - k;
        if self.memory_map[1] as u32 > target_depth {
            return None;
        }
        let mut id: u32 = 1;
        while depth_of(id) < target_depth {
            let left = 2 * id;
            if self.memory_map[left as usize] as u32 <= target_depth {
                id = left;
            } else {
                id = left + 1;
            }
        }
        debug_assert_eq!(depth_of(id), target_depth);
        self.memory_map[id as usize] = unusable(self.max_order);
        self.restore_parents(id);
        self.free_bytes -= size_in_pages * self.page_size;
        self.fresh = false;
        Some(id)
    }

    fn free_run(&mut self, id: u32) {
        let depth = self.depth_map[id as usize];
        debug_assert_eq!(
            self.memory_map[id as usize],
            unusable(self.max_order),
            "double free of chunk node {id}"
        );
        self.memory_map[id as usize] = depth;
        self.restore_parents(id);
        let size_in_pages = 1usize << (self.max_order - depth as u32);
        self.free_bytes += size_in_pages * self.page_size;
    }

    /// §4.1 "allocateSubpage": split a fresh leaf into a subpage of
    /// `element_size` slots and hand back its first slot. `key` stamps the
    /// new subpage with its own `(chunk_idx, page_idx)` identity so the
    /// arena's intrusive lists can reference it without a raw pointer.
    pub fn split_into_subpage(
        &mut self,
        element_size: usize,
        chunk_idx: usize,
        class_list_idx: usize,
        is_tiny_class: bool,
        generation: u32,
    ) -> Option<Handle> {
        let leaf_id = self.allocate_run(1)?;
        let page_idx = self.page_index_of(leaf_id);
        let key: SubpageKey = (chunk_idx, page_idx);
        let subpage = Subpage::new(
            element_size,
            self.page_size,
            key,
            class_list_idx,
            is_tiny_class,
            generation,
        );
        self.subpages[page_idx] = Some(subpage);
        let bitmap_idx = self.subpages[page_idx]
            .as_mut()
            .unwrap()
            .allocate_slot()
            .expect("freshly split subpage must have a free slot");
        Some(Handle::Subpage {
            node_id: leaf_id,
            bitmap_idx,
        })
    }

    pub fn subpage(&self, page_idx: usize) -> Option<&Subpage> {
        self.subpages[page_idx].as_ref()
    }

    pub fn subpage_mut(&mut self, page_idx: usize) -> Option<&mut Subpage> {
        self.subpages[page_idx].as_mut()
    }

    pub fn allocate_in_subpage(&mut self, page_idx: usize) -> Handle {
        let node_id = self.leaf_id_of(page_idx);
        let subpage = self.subpages[page_idx]
            .as_mut()
            .expect("caller must ensure subpage exists");
        let bitmap_idx = subpage
            .allocate_slot()
            .expect("caller must ensure subpage has a free slot");
        Handle::Subpage {
            node_id,
            bitmap_idx,
        }
    }

    /// §4.1 "Free". For subpage handles this only flips the bitmap bit; the
    /// arena decides whether a now-fully-free subpage's page should be
    /// handed back to the tree (`release_subpage_page`) based on its list
    /// policy (§4.2).
    pub fn free(&mut self, handle: Handle) -> FreeOutcome {
        match handle {
            Handle::Normal { node_id } => {
                self.free_run(node_id);
                FreeOutcome::NormalRunFreed
            }
            Handle::Subpage {
                node_id,
                bitmap_idx,
            } => {
                let page_idx = self.page_index_of(node_id);
                let subpage = self.subpages[page_idx]
                    .as_mut()
                    .expect("handle references a page with no subpage");
                let page_became_fully_free = subpage.free_slot(bitmap_idx);
                FreeOutcome::SubpageSlotFreed {
                    page_became_fully_free,
                }
            }
        }
    }

    /// Removes the subpage at `page_idx` and frees its backing leaf. Only
    /// valid once the subpage is fully free.
    pub fn release_subpage_page(&mut self, page_idx: usize) {
        let subpage = self.subpages[page_idx]
            .take()
            .expect("release_subpage_page called on an empty slot");
        debug_assert!(subpage.is_fully_free());
        self.free_run(self.leaf_id_of(page_idx));
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_bytes == self.chunk_size
    }

    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    pub fn slice_for(&self, handle: Handle, len: usize) -> &[u8] {
        let offset = self.byte_offset(handle);
        &self.storage[offset..offset + len]
    }

    pub fn slice_for_mut(&mut self, handle: Handle, len: usize) -> &mut [u8] {
        let offset = self.byte_offset(handle);
        &mut self.storage[offset..offset + len]
    }

    fn byte_offset(&self, handle: Handle) -> usize {
        match handle {
            Handle::Normal { node_id } => {
                let depth = self.depth_map[node_id as usize] as u32;
                let run_size = self.chunk_size >> depth;
                let index_at_depth = node_id - (1u32 << depth);
                index_at_depth as usize * run_size
            }
            Handle::Subpage {
                node_id,
                bitmap_idx,
            } => {
                let page_idx = self.page_index_of(node_id);
                let page_offset = page_idx * self.page_size;
                let subpage = self.subpages[page_idx]
                    .as_ref()
                    .expect("handle references a page with no subpage");
                page_offset + bitmap_idx as usize * subpage.element_size()
            }
        }
    }

    /// Property-test hook: checks invariant 1 from §8.
    pub fn check_tree_consistency(&self) {
        let num_nodes = self.memory_map.len();
        for id in 1..num_nodes / 2 {
            let left = self.memory_map[2 * id];
            let right = self.memory_map[2 * id + 1];
            assert_eq!(
                self.memory_map[id],
                left.min(right),
                "tree inconsistency at node {id}"
            );
        }
    }
}
