//! Arena — chunk owner and allocation orchestrator, §4.3.
//!
//! Holds every `Chunk` this arena has created, bucketed into six usage-tier
//! lists (`qInit`..`q100`) plus a per-size-class table of subpage LRU lists.
//! A single `parking_lot::Mutex` protects all of it; the thread cache above
//! this layer absorbs most traffic so the lock is only taken on a miss
//! (§3 "Concurrency").

use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkStorage, FreeOutcome, UsageTier};
use crate::error::PoolResult;
use crate::handle::Handle;
use crate::os::ChunkProvider;
use crate::size_class::{self, SizeClass, SizeClassKind};
use crate::stats::ArenaStats;
use crate::subpage::SubpageKey;

/// Where an allocation's bytes live. Huge allocations bypass the chunk
/// machinery entirely and own their storage outright (§3 "Huge").
pub enum Allocation {
    Pooled {
        chunk_idx: usize,
        handle: Handle,
        class: SizeClass,
    },
    Huge {
        storage: ChunkStorage,
    },
}

fn tier_bounds(tier: UsageTier) -> (f64, f64) {
    match tier {
        UsageTier::QInit => (0.0, 25.0),
        UsageTier::Q000 => (0.0, 50.0),
        UsageTier::Q025 => (25.0, 75.0),
        UsageTier::Q050 => (50.0, 100.0),
        UsageTier::Q075 => (75.0, 100.0),
        UsageTier::Q100 => (100.0, 100.0),
    }
}

fn next_tier(tier: UsageTier) -> Option<UsageTier> {
    match tier {
        UsageTier::QInit => Some(UsageTier::Q000),
        UsageTier::Q000 => Some(UsageTier::Q025),
        UsageTier::Q025 => Some(UsageTier::Q050),
        UsageTier::Q050 => Some(UsageTier::Q075),
        UsageTier::Q075 => Some(UsageTier::Q100),
        UsageTier::Q100 => None,
    }
}

fn prev_tier(tier: UsageTier) -> Option<UsageTier> {
    match tier {
        UsageTier::Q025 => Some(UsageTier::Q000),
        UsageTier::Q050 => Some(UsageTier::Q025),
        UsageTier::Q075 => Some(UsageTier::Q050),
        UsageTier::Q100 => Some(UsageTier::Q075),
        UsageTier::Q000 | UsageTier::QInit => None,
    }
}

fn tier_idx(tier: UsageTier) -> usize {
    match tier {
        UsageTier::QInit => 0,
        UsageTier::Q000 => 1,
        UsageTier::Q025 => 2,
        UsageTier::Q050 => 3,
        UsageTier::Q075 => 4,
        UsageTier::Q100 => 5,
    }
}

/// Allocation search order, §4.3 step 3: `q100` is never searched (it is
/// reserved for chunks with no room left).
const SEARCH_ORDER: [UsageTier; 5] = [
    UsageTier::Q050,
    UsageTier::Q025,
    UsageTier::Q000,
    UsageTier::QInit,
    UsageTier::Q075,
];

struct Inner {
    chunks: Vec<Option<Chunk>>,
    free_slots: Vec<usize>,
    q_heads: [Option<usize>; 6],
    tiny_heads: Vec<Option<SubpageKey>>,
    tiny_counts: Vec<usize>,
    small_heads: Vec<Option<SubpageKey>>,
    small_counts: Vec<usize>,
    next_generation: u32,
}

pub struct Arena {
    inner: Mutex<Inner>,
    provider: Box<dyn ChunkProvider>,
    pub page_size: usize,
    pub max_order: u32,
    pub chunk_size: usize,
    pub is_direct: bool,
    pub stats: ArenaStats,
}

impl Arena {
    pub fn new(
        page_size: usize,
        max_order: u32,
        is_direct: bool,
        num_small_classes: usize,
        provider: Box<dyn ChunkProvider>,
    ) -> Arena {
        Arena {
            inner: Mutex::new(Inner {
                chunks: Vec::new(),
                free_slots: Vec::new(),
                q_heads: [None; 6],
                // index 0 is never produced by `classify` (tiny indices run
                // 1..=TINY_CLASSES); the extra slot avoids an off-by-one
                // out-of-bounds panic on the largest tiny class instead of
                // wasting a lookup branch on every hit.
                tiny_heads: vec![None; size_class::TINY_CLASSES + 1],
                tiny_counts: vec![0; size_class::TINY_CLASSES + 1],
                small_heads: vec![None; num_small_classes],
                small_counts: vec![0; num_small_classes],
                next_generation: 0,
            }),
            provider,
            page_size,
            max_order,
            chunk_size: page_size << max_order,
            is_direct,
            stats: ArenaStats::default(),
        }
    }

    /// §4.3 "allocate". `cache_hit` lets the caller report a thread-cache hit
    /// that already happened so stats stay accurate even though the lock was
    /// never taken for this call; pass `false` when calling on a cache miss.
    pub fn allocate(&self, class: SizeClass, requested: usize) -> PoolResult<Allocation> {
        if class.kind == SizeClassKind::Huge {
            self.stats.huge_allocations.increment();
            let storage = self.provider.acquire(requested)?;
            self.stats.bytes_allocated.increase(requested as i64);
            return Ok(Allocation::Huge { storage });
        }
        self.stats.cache_misses.increment();
        let mut inner = self.inner.lock();
        let (chunk_idx, handle) = match class.kind {
            SizeClassKind::Tiny | SizeClassKind::Small => inner.allocate_subpage_slot(
                class,
                self.page_size,
                self.max_order,
                self.is_direct,
                &*self.provider,
                &self.stats,
            )?,
            SizeClassKind::Normal => {
                let pages = class.size / self.page_size;
                inner.allocate_normal_run(
                    pages,
                    self.page_size,
                    self.max_order,
                    self.is_direct,
                    &*self.provider,
                    &self.stats,
                )?
            }
            SizeClassKind::Huge => unreachable!(),
        };
        inner.reclassify(chunk_idx);
        self.stats.bytes_allocated.increase(class.size as i64);
        Ok(Allocation::Pooled {
            chunk_idx,
            handle,
            class,
        })
    }

    /// Captures a raw pointer into a live allocation's bytes under the arena
    /// lock. The pointer stays valid for as long as the owning `PooledBuffer`
    /// holds this arena alive and doesn't outlive a `free` of the same
    /// handle (§9 "weak logical reference" ownership note).
    pub fn raw_ptr_for(&self, chunk_idx: usize, handle: Handle, len: usize) -> std::ptr::NonNull<u8> {
        let mut inner = self.inner.lock();
        let chunk = inner.chunks[chunk_idx]
            .as_mut()
            .expect("raw_ptr_for on an empty chunk slot");
        let slice = chunk.slice_for_mut(handle, len);
        std::ptr::NonNull::new(slice.as_mut_ptr()).expect("chunk storage pointer is never null")
    }

    /// §4.3 "free". Only called on a thread-cache miss (the cache absorbed
    /// the free otherwise).
    pub fn free(&self, chunk_idx: usize, handle: Handle, class: SizeClass) {
        let mut inner = self.inner.lock();
        self.stats.bytes_allocated.decrease(class.size as i64);
        let outcome = {
            let chunk = inner.chunks[chunk_idx].as_mut().expect("freed chunk slot is empty");
            chunk.free(handle)
        };
        match outcome {
            FreeOutcome::NormalRunFreed => {
                inner.reclassify(chunk_idx);
                inner.maybe_release_idle_chunk(chunk_idx, &self.stats);
            }
            FreeOutcome::SubpageSlotFreed {
                page_became_fully_free,
            } => {
                let page_idx = chunk_idx_page_idx(handle, inner.chunks[chunk_idx].as_ref().unwrap());
                inner.after_subpage_free(chunk_idx, page_idx, page_became_fully_free);
                inner.reclassify(chunk_idx);
                inner.maybe_release_idle_chunk(chunk_idx, &self.stats);
            }
        }
    }
}

fn chunk_idx_page_idx(handle: Handle, chunk: &Chunk) -> usize {
    chunk.page_index_of(handle.node_id())
}

impl Inner {
    fn alloc_chunk_slot(
        &mut self,
        page_size: usize,
        max_order: u32,
        is_direct: bool,
        provider: &dyn ChunkProvider,
        stats: &ArenaStats,
    ) -> PoolResult<usize> {
        let storage = provider.acquire(page_size << max_order)?;
        let chunk = Chunk::new(storage, page_size, max_order, is_direct);
        stats.chunks_created.increment();
        let idx = if let Some(idx) = self.free_slots.pop() {
            self.chunks[idx] = Some(chunk);
            idx
        } else {
            self.chunks.push(Some(chunk));
            self.chunks.len() - 1
        };
        self.q_insert_front(UsageTier::QInit, idx);
        Ok(idx)
    }

    fn allocate_normal_run(
        &mut self,
        pages: usize,
        page_size: usize,
        max_order: u32,
        is_direct: bool,
        provider: &dyn ChunkProvider,
        stats: &ArenaStats,
    ) -> PoolResult<(usize, Handle)> {
        for &tier in &SEARCH_ORDER {
            let mut cursor = self.q_heads[tier_idx(tier)];
            while let Some(idx) = cursor {
                let next = self.chunks[idx].as_ref().unwrap().next;
                if let Some(node_id) = self.chunks[idx].as_mut().unwrap().allocate_run(pages) {
                    return Ok((idx, Handle::Normal { node_id }));
                }
                cursor = next;
            }
        }
        let idx = self.alloc_chunk_slot(page_size, max_order, is_direct, provider, stats)?;
        let node_id = self.chunks[idx]
            .as_mut()
            .unwrap()
            .allocate_run(pages)
            .expect("freshly created chunk must have room for a single normal run");
        Ok((idx, Handle::Normal { node_id }))
    }

    fn allocate_subpage_slot(
        &mut self,
        class: SizeClass,
        page_size: usize,
        max_order: u32,
        is_direct: bool,
        provider: &dyn ChunkProvider,
        stats: &ArenaStats,
    ) -> PoolResult<(usize, Handle)> {
        let is_tiny = class.kind == SizeClassKind::Tiny;
        let head = if is_tiny {
            self.tiny_heads[class.index]
        } else {
            self.small_heads[class.index]
        };
        if let Some((chunk_idx, page_idx)) = head {
            let handle = self.chunks[chunk_idx]
                .as_mut()
                .unwrap()
                .allocate_in_subpage(page_idx);
            let became_full = self.chunks[chunk_idx]
                .as_ref()
                .unwrap()
                .subpage(page_idx)
                .unwrap()
                .is_full();
            if became_full {
                self.subpage_list_remove((chunk_idx, page_idx));
            }
            return Ok((chunk_idx, handle));
        }
        // Nothing in this class's list: split a fresh page somewhere.
        for &tier in &SEARCH_ORDER {
            let mut cursor = self.q_heads[tier_idx(tier)];
            while let Some(idx) = cursor {
                let next = self.chunks[idx].as_ref().unwrap().next;
                let generation = self.next_generation;
                if let Some(handle) = self.chunks[idx].as_mut().unwrap().split_into_subpage(
                    class.size,
                    idx,
                    class.index,
                    is_tiny,
                    generation,
                ) {
                    self.next_generation = self.next_generation.wrapping_add(1);
                    self.register_fresh_subpage(idx, handle, page_size, is_tiny, class.index);
                    return Ok((idx, handle));
                }
                cursor = next;
            }
        }
        // No existing chunk had a free page left to split: create one.
        let idx = self.alloc_chunk_slot(page_size, max_order, is_direct, provider, stats)?;
        let generation = self.next_generation;
        let handle = self.chunks[idx]
            .as_mut()
            .unwrap()
            .split_into_subpage(class.size, idx, class.index, is_tiny, generation)
            .expect("freshly created chunk must have room for a single page");
        self.next_generation = self.next_generation.wrapping_add(1);
        self.register_fresh_subpage(idx, handle, page_size, is_tiny, class.index);
        Ok((idx, handle))
    }

    fn register_fresh_subpage(
        &mut self,
        chunk_idx: usize,
        handle: Handle,
        _page_size: usize,
        _is_tiny: bool,
        _class_idx: usize,
    ) {
        let page_idx = self.chunks[chunk_idx]
            .as_ref()
            .unwrap()
            .page_index_of(handle.node_id());
        let full = self.chunks[chunk_idx]
            .as_ref()
            .unwrap()
            .subpage(page_idx)
            .unwrap()
            .is_full();
        if !full {
            self.subpage_list_insert_front((chunk_idx, page_idx));
        }
    }

    fn after_subpage_free(&mut self, chunk_idx: usize, page_idx: usize, fully_free: bool) {
        let key = (chunk_idx, page_idx);
        if fully_free {
            let (is_tiny, class_idx) = {
                let sp = self.chunks[chunk_idx]
                    .as_ref()
                    .unwrap()
                    .subpage(page_idx)
                    .unwrap();
                (sp.is_tiny_class, sp.class_list_idx)
            };
            let count = if is_tiny {
                self.tiny_counts[class_idx]
            } else {
                self.small_counts[class_idx]
            };
            if count > 1 {
                self.subpage_list_remove(key);
                self.chunks[chunk_idx]
                    .as_mut()
                    .unwrap()
                    .release_subpage_page(page_idx);
            }
            // else: kept as the class's one reserved, reusable subpage.
        } else {
            let in_list = self.chunks[chunk_idx]
                .as_ref()
                .unwrap()
                .subpage(page_idx)
                .unwrap()
                .in_list;
            if !in_list {
                self.subpage_list_insert_front(key);
            }
        }
    }

    fn subpage_list_insert_front(&mut self, key: SubpageKey) {
        let (is_tiny, idx) = {
            let sp = self.chunks[key.0].as_ref().unwrap().subpage(key.1).unwrap();
            (sp.is_tiny_class, sp.class_list_idx)
        };
        let head = if is_tiny {
            self.tiny_heads[idx]
        } else {
            self.small_heads[idx]
        };
        {
            let sp = self.chunks[key.0]
                .as_mut()
                .unwrap()
                .subpage_mut(key.1)
                .unwrap();
            sp.prev = None;
            sp.next = head;
            sp.in_list = true;
        }
        if let Some(old_head) = head {
            self.chunks[old_head.0]
                .as_mut()
                .unwrap()
                .subpage_mut(old_head.1)
                .unwrap()
                .prev = Some(key);
        }
        if is_tiny {
            self.tiny_heads[idx] = Some(key);
            self.tiny_counts[idx] += 1;
        } else {
            self.small_heads[idx] = Some(key);
            self.small_counts[idx] += 1;
        }
    }

    fn subpage_list_remove(&mut self, key: SubpageKey) {
        let (is_tiny, idx, prev, next) = {
            let sp = self.chunks[key.0].as_ref().unwrap().subpage(key.1).unwrap();
            (sp.is_tiny_class, sp.class_list_idx, sp.prev, sp.next)
        };
        if let Some(p) = prev {
            self.chunks[p.0]
                .as_mut()
                .unwrap()
                .subpage_mut(p.1)
                .unwrap()
                .next = next;
        } else if is_tiny {
            self.tiny_heads[idx] = next;
        } else {
            self.small_heads[idx] = next;
        }
        if let Some(n) = next {
            self.chunks[n.0]
                .as_mut()
                .unwrap()
                .subpage_mut(n.1)
                .unwrap()
                .prev = prev;
        }
        {
            let sp = self.chunks[key.0]
                .as_mut()
                .unwrap()
                .subpage_mut(key.1)
                .unwrap();
            sp.prev = None;
            sp.next = None;
            sp.in_list = false;
        }
        if is_tiny {
            self.tiny_counts[idx] -= 1;
        } else {
            self.small_counts[idx] -= 1;
        }
    }

    fn q_insert_front(&mut self, tier: UsageTier, chunk_idx: usize) {
        let head = self.q_heads[tier_idx(tier)];
        {
            let c = self.chunks[chunk_idx].as_mut().unwrap();
            c.prev = None;
            c.next = head;
            c.tier = tier;
        }
        if let Some(h) = head {
            self.chunks[h].as_mut().unwrap().prev = Some(chunk_idx);
        }
        self.q_heads[tier_idx(tier)] = Some(chunk_idx);
    }

    fn q_remove(&mut self, chunk_idx: usize) {
        let (tier, prev, next) = {
            let c = self.chunks[chunk_idx].as_ref().unwrap();
            (c.tier, c.prev, c.next)
        };
        if let Some(p) = prev {
            self.chunks[p].as_mut().unwrap().next = next;
        } else {
            self.q_heads[tier_idx(tier)] = next;
        }
        if let Some(n) = next {
            self.chunks[n].as_mut().unwrap().prev = prev;
        }
        let c = self.chunks[chunk_idx].as_mut().unwrap();
        c.prev = None;
        c.next = None;
    }

    /// Moves a chunk forward/backward through the q-bands until its usage
    /// fits the current list's bounds (§4.3, §9 "List migration").
    fn reclassify(&mut self, chunk_idx: usize) {
        loop {
            let (tier, pct) = {
                let c = self.chunks[chunk_idx].as_ref().unwrap();
                (c.tier, c.usage_percent())
            };
            let (min, max) = tier_bounds(tier);
            if pct >= max {
                if let Some(nt) = next_tier(tier) {
                    self.q_remove(chunk_idx);
                    self.q_insert_front(nt, chunk_idx);
                    continue;
                }
            } else if pct < min {
                if let Some(pt) = prev_tier(tier) {
                    self.q_remove(chunk_idx);
                    self.q_insert_front(pt, chunk_idx);
                    continue;
                }
            }
            break;
        }
    }

    /// §4.3: a chunk that falls idle while parked in `q000` (which has
    /// nowhere further back to go) is handed back to the provider, but only
    /// if `qInit` already has a chunk standing by to serve the next
    /// allocation without needing a fresh one.
    fn maybe_release_idle_chunk(&mut self, chunk_idx: usize, stats: &ArenaStats) {
        let (tier, fully_free) = {
            let c = self.chunks[chunk_idx].as_ref().unwrap();
            (c.tier, c.is_fully_free())
        };
        if tier == UsageTier::Q000 && fully_free && self.q_heads[tier_idx(UsageTier::QInit)].is_some()
        {
            self.q_remove(chunk_idx);
            self.chunks[chunk_idx] = None;
            self.free_slots.push(chunk_idx);
            stats.chunks_released.increment();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::os::HeapChunkProvider;
    use crate::size_class::classify;

    fn arena(cfg: &PoolConfig) -> Arena {
        Arena::new(
            cfg.page_size,
            cfg.max_order,
            false,
            size_class::num_small_classes(cfg.page_size),
            Box::new(HeapChunkProvider),
        )
    }

    #[test]
    fn normal_allocate_then_free_round_trips() {
        let cfg = PoolConfig::default();
        let a = arena(&cfg);
        let class = classify(&cfg, cfg.page_size);
        let alloc = a.allocate(class, cfg.page_size).unwrap();
        let Allocation::Pooled {
            chunk_idx, handle, ..
        } = alloc
        else {
            panic!("expected pooled allocation");
        };
        a.free(chunk_idx, handle, class);
        assert_eq!(a.stats.bytes_allocated.snapshot().current, 0);
    }

    #[test]
    fn tiny_allocations_share_one_subpage() {
        let cfg = PoolConfig::default();
        let a = arena(&cfg);
        let class = classify(&cfg, 32);
        let mut handles = vec![];
        for _ in 0..10 {
            let alloc = a.allocate(class, 32).unwrap();
            let Allocation::Pooled {
                chunk_idx, handle, ..
            } = alloc
            else {
                panic!("expected pooled allocation");
            };
            handles.push((chunk_idx, handle));
        }
        // all ten should land in the same chunk/page since one page holds
        // page_size / 32 = 256 slots.
        let first_chunk = handles[0].0;
        assert!(handles.iter().all(|(c, _)| *c == first_chunk));
        for (chunk_idx, handle) in handles {
            a.free(chunk_idx, handle, class);
        }
    }

    #[test]
    fn huge_allocation_bypasses_pool() {
        let cfg = PoolConfig::default();
        let a = arena(&cfg);
        let class = classify(&cfg, cfg.chunk_size() + 1);
        let alloc = a.allocate(class, cfg.chunk_size() + 1).unwrap();
        assert!(matches!(alloc, Allocation::Huge { .. }));
    }

    #[test]
    fn allocating_whole_chunk_then_freeing_releases_it_when_qinit_has_a_spare() {
        let cfg = PoolConfig::default();
        let a = arena(&cfg);
        let class = classify(&cfg, cfg.chunk_size());
        let alloc1 = a.allocate(class, cfg.chunk_size()).unwrap();
        let Allocation::Pooled {
            chunk_idx: c1,
            handle: h1,
            ..
        } = alloc1
        else {
            panic!()
        };
        let alloc2 = a.allocate(class, cfg.chunk_size()).unwrap();
        let Allocation::Pooled {
            chunk_idx: c2,
            handle: h2,
            ..
        } = alloc2
        else {
            panic!()
        };
        assert_ne!(c1, c2);
        a.free(c1, h1, class);
        a.free(c2, h2, class);
    }
}
