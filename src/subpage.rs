//! Subpage — fixed-element bitmap slab, §4.2.
//!
//! A page split into `n = page_size / s` equal slots. `free_bitmap` tracks
//! which slots are free (bit set == free); list membership (one arena-wide
//! LRU list per size class) is linked intrusively through `prev`/`next`,
//! which the owning `Arena` maintains since the list spans chunks.

/// Identifies a subpage by where it lives: `(chunk_idx, page_idx)` into the
/// owning arena's chunk slab. Stands in for the pointer the teacher's C
/// lineage would use (§9 "Recommended strategy": indices instead of raw
/// pointers to avoid an ownership cycle).
pub type SubpageKey = (usize, usize);

pub struct Subpage {
    element_size: usize,
    slot_count: usize,
    free_bitmap: Vec<u64>,
    free_count: usize,
    /// Rotating search hint so `allocate_slot` doesn't always rescan from
    /// bit zero (§4.2 "find next set bit ... starting from a rotating
    /// hint").
    hint: usize,
    /// Bumped every time this subpage's backing page is handed out fresh,
    /// to let a handle's high bits detect a stale reference across reuse.
    pub generation: u32,
    pub key: SubpageKey,
    /// Index into the arena's per-class head table this subpage currently
    /// lives in (tiny: 0..32, small: 0..num_small_classes), plus whether
    /// that table is the tiny or small one.
    pub class_list_idx: usize,
    pub is_tiny_class: bool,
    pub prev: Option<SubpageKey>,
    pub next: Option<SubpageKey>,
    pub in_list: bool,
}

impl Subpage {
    pub fn new(
        element_size: usize,
        page_size: usize,
        key: SubpageKey,
        class_list_idx: usize,
        is_tiny_class: bool,
        generation: u32,
    ) -> Subpage {
        debug_assert!(element_size > 0 && page_size % element_size == 0);
        let slot_count = page_size / element_size;
        let words = slot_count.div_ceil(64);
        let mut free_bitmap = vec![!0u64; words];
        // clear the bits beyond slot_count in the last word
        let remainder = slot_count % 64;
        if remainder != 0 {
            let mask = (1u64 << remainder) - 1;
            *free_bitmap.last_mut().unwrap() &= mask;
        }
        Subpage {
            element_size,
            slot_count,
            free_bitmap,
            free_count: slot_count,
            hint: 0,
            generation,
            key,
            class_list_idx,
            is_tiny_class,
            prev: None,
            next: None,
            in_list: false,
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_count == self.slot_count
    }

    /// §4.2 `allocate()`. `None` only if the subpage was already full, which
    /// callers must not do (the arena only reaches a subpage it knows has
    /// room).
    pub fn allocate_slot(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let total_bits = self.free_bitmap.len() * 64;
        for offset in 0..total_bits {
            let idx = (self.hint + offset) % total_bits;
            let word = idx / 64;
            let bit = idx % 64;
            if self.free_bitmap[word] & (1 << bit) != 0 {
                self.free_bitmap[word] &= !(1 << bit);
                self.free_count -= 1;
                self.hint = (idx + 1) % total_bits;
                return Some(idx as u32);
            }
        }
        unreachable!("free_count said a slot was available");
    }

    /// §4.2 `free(bitmapIdx)`. Returns `true` if this slot's release made
    /// the subpage fully free (bitmap invariant: bit == free).
    pub fn free_slot(&mut self, bitmap_idx: u32) -> bool {
        let idx = bitmap_idx as usize;
        let word = idx / 64;
        let bit = idx % 64;
        debug_assert_eq!(
            self.free_bitmap[word] & (1 << bit),
            0,
            "double free of subpage slot {idx}"
        );
        self.free_bitmap[word] |= 1 << bit;
        self.free_count += 1;
        self.is_fully_free()
    }

    #[cfg(test)]
    pub fn popcount(&self) -> usize {
        self.free_bitmap
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}
