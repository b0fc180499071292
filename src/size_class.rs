//! Size-class normalization, §3 "Size classes".
//!
//! A requested capacity is rounded up to a canonical class so the arena and
//! thread cache only ever deal with a bounded number of buckets instead of
//! arbitrary byte counts.

use crate::config::PoolConfig;

pub const TINY_CLASSES: usize = 32;
const TINY_STEP: usize = 16;
const TINY_MAX: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClassKind {
    /// `1 <= c < 512`, multiples of 16.
    Tiny,
    /// `512 <= c < page_size`, successive powers of two.
    Small,
    /// `page_size <= c <= chunk_size`, `page_size << k`.
    Normal,
    /// `c > chunk_size`: bypasses the pool entirely.
    Huge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub kind: SizeClassKind,
    /// Index into the per-kind table (tiny: 1..32, small: 0..num_small,
    /// normal: 0..=max_order). Meaningless for `Huge`.
    pub index: usize,
    /// The normalized capacity, `>= requested`.
    pub size: usize,
}

/// Number of small classes for a given page size: successive powers of two
/// from 512 up to (but excluding) `page_size`.
pub fn num_small_classes(page_size: usize) -> usize {
    let mut n = 0;
    let mut s = TINY_MAX;
    while s < page_size {
        n += 1;
        s <<= 1;
    }
    n
}

/// Normalizes `requested` (1-based capacity) into a `SizeClass` per §3.
///
/// Caller must separately handle `requested == 0` (not a valid capacity for
/// a buffer; the public API rejects it before this is reached).
pub fn classify(cfg: &PoolConfig, requested: usize) -> SizeClass {
    let chunk_size = cfg.chunk_size();
    if requested > chunk_size {
        return SizeClass {
            kind: SizeClassKind::Huge,
            index: 0,
            size: requested,
        };
    }
    if requested < TINY_MAX {
        // classes are multiples of 16; index 0 is unused (normalize(0) never
        // reached since capacity >= 1), so index = ceil(requested / 16).
        let index = requested.div_ceil(TINY_STEP).max(1);
        return SizeClass {
            kind: SizeClassKind::Tiny,
            index,
            size: index * TINY_STEP,
        };
    }
    if requested < cfg.page_size {
        let mut size = TINY_MAX;
        let mut index = 0;
        while size < requested {
            size <<= 1;
            index += 1;
        }
        return SizeClass {
            kind: SizeClassKind::Small,
            index,
            size,
        };
    }
    // Normal: page_size << k for the smallest k with page_size << k >= requested.
    let mut k = 0u32;
    let mut size = cfg.page_size;
    while size < requested {
        size <<= 1;
        k += 1;
    }
    SizeClass {
        kind: SizeClassKind::Normal,
        index: k as usize,
        size,
    }
}

/// `size_in_pages` for a normal-class allocation (1 for a single page run).
pub fn pages_for_normal(cfg: &PoolConfig, class: &SizeClass) -> usize {
    debug_assert_eq!(class.kind, SizeClassKind::Normal);
    class.size / cfg.page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PoolConfig {
        PoolConfig::default()
    }

    #[test]
    fn tiny_rounds_up_to_multiple_of_16() {
        let c = classify(&cfg(), 1);
        assert_eq!(c.kind, SizeClassKind::Tiny);
        assert_eq!(c.size, 16);

        let c = classify(&cfg(), 17);
        assert_eq!(c.size, 32);

        let c = classify(&cfg(), 511);
        assert_eq!(c.size, 512);
    }

    #[test]
    fn small_rounds_up_to_power_of_two() {
        let c = classify(&cfg(), 512);
        assert_eq!(c.kind, SizeClassKind::Small);
        assert_eq!(c.size, 512);

        let c = classify(&cfg(), 513);
        assert_eq!(c.size, 1024);

        let c = classify(&cfg(), 8191);
        assert_eq!(c.size, 8192);
    }

    #[test]
    fn normal_rounds_up_to_page_multiple_power_of_two() {
        let cfg = cfg();
        let c = classify(&cfg, cfg.page_size);
        assert_eq!(c.kind, SizeClassKind::Normal);
        assert_eq!(c.size, cfg.page_size);
        assert_eq!(c.index, 0);

        let c = classify(&cfg, cfg.page_size + 1);
        assert_eq!(c.size, cfg.page_size * 2);
        assert_eq!(c.index, 1);
    }

    #[test]
    fn huge_bypasses_classing() {
        let cfg = cfg();
        let c = classify(&cfg, cfg.chunk_size() + 1);
        assert_eq!(c.kind, SizeClassKind::Huge);
        assert_eq!(c.size, cfg.chunk_size() + 1);
    }

    #[test]
    fn monotonicity_holds_across_boundaries() {
        let cfg = cfg();
        let mut prev = classify(&cfg, 1).size;
        for c in 2..=cfg.chunk_size() + 4096 {
            let cur = classify(&cfg, c).size;
            assert!(cur >= prev, "normalize not monotonic at {}", c);
            prev = cur;
        }
    }

    #[test]
    fn num_small_classes_matches_default_page_size() {
        assert_eq!(num_small_classes(8192), 4);
    }
}
