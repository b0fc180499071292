//! Allocation handle encoding, §3 "Allocation handle".
//!
//! A handle is an opaque `u64` identifying where inside a chunk an
//! allocation lives: either a node in the buddy tree (normal allocations)
//! or a generation-stamped slot in a subpage's bitmap (tiny/small
//! allocations). The top bit distinguishes the two.

const SUBPAGE_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    /// A buddy-tree node id (normal allocation).
    Normal { node_id: u32 },
    /// A slot inside a page's subpage, with a generation stamp to detect
    /// stale handles across subpage reuse.
    Subpage { node_id: u32, bitmap_idx: u32 },
}

impl Handle {
    pub fn encode(self) -> u64 {
        match self {
            Handle::Normal { node_id } => node_id as u64,
            Handle::Subpage {
                node_id,
                bitmap_idx,
            } => SUBPAGE_FLAG | ((bitmap_idx as u64) << 32) | node_id as u64,
        }
    }

    pub fn decode(raw: u64) -> Handle {
        if raw & SUBPAGE_FLAG != 0 {
            Handle::Subpage {
                node_id: (raw & 0xFFFF_FFFF) as u32,
                bitmap_idx: ((raw >> 32) & 0x7FFF_FFFF) as u32,
            }
        } else {
            Handle::Normal {
                node_id: (raw & 0xFFFF_FFFF) as u32,
            }
        }
    }

    pub fn node_id(self) -> u32 {
        match self {
            Handle::Normal { node_id } => node_id,
            Handle::Subpage { node_id, .. } => node_id,
        }
    }

    pub fn is_subpage(self) -> bool {
        matches!(self, Handle::Subpage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_round_trips() {
        let h = Handle::Normal { node_id: 12345 };
        assert_eq!(Handle::decode(h.encode()), h);
    }

    #[test]
    fn subpage_round_trips() {
        let h = Handle::Subpage {
            node_id: 7,
            bitmap_idx: 99,
        };
        assert_eq!(Handle::decode(h.encode()), h);
        assert!(h.is_subpage());
    }

    #[test]
    fn subpage_flag_distinguishes_kinds() {
        let normal = Handle::Normal { node_id: 1 }.encode();
        let subpage = Handle::Subpage {
            node_id: 1,
            bitmap_idx: 0,
        }
        .encode();
        assert_ne!(normal & (1 << 63), subpage & (1 << 63));
    }
}
