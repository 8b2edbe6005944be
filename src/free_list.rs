//! Segregated free-list index: one doubly-linked bucket per size class,
//! LIFO insertion by default with an address-ordered mode for the smallest
//! classes gated behind `cache-locality`.

use crate::block::{BlockId, header, header_mut};
use crate::config::NUM_CLASSES;
use crate::region::Region;
use crate::size_class::class_of;

pub(crate) struct FreeListIndex {
    heads: [Option<BlockId>; NUM_CLASSES],
}

impl FreeListIndex {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; NUM_CLASSES],
        }
    }

    #[inline]
    pub(crate) fn head(&self, class: usize) -> Option<BlockId> {
        self.heads[class]
    }

    /// Insert `id` into the bucket for its *current* `header.size`. Ignores
    /// any pre-existing link fields: they are reset first.
    pub(crate) fn insert(&mut self, region: &mut Region, id: BlockId) {
        let size = header(region, id).size as usize;
        let class = class_of(size);
        header_mut(region, id).reset_links();

        #[cfg(feature = "cache-locality")]
        {
            if class < 4 {
                self.insert_address_ordered(region, class, id);
                return;
            }
        }
        self.insert_lifo(class, region, id);
    }

    fn insert_lifo(&mut self, class: usize, region: &mut Region, id: BlockId) {
        let old_head = self.heads[class];
        {
            let h = header_mut(region, id);
            h.set_next_link(old_head);
            h.set_prev_link(None);
        }
        if let Some(old) = old_head {
            header_mut(region, old).set_prev_link(Some(id));
        }
        self.heads[class] = Some(id);
    }

    /// Order-preserving insertion by address, used for the four smallest
    /// classes under `cache-locality` to improve locality of consecutive
    /// allocations.
    #[cfg(feature = "cache-locality")]
    fn insert_address_ordered(&mut self, region: &mut Region, class: usize, id: BlockId) {
        let mut prev: Option<BlockId> = None;
        let mut cursor = self.heads[class];
        while let Some(cur) = cursor {
            if cur.offset() > id.offset() {
                break;
            }
            prev = Some(cur);
            cursor = header(region, cur).next_link();
        }

        {
            let h = header_mut(region, id);
            h.set_prev_link(prev);
            h.set_next_link(cursor);
        }
        if let Some(next) = cursor {
            header_mut(region, next).set_prev_link(Some(id));
        }
        match prev {
            Some(p) => header_mut(region, p).set_next_link(Some(id)),
            None => self.heads[class] = Some(id),
        }
    }

    /// Remove `id` from whichever bucket its current `header.size` maps to.
    pub(crate) fn remove(&mut self, region: &mut Region, id: BlockId) {
        let size = header(region, id).size as usize;
        let class = class_of(size);
        let (prev, next) = {
            let h = header(region, id);
            (h.prev_link(), h.next_link())
        };

        match prev {
            Some(p) => header_mut(region, p).set_next_link(next),
            None => self.heads[class] = next,
        }
        if let Some(n) = next {
            header_mut(region, n).set_prev_link(prev);
        }
        header_mut(region, id).reset_links();
    }

    /// Best-fit search starting in `class_of(aligned_size)`; falls through to
    /// the first populated higher class on a class-1 miss.
    pub(crate) fn find_best_fit(&self, region: &Region, aligned_size: usize) -> Option<BlockId> {
        let start_class = class_of(aligned_size);
        let mut best: Option<(BlockId, u32)> = None;
        let mut cursor = self.heads[start_class];
        while let Some(cur) = cursor {
            let h = header(region, cur);
            if h.size as usize >= aligned_size {
                let diff = h.size - aligned_size as u32;
                if diff == 0 {
                    return Some(cur);
                }
                let better = match best {
                    Some((_, best_diff)) => diff < best_diff,
                    None => true,
                };
                if better {
                    best = Some((cur, diff));
                }
            }
            cursor = h.next_link();
        }
        if best.is_some() {
            return best.map(|(id, _)| id);
        }

        for class in (start_class + 1)..NUM_CLASSES {
            if let Some(id) = self.heads[class] {
                return Some(id);
            }
        }
        None
    }

    /// Walk every free block across every class, for accounting/integrity use.
    pub(crate) fn for_each(&self, region: &Region, mut visit: impl FnMut(BlockId, &crate::block::BlockHeader)) {
        for class in 0..NUM_CLASSES {
            let mut cursor = self.heads[class];
            while let Some(cur) = cursor {
                let h = header(region, cur);
                visit(cur, h);
                cursor = h.next_link();
            }
        }
    }
}
