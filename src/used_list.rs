//! The used-list ledger: a single doubly-linked list of in-use blocks.
//!
//! Traversal-only (leak cross-reference, integrity sweeps); never searched
//! during allocation.

use crate::block::{BlockId, header, header_mut};
use crate::region::Region;

pub(crate) struct UsedList {
    head: Option<BlockId>,
}

impl UsedList {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<BlockId> {
        self.head
    }

    /// LIFO insertion, ignoring any pre-existing link fields.
    pub(crate) fn insert(&mut self, region: &mut Region, id: BlockId) {
        let old_head = self.head;
        {
            let h = header_mut(region, id);
            h.set_prev_link(None);
            h.set_next_link(old_head);
        }
        if let Some(old) = old_head {
            header_mut(region, old).set_prev_link(Some(id));
        }
        self.head = Some(id);
    }

    pub(crate) fn remove(&mut self, region: &mut Region, id: BlockId) {
        let (prev, next) = {
            let h = header(region, id);
            (h.prev_link(), h.next_link())
        };
        match prev {
            Some(p) => header_mut(region, p).set_next_link(next),
            None => self.head = next,
        }
        if let Some(n) = next {
            header_mut(region, n).set_prev_link(prev);
        }
        header_mut(region, id).reset_links();
    }

    pub(crate) fn for_each(&self, region: &Region, mut visit: impl FnMut(BlockId, &crate::block::BlockHeader)) {
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let h = header(region, cur);
            visit(cur, h);
            cursor = h.next_link();
        }
    }
}
