//! Block header/footer layout and physical-neighbor navigation.
//!
//! The rest of the crate manipulates blocks only through [`BlockId`] (a
//! region-relative byte offset), never a raw pointer.

use std::mem::size_of;

use crate::config::{ALIGNMENT, FOOTER_SENTINEL, SENTINEL_VALUE, align_up};
use crate::region::Region;

/// Offset-keyed handle to a block header within a [`Region`].
///
/// Deliberately not `Copy`-compatible with any pointer type: the only way to
/// turn a `BlockId` into a memory access is through this module's
/// bounds-checked accessors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockId(u32);

/// Sentinel link value meaning "no block" in a header's `prev`/`next` field.
const NULL_LINK: u32 = u32::MAX;

impl BlockId {
    #[inline]
    pub(crate) const fn at(offset: usize) -> Self {
        Self(offset as u32)
    }

    #[inline]
    pub(crate) const fn offset(self) -> usize {
        self.0 as usize
    }
}

#[inline]
pub(crate) fn encode_link(link: Option<BlockId>) -> u32 {
    match link {
        Some(id) => id.0,
        None => NULL_LINK,
    }
}

#[inline]
pub(crate) fn decode_link(raw: u32) -> Option<BlockId> {
    if raw == NULL_LINK { None } else { Some(BlockId(raw)) }
}

/// The fundamental unit of the backing region's tiling.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct BlockHeader {
    pub(crate) sentinel_start: u32,
    /// Byte length of the payload region following this header.
    pub(crate) size: u32,
    pub(crate) free: bool,
    prev: u32,
    next: u32,
    /// The user's originally requested byte count; `<= size`.
    pub(crate) request_size: u32,
    /// Diagnostic-only marker; non-zero while allocated, zero while free.
    /// Never consulted for validation.
    pub(crate) address_tag: u32,
    pub(crate) alloc_id: u32,
    pub(crate) sentinel_end: u32,
}

pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest payload a split-off remainder block may have: enough room for
/// its own header plus one alignment unit of usable space.
pub(crate) const MIN_BLOCK_SIZE: usize = align_up(HEADER_SIZE + ALIGNMENT, ALIGNMENT);

impl BlockHeader {
    pub(crate) fn fresh_free(size: u32) -> Self {
        Self {
            sentinel_start: SENTINEL_VALUE,
            size,
            free: true,
            prev: NULL_LINK,
            next: NULL_LINK,
            request_size: 0,
            address_tag: 0,
            alloc_id: 0,
            sentinel_end: SENTINEL_VALUE,
        }
    }

    #[inline]
    pub(crate) fn sentinels_valid(&self) -> bool {
        self.sentinel_start == SENTINEL_VALUE && self.sentinel_end == SENTINEL_VALUE
    }

    #[inline]
    pub(crate) fn prev_link(&self) -> Option<BlockId> {
        decode_link(self.prev)
    }

    #[inline]
    pub(crate) fn next_link(&self) -> Option<BlockId> {
        decode_link(self.next)
    }

    #[inline]
    pub(crate) fn set_prev_link(&mut self, link: Option<BlockId>) {
        self.prev = encode_link(link);
    }

    #[inline]
    pub(crate) fn set_next_link(&mut self, link: Option<BlockId>) {
        self.next = encode_link(link);
    }

    #[inline]
    pub(crate) fn reset_links(&mut self) {
        self.prev = NULL_LINK;
        self.next = NULL_LINK;
    }
}

/// Boundary tag mirroring a free block's header, enabling O(1) backward
/// physical traversal. Present only when `boundary-tags` is enabled.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct BlockFooter {
    pub(crate) size: u32,
    pub(crate) free: bool,
    pub(crate) sentinel: u32,
}

#[cfg(feature = "boundary-tags")]
pub(crate) const FOOTER_SIZE: usize = size_of::<BlockFooter>();
#[cfg(not(feature = "boundary-tags"))]
pub(crate) const FOOTER_SIZE: usize = 0;

#[inline]
pub(crate) fn header<'r>(region: &'r Region, id: BlockId) -> &'r BlockHeader {
    let ptr = region.ptr_at(id.offset(), HEADER_SIZE) as *const BlockHeader;
    // SAFETY: `ptr_at` bounds-checked `HEADER_SIZE` bytes at `id.offset()`;
    // every live `BlockId` points at a previously-initialized header.
    unsafe { &*ptr }
}

#[inline]
pub(crate) fn header_mut<'r>(region: &'r mut Region, id: BlockId) -> &'r mut BlockHeader {
    let ptr = region.ptr_at(id.offset(), HEADER_SIZE) as *mut BlockHeader;
    // SAFETY: see `header`; `&mut Region` gives us exclusive access to the bytes.
    unsafe { &mut *ptr }
}

#[inline]
pub(crate) fn write_header(region: &mut Region, id: BlockId, value: BlockHeader) {
    *header_mut(region, id) = value;
}

/// Pointer to the first payload byte following `id`'s header.
#[inline]
pub(crate) fn payload_ptr(region: &Region, id: BlockId) -> *mut u8 {
    region.ptr_at(id.offset() + HEADER_SIZE, 0)
}

/// Total physical span of the block at `id`, header + payload + optional footer.
#[inline]
pub(crate) fn total_span(size: u32) -> usize {
    HEADER_SIZE + size as usize + FOOTER_SIZE
}

/// Rewrite (or, without `boundary-tags`, no-op) the footer to mirror `header`.
#[inline]
pub(crate) fn set_footer(region: &mut Region, id: BlockId, size: u32, free: bool) {
    #[cfg(feature = "boundary-tags")]
    {
        let footer_offset = id.offset() + HEADER_SIZE + size as usize;
        let ptr = region.ptr_at(footer_offset, FOOTER_SIZE) as *mut BlockFooter;
        // SAFETY: bounds-checked above; footer immediately follows the payload.
        unsafe {
            *ptr = BlockFooter {
                size,
                free,
                sentinel: FOOTER_SENTINEL,
            };
        }
    }
    #[cfg(not(feature = "boundary-tags"))]
    {
        let _ = (region, id, size, free);
    }
}

#[cfg(feature = "boundary-tags")]
#[inline]
pub(crate) fn footer(region: &Region, id: BlockId, size: u32) -> BlockFooter {
    let footer_offset = id.offset() + HEADER_SIZE + size as usize;
    let ptr = region.ptr_at(footer_offset, FOOTER_SIZE) as *const BlockFooter;
    // SAFETY: bounds-checked above.
    unsafe { *ptr }
}

/// The next physical block, if one still lies within the region.
#[inline]
pub(crate) fn next_physical(region: &Region, id: BlockId, size: u32) -> Option<BlockId> {
    let next_offset = id.offset() + total_span(size);
    if next_offset + HEADER_SIZE <= region.len() {
        Some(BlockId::at(next_offset))
    } else {
        None
    }
}

/// The previous physical block, located via footer back-walk.
/// Only meaningful with `boundary-tags`; invalid sentinels yield `None`
/// rather than a result.
#[cfg(feature = "boundary-tags")]
pub(crate) fn prev_physical(region: &Region, id: BlockId) -> Option<BlockId> {
    let footer_offset = id.offset().checked_sub(FOOTER_SIZE)?;
    let footer_ptr = region.ptr_at(footer_offset, FOOTER_SIZE) as *const BlockFooter;
    // SAFETY: bounds-checked by `ptr_at`.
    let prev_footer = unsafe { *footer_ptr };
    if prev_footer.sentinel != FOOTER_SENTINEL {
        return None;
    }
    let prev_offset = footer_offset.checked_sub(prev_footer.size as usize + HEADER_SIZE)?;
    let prev_id = BlockId::at(prev_offset);
    let prev_header = header(region, prev_id);
    if !prev_header.sentinels_valid() {
        return None;
    }
    Some(prev_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HEAP_SIZE;

    #[test]
    fn header_round_trips_through_region() {
        let mut region = Region::acquire(HEAP_SIZE).unwrap();
        let id = BlockId::at(0);
        write_header(&mut region, id, BlockHeader::fresh_free(128));
        let read_back = header(&region, id);
        assert!(read_back.sentinels_valid());
        assert_eq!(read_back.size, 128);
        assert!(read_back.free);
    }

    #[test]
    fn next_physical_advances_by_full_span() {
        let region = Region::acquire(HEAP_SIZE).unwrap();
        let id = BlockId::at(0);
        let next = next_physical(&region, id, 64).unwrap();
        assert_eq!(next.offset(), HEADER_SIZE + 64 + FOOTER_SIZE);
    }

    #[test]
    fn next_physical_none_at_region_end() {
        let region = Region::acquire(HEAP_SIZE).unwrap();
        let tail_size = (HEAP_SIZE - HEADER_SIZE - FOOTER_SIZE) as u32;
        let id = BlockId::at(0);
        assert!(next_physical(&region, id, tail_size).is_none());
    }
}
