//! The placement engine, coalescer, integrity monitor, and lifecycle control
//! tying together the region, both lists, stats, and the leak table.

use std::ptr::null_mut;
use std::time::Instant;

use crate::block::{
    self, BlockHeader, BlockId, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, header, header_mut,
    payload_ptr, set_footer, write_header,
};
use crate::config::{ALIGNMENT, HEAP_SIZE, align_up};
use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, StderrSink};
use crate::free_list::FreeListIndex;
use crate::leak::{AllocationRecord, LeakTable};
use crate::origin::Origin;
use crate::region::Region;
use crate::size_class::class_of;
use crate::stats::Stats;
use crate::used_list::UsedList;

#[cfg(feature = "memory-guards")]
const GUARD_RESERVE: usize = 2 * ALIGNMENT;
#[cfg(not(feature = "memory-guards"))]
const GUARD_RESERVE: usize = 0;

pub(crate) struct HeapInner {
    region: Option<Region>,
    free_lists: FreeListIndex,
    used_list: UsedList,
    stats: Stats,
    leaks: LeakTable,
    next_alloc_id: u32,
    sink: Box<dyn DiagnosticSink>,
}

impl HeapInner {
    pub(crate) fn new() -> Self {
        Self {
            region: None,
            free_lists: FreeListIndex::new(),
            used_list: UsedList::new(),
            stats: Stats::new(),
            leaks: LeakTable::new(),
            next_alloc_id: 1,
            sink: Box::new(StderrSink),
        }
    }

    pub(crate) fn set_diagnostic_sink(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.sink = sink;
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Idempotent: a second call while already initialized is a no-op.
    pub(crate) fn initialize(&mut self) {
        if self.region.is_some() {
            return;
        }
        let Some(mut region) = Region::acquire(HEAP_SIZE) else {
            self.sink.report(DiagnosticEvent::RegionAcquisitionFailed);
            return;
        };

        let first_size = (HEAP_SIZE - HEADER_SIZE - FOOTER_SIZE) as u32;
        let first_id = BlockId::at(0);
        write_header(&mut region, first_id, BlockHeader::fresh_free(first_size));
        set_footer(&mut region, first_id, first_size, true);
        self.free_lists.insert(&mut region, first_id);

        #[cfg(feature = "stats")]
        {
            self.stats.free_bytes = first_size as u64;
            self.stats.free_blocks = 1;
            self.stats.largest_free_block = first_size as u64;
            self.stats.smallest_free_block = first_size as u64;
        }

        self.region = Some(region);

        #[cfg(feature = "debug-level-1")]
        eprintln!("blockheap: initialized with {HEAP_SIZE} bytes");
    }

    /// Drains the leak table, releases the region, clears every list head.
    pub(crate) fn cleanup(&mut self) {
        if self.region.is_none() {
            return;
        }
        self.leaks.clear();
        self.region = None; // Region::drop releases the backing buffer.
        self.free_lists = FreeListIndex::new();
        self.used_list = UsedList::new();
        self.next_alloc_id = 1;

        #[cfg(feature = "debug-level-1")]
        eprintln!("blockheap: cleaned up");
    }

    fn ensure_initialized(&mut self) {
        if self.region.is_none() {
            self.initialize();
        }
    }

    pub(crate) fn allocate(&mut self, requested_size: usize, origin: Origin) -> *mut u8 {
        if requested_size == 0 {
            return null_mut();
        }
        self.ensure_initialized();
        let Self {
            region,
            free_lists,
            used_list,
            stats,
            leaks,
            next_alloc_id,
            sink,
        } = self;
        let Some(region) = region.as_mut() else {
            return null_mut();
        };

        #[cfg(feature = "debug-level-2")]
        check_heap_integrity(region, free_lists, used_list, stats, leaks, sink);

        #[cfg(feature = "stats")]
        let start = Instant::now();
        #[cfg(feature = "stats")]
        {
            stats.total_allocations += 1;
        }

        let padded = requested_size + GUARD_RESERVE;
        let aligned = align_up(padded, ALIGNMENT);

        let Some(chosen) = free_lists.find_best_fit(region, aligned) else {
            #[cfg(feature = "stats")]
            stats.record_failed_allocation();
            return null_mut();
        };

        // Remove while `header.size` is still the block's pre-split size, so
        // the bucket we remove from matches the bucket it was inserted under
        // (re-bucketing must happen on every
        // size change, including the one `split_block` is about to make).
        free_lists.remove(region, chosen);

        let original_size = header(region, chosen).size;
        if original_size as usize >= aligned + MIN_BLOCK_SIZE + GUARD_RESERVE {
            let remainder_size =
                (original_size as usize - aligned - HEADER_SIZE - FOOTER_SIZE) as u32;
            header_mut(region, chosen).size = aligned as u32;
            let remainder_id = BlockId::at(chosen.offset() + HEADER_SIZE + aligned + FOOTER_SIZE);
            write_header(region, remainder_id, BlockHeader::fresh_free(remainder_size));
            set_footer(region, remainder_id, remainder_size, true);
            free_lists.insert(region, remainder_id);
            #[cfg(feature = "stats")]
            stats.record_split();
        }

        let final_size = header(region, chosen).size;
        let alloc_id = *next_alloc_id;
        *next_alloc_id = next_alloc_id.wrapping_add(1);
        {
            let h = header_mut(region, chosen);
            h.free = false;
            h.request_size = requested_size as u32;
            h.address_tag = 1;
            h.alloc_id = alloc_id;
        }
        used_list.insert(region, chosen);
        set_footer(region, chosen, final_size, false);

        let mut user_ptr = payload_ptr(region, chosen);
        #[cfg(feature = "memory-guards")]
        {
            // SAFETY: `chosen`'s payload is `final_size >= aligned >= requested_size + 2*ALIGNMENT` bytes.
            unsafe {
                user_ptr = user_ptr.add(ALIGNMENT);
                stamp_guard_bytes(user_ptr, requested_size);
            }
        }
        // SAFETY: `user_ptr` is the start of a live payload of at least `requested_size` bytes.
        unsafe {
            std::ptr::write_bytes(user_ptr, 0, requested_size);
        }

        #[cfg(feature = "leak-detection")]
        leaks.record(
            user_ptr as usize,
            AllocationRecord {
                requested_size,
                alloc_id,
                origin,
            },
        );

        #[cfg(feature = "stats")]
        {
            let overhead = HEADER_SIZE + FOOTER_SIZE + (aligned - requested_size);
            stats.record_allocation(requested_size, final_size, class_of(aligned), overhead);
            stats.add_alloc_time(start.elapsed());
            recompute_fragmentation(region, free_lists, stats);
        }

        user_ptr
    }

    pub(crate) fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.ensure_initialized();
        let Self {
            region,
            free_lists,
            used_list,
            stats,
            leaks,
            sink,
            ..
        } = self;
        let Some(region) = region.as_mut() else {
            return;
        };

        #[cfg(feature = "debug-level-2")]
        check_heap_integrity(region, free_lists, used_list, stats, leaks, sink);

        #[cfg(feature = "stats")]
        let start = Instant::now();

        let Some(id) = user_ptr_to_header_id(region, ptr) else {
            sink.report(DiagnosticEvent::OutOfBounds { location: "free" });
            return;
        };
        validate_block(region, id, "free", sink);

        let h = header(region, id);
        if h.free {
            sink.report(DiagnosticEvent::DoubleFree { alloc_id: h.alloc_id });
            return;
        }

        #[cfg(feature = "memory-guards")]
        {
            let request_size = h.request_size as usize;
            let alloc_id = h.alloc_id;
            if !check_guard_bytes(ptr, request_size) {
                sink.report(DiagnosticEvent::BufferOverrun { alloc_id });
            }
        }

        let block_size = h.size;
        let class = class_of(block_size as usize);

        #[cfg(feature = "stats")]
        stats.record_free(block_size, class);

        header_mut(region, id).free = true;
        header_mut(region, id).address_tag = 0;
        used_list.remove(region, id);
        free_lists.insert(region, id);
        set_footer(region, id, block_size, true);

        coalesce(region, free_lists, stats, id);

        #[cfg(feature = "leak-detection")]
        leaks.unrecord(ptr as usize);

        #[cfg(feature = "stats")]
        {
            stats.add_free_time(start.elapsed());
            recompute_fragmentation(region, free_lists, stats);
        }
    }

    pub(crate) fn reallocate(&mut self, ptr: *mut u8, new_size: usize, origin: Origin) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size, origin);
        }
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }
        self.ensure_initialized();

        let old_request_size;
        let required_total = align_up(new_size + GUARD_RESERVE, ALIGNMENT);
        let shrink_in_place;
        {
            let Some(region) = self.region.as_ref() else {
                return null_mut();
            };
            let Some(id) = user_ptr_to_header_id(region, ptr) else {
                self.sink.report(DiagnosticEvent::OutOfBounds { location: "reallocate" });
                return null_mut();
            };
            let h = header(region, id);
            if !h.sentinels_valid() || h.free {
                return null_mut();
            }
            old_request_size = h.request_size as usize;

            if required_total <= h.size as usize {
                shrink_in_place = Some(id);
            } else {
                shrink_in_place = None;
            }
        }

        match shrink_in_place {
            Some(id) => {
                let Self {
                    region,
                    free_lists,
                    stats,
                    ..
                } = self;
                let region = region.as_mut().expect("checked above");
                let current_size = header(region, id).size;

                if current_size as usize >= required_total + MIN_BLOCK_SIZE + GUARD_RESERVE {
                    let tail_size =
                        (current_size as usize - required_total - HEADER_SIZE - FOOTER_SIZE) as u32;
                    header_mut(region, id).size = required_total as u32;
                    set_footer(region, id, required_total as u32, false);
                    let tail_id =
                        BlockId::at(id.offset() + HEADER_SIZE + required_total + FOOTER_SIZE);
                    write_header(region, tail_id, BlockHeader::fresh_free(tail_size));
                    set_footer(region, tail_id, tail_size, true);
                    free_lists.insert(region, tail_id);
                    #[cfg(feature = "stats")]
                    stats.record_split();
                }

                header_mut(region, id).request_size = new_size as u32;
                let mut user_ptr = payload_ptr(region, id);
                #[cfg(feature = "memory-guards")]
                {
                    unsafe {
                        user_ptr = user_ptr.add(ALIGNMENT);
                        stamp_guard_bytes(user_ptr, new_size);
                    }
                }
                user_ptr
            }
            None => {
                let new_ptr = self.allocate(new_size, origin);
                if new_ptr.is_null() {
                    return null_mut();
                }
                let copy_len = old_request_size.min(new_size);
                // SAFETY: `ptr` and `new_ptr` are both live, non-overlapping payloads
                // of at least `copy_len` bytes (distinct blocks, `new_ptr` freshly allocated).
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
                }
                self.free(ptr);
                new_ptr
            }
        }
    }

    pub(crate) fn zero_allocate(&mut self, count: usize, element_size: usize, origin: Origin) -> *mut u8 {
        if count > 0 && element_size > usize::MAX / count {
            return null_mut();
        }
        self.allocate(count * element_size, origin)
    }

    pub(crate) fn size_of(&mut self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.ensure_initialized();
        let Some(region) = self.region.as_ref() else {
            return 0;
        };
        let Some(id) = user_ptr_to_header_id(region, ptr) else {
            self.sink.report(DiagnosticEvent::OutOfBounds { location: "size_of" });
            return 0;
        };
        let h = header(region, id);
        if !h.sentinels_valid() || h.free {
            return 0;
        }
        h.request_size as usize
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats
    }

    #[cfg(feature = "leak-detection")]
    pub(crate) fn leaked_allocations(&self) -> Vec<(usize, AllocationRecord)> {
        self.leaks.iter().map(|(ptr, record)| (ptr, *record)).collect()
    }
}

/// Translates a user pointer back to its header's [`BlockId`], undoing the
/// guard-band shift and rejecting anything outside the region — a pointer
/// the caller didn't get from this allocator surfaces as `None` here rather
/// than as an out-of-bounds panic (invalid pointers are
/// reported, never crash the process).
fn user_ptr_to_header_id(region: &Region, ptr: *mut u8) -> Option<BlockId> {
    let base = region.base() as usize;
    let addr = ptr as usize;
    let mut rel = addr.checked_sub(base)?;
    #[cfg(feature = "memory-guards")]
    {
        rel = rel.checked_sub(ALIGNMENT)?;
    }
    let rel = rel.checked_sub(HEADER_SIZE)?;
    if rel + HEADER_SIZE > region.len() {
        return None;
    }
    Some(BlockId::at(rel))
}

/// Flags corruption or out-of-range size but never halts.
fn validate_block(region: &Region, id: BlockId, location: &'static str, sink: &mut dyn DiagnosticSink) {
    let h = header(region, id);
    if !h.sentinels_valid() {
        sink.report(DiagnosticEvent::SentinelCorruption { location });
    }
    if h.size as usize > HEAP_SIZE {
        sink.report(DiagnosticEvent::SentinelCorruption { location });
    }
    #[cfg(feature = "boundary-tags")]
    {
        let footer = block::footer(region, id, h.size);
        if footer.sentinel != crate::config::FOOTER_SENTINEL
            || footer.size != h.size
            || footer.free != h.free
        {
            sink.report(DiagnosticEvent::FooterCorruption { location });
        }
    }
}

/// Merge with the next physical neighbor always, and
/// with the previous physical neighbor when boundary tags are enabled.
/// Always removes-then-reinserts into the free-list index on every size
/// change, resolving the re-bucketing wrinkle.
fn coalesce(region: &mut Region, free_lists: &mut FreeListIndex, stats: &mut Stats, mut id: BlockId) -> BlockId {
    let size = header(region, id).size;
    if let Some(next_id) = block::next_physical(region, id, size) {
        if header(region, next_id).free {
            let next_size = header(region, next_id).size;
            free_lists.remove(region, next_id);
            free_lists.remove(region, id);
            let merged = size + HEADER_SIZE as u32 + next_size + FOOTER_SIZE as u32;
            header_mut(region, id).size = merged;
            set_footer(region, id, merged, true);
            free_lists.insert(region, id);
            #[cfg(feature = "stats")]
            stats.record_coalesce();
        }
    }

    #[cfg(feature = "boundary-tags")]
    {
        if let Some(prev_id) = block::prev_physical(region, id) {
            if header(region, prev_id).free {
                let current_size = header(region, id).size;
                let prev_size = header(region, prev_id).size;
                free_lists.remove(region, id);
                free_lists.remove(region, prev_id);
                let merged = prev_size + HEADER_SIZE as u32 + current_size + FOOTER_SIZE as u32;
                header_mut(region, prev_id).size = merged;
                set_footer(region, prev_id, merged, true);
                free_lists.insert(region, prev_id);
                #[cfg(feature = "stats")]
                stats.record_coalesce();
                id = prev_id;
            }
        }
    }
    let _ = stats;
    id
}

#[cfg(feature = "stats")]
fn recompute_fragmentation(region: &Region, free_lists: &FreeListIndex, stats: &mut Stats) {
    let mut count = 0usize;
    let mut largest = 0u64;
    let mut smallest = u64::MAX;
    free_lists.for_each(region, |_, h| {
        count += 1;
        largest = largest.max(h.size as u64);
        smallest = smallest.min(h.size as u64);
    });
    stats.recompute_fragmentation(count, largest, smallest);
}

/// Only active at `debug-level-2`: tallies both lists (count and byte sum)
/// and cross-checks against statistics and the leak table, reporting but
/// never halting on drift.
#[cfg(feature = "debug-level-2")]
fn check_heap_integrity(
    region: &Region,
    free_lists: &FreeListIndex,
    used_list: &UsedList,
    stats: &Stats,
    leaks: &LeakTable,
    sink: &mut dyn DiagnosticSink,
) {
    let mut free_count = 0usize;
    let mut free_bytes = 0u64;
    free_lists.for_each(region, |id, h| {
        validate_block(region, id, "heap_check_free", sink);
        free_count += 1;
        free_bytes += h.size as u64;
    });

    let mut used_count = 0usize;
    let mut used_bytes = 0u64;
    used_list.for_each(region, |id, h| {
        validate_block(region, id, "heap_check_used", sink);
        used_count += 1;
        used_bytes += h.size as u64;
    });

    #[cfg(feature = "stats")]
    {
        if stats.free_blocks as usize != free_count {
            sink.report(DiagnosticEvent::StatsDrift {
                kind: "free_blocks",
                expected: stats.free_blocks,
                observed: free_count as u64,
            });
        }
        if stats.allocated_blocks as usize != used_count {
            sink.report(DiagnosticEvent::StatsDrift {
                kind: "allocated_blocks",
                expected: stats.allocated_blocks,
                observed: used_count as u64,
            });
        }
        if stats.free_bytes != free_bytes {
            sink.report(DiagnosticEvent::StatsDrift {
                kind: "free_bytes",
                expected: stats.free_bytes,
                observed: free_bytes,
            });
        }
        if stats.allocated_bytes != used_bytes {
            sink.report(DiagnosticEvent::StatsDrift {
                kind: "allocated_bytes",
                expected: stats.allocated_bytes,
                observed: used_bytes,
            });
        }
    }
    #[cfg(not(feature = "stats"))]
    let _ = (stats, free_bytes, used_bytes);

    #[cfg(feature = "leak-detection")]
    if leaks.len() != used_count {
        sink.report(DiagnosticEvent::StatsDrift {
            kind: "leak_table_entries",
            expected: used_count as u64,
            observed: leaks.len() as u64,
        });
    }
    #[cfg(not(feature = "leak-detection"))]
    let _ = leaks;
}

#[cfg(feature = "memory-guards")]
fn stamp_guard_bytes(user_ptr: *mut u8, requested_size: usize) {
    // SAFETY: caller guarantees `ALIGNMENT` bytes of guard band are reserved
    // immediately before and after the `requested_size`-byte payload.
    unsafe {
        std::ptr::write_bytes(user_ptr.sub(ALIGNMENT), crate::config::GUARD_BYTE, ALIGNMENT);
        std::ptr::write_bytes(user_ptr.add(requested_size), crate::config::GUARD_BYTE, ALIGNMENT);
    }
}

#[cfg(feature = "memory-guards")]
fn check_guard_bytes(user_ptr: *mut u8, requested_size: usize) -> bool {
    // SAFETY: see `stamp_guard_bytes`.
    unsafe {
        let before = std::slice::from_raw_parts(user_ptr.sub(ALIGNMENT), ALIGNMENT);
        let after = std::slice::from_raw_parts(user_ptr.add(requested_size), ALIGNMENT);
        before.iter().all(|&b| b == crate::config::GUARD_BYTE)
            && after.iter().all(|&b| b == crate::config::GUARD_BYTE)
    }
}
