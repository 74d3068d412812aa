//! Power-of-two heap: eight fixed-class bins plus one big-object bin.
//!
//! Small objects (up to 2048 bytes) are segregated into power-of-two size
//! classes 16..2048, each served by a [`FixedPage`] segment whose pages sit
//! at addresses aligned to the logical page size. That alignment is what
//! buys O(1) deallocation: masking a freed pointer yields the page header,
//! and the header carries the size class. Anything larger goes to a single
//! [`AnyPage`] segment, found on deallocation by an ownership check that is
//! O(1) for bounded heaps.

use core::cell::UnsafeCell;

use crate::arena::ArenaOps;
use crate::heap::{Heap, TransferPagesFrom, MINIMUM_ALIGNMENT};
use crate::os;
use crate::page::FixedPage;
use crate::page_any::AnyPage;
use crate::queue::POINTER_PAGE_BYTES;
use crate::segment::{Concurrency, Segment, SegmentParams};

pub const SMALL_BIN_COUNT: usize = 8;
pub const SMALL_MIN_SIZE_CLASS: usize = 16;
pub const SMALL_MAX_SIZE_CLASS: usize = 2048;

#[derive(Clone)]
pub struct Pow2HeapParams {
    /// Logical page size of the small-object bins; must equal the arena's
    /// page alignment so pages land on aligned addresses.
    pub small_page_size: usize,
    /// Initial page count per small bin, index 0 = size class 16.
    pub bin_page_counts: [usize; SMALL_BIN_COUNT],
    pub small_page_recycling_threshold: usize,
    /// Logical page size of the big-object bin; a multiple of
    /// `small_page_size`, and at least 16 bytes larger than the biggest
    /// expected allocation (the inline block header).
    pub big_page_size: usize,
    pub big_page_recycling_threshold: usize,
    pub grow_coefficient: f64,
    /// Backing bytes for each bin's deallocation queue under the
    /// thread-local policy.
    pub deallocation_queue_capacity: usize,
}

impl Pow2HeapParams {
    pub const fn new() -> Self {
        Self {
            small_page_size: 65536,
            bin_page_counts: [1; SMALL_BIN_COUNT],
            small_page_recycling_threshold: 1,
            big_page_size: 196608,
            big_page_recycling_threshold: 1,
            grow_coefficient: 0.0,
            deallocation_queue_capacity: POINTER_PAGE_BYTES,
        }
    }
}

impl Default for Pow2HeapParams {
    fn default() -> Self {
        Self::new()
    }
}

// Small pages sit at aligned addresses, big pages do not.
type SmallBin<A, C, const DR: bool> = Segment<FixedPage, A, C, true, DR>;
type BigBin<A, C, const DR: bool> = Segment<AnyPage, A, C, false, DR>;

struct HeapInfo {
    small_page_size: usize,
    buffer_address: usize,
    buffer_length: usize,
}

pub struct Pow2Heap<A: ArenaOps, C: Concurrency, const DEFERRED_RECYCLING: bool = false> {
    bins: [SmallBin<A, C, DEFERRED_RECYCLING>; SMALL_BIN_COUNT],
    big_bin: BigBin<A, C, DEFERRED_RECYCLING>,
    info: UnsafeCell<HeapInfo>,
}

unsafe impl<A: ArenaOps, C: Concurrency, const DR: bool> Send for Pow2Heap<A, C, DR> {}
unsafe impl<A: ArenaOps, C: Concurrency, const DR: bool> Sync for Pow2Heap<A, C, DR> {}

#[inline]
fn small_bin_index(size_class: usize) -> usize {
    // 16 -> 0, 32 -> 1, ... 2048 -> 7
    (size_class.trailing_zeros() - 4) as usize
}

#[inline]
fn adjust_small_size(size: usize) -> usize {
    size.next_power_of_two().max(SMALL_MIN_SIZE_CLASS)
}

impl<A: ArenaOps, C: Concurrency, const DEFERRED: bool> Pow2Heap<A, C, DEFERRED> {
    fn info(&self) -> &HeapInfo {
        unsafe { &*self.info.get() }
    }

    fn required_buffer_size(params: &Pow2HeapParams) -> usize {
        let small: usize = params
            .bin_page_counts
            .iter()
            .map(|count| count * params.small_page_size)
            .sum();
        small + params.big_page_size
    }

    // Recovers the size class in O(1) from the aligned page header. Junk
    // headers (a pointer this heap never handed out) fail the power-of-two
    // range check and are reported as None.
    fn small_size_class_of(&self, ptr: *mut u8) -> Option<usize> {
        let size_class = SmallBin::<A, C, DEFERRED>::size_class_from_address(
            ptr,
            self.info().small_page_size,
        ) as usize;

        if (SMALL_MIN_SIZE_CLASS..=SMALL_MAX_SIZE_CLASS).contains(&size_class)
            && size_class.is_power_of_two()
        {
            Some(size_class)
        } else {
            None
        }
    }

    /// Deferred-recycling entry point: releases empty pages in every bin.
    pub fn recycle(&self) {
        for bin in &self.bins {
            bin.recycle_free_pages();
        }
        self.big_bin.recycle_free_pages();
    }

    pub fn small_bin_page_count(&self, bin_index: usize) -> usize {
        self.bins[bin_index].page_count()
    }

    pub fn big_bin_page_count(&self) -> usize {
        self.big_bin.page_count()
    }
}

impl<A: ArenaOps, C: Concurrency, const DEFERRED: bool> Heap<A> for Pow2Heap<A, C, DEFERRED> {
    type Params = Pow2HeapParams;

    fn new() -> Self {
        Self {
            bins: core::array::from_fn(|_| Segment::new()),
            big_bin: Segment::new(),
            info: UnsafeCell::new(HeapInfo {
                small_page_size: 0,
                buffer_address: 0,
                buffer_length: 0,
            }),
        }
    }

    fn create(&self, params: &Pow2HeapParams, arena: *const A) -> bool {
        if arena.is_null() {
            return false;
        }
        let arena_ref = unsafe { &*arena };

        if params.small_page_size == 0
            || !os::is_size_granularity_multiple(params.small_page_size)
            || !os::is_size_granularity_multiple(params.big_page_size)
            || !params.small_page_size.is_power_of_two()
            || arena_ref.page_alignment() != params.small_page_size
            || params.big_page_size == 0
            || params.big_page_size % params.small_page_size != 0
        {
            return false;
        }

        let buffer_length = Self::required_buffer_size(params);
        let buffer = arena_ref.allocate(buffer_length);
        if buffer.is_null() {
            return false;
        }

        let mut offset = 0;
        let mut size_class = SMALL_MIN_SIZE_CLASS;

        for (bin, &page_count) in self.bins.iter().zip(params.bin_page_counts.iter()) {
            let segment_params = SegmentParams {
                logical_page_size: params.small_page_size,
                logical_page_count: page_count,
                page_recycling_threshold: params.small_page_recycling_threshold,
                deallocation_queue_capacity: params.deallocation_queue_capacity,
                size_class: size_class as u32,
                grow_coefficient: params.grow_coefficient,
            };

            if !bin.create(unsafe { buffer.add(offset) }, arena, &segment_params) {
                return false;
            }

            offset += page_count * params.small_page_size;
            size_class <<= 1;
        }

        let big_params = SegmentParams {
            logical_page_size: params.big_page_size,
            logical_page_count: 1,
            page_recycling_threshold: params.big_page_recycling_threshold,
            deallocation_queue_capacity: params.deallocation_queue_capacity,
            size_class: 0,
            grow_coefficient: 0.0,
        };

        if !self
            .big_bin
            .create(unsafe { buffer.add(offset) }, arena, &big_params)
        {
            return false;
        }

        unsafe {
            let info = &mut *self.info.get();
            info.small_page_size = params.small_page_size;
            info.buffer_address = buffer as usize;
            info.buffer_length = buffer_length;
        }

        true
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        if size <= SMALL_MAX_SIZE_CLASS {
            let adjusted = adjust_small_size(size);
            self.bins[small_bin_index(adjusted)].allocate(adjusted)
        } else {
            self.big_bin.allocate(size)
        }
    }

    fn allocate_aligned(&self, size: usize, alignment: usize) -> *mut u8 {
        if alignment <= MINIMUM_ALIGNMENT {
            // Every chunk and any-size payload is at least 16-aligned.
            return self.allocate(size);
        }

        let padded_size = size + alignment;
        if padded_size <= SMALL_MAX_SIZE_CLASS {
            // Over-allocate from a small bin and shift; the fixed page
            // recovers the chunk origin when the shifted pointer comes back.
            let ptr = self.allocate(padded_size);
            if ptr.is_null() {
                return ptr;
            }
            let offset = alignment - (ptr as usize & (alignment - 1));
            return (ptr as usize + offset) as *mut u8;
        }

        // Too big for the shift trick: the any-size bin places the payload
        // natively and records the padding in the block header.
        self.big_bin.allocate_aligned(size, alignment)
    }

    fn deallocate(&self, ptr: *mut u8) {
        if self.big_bin.owns_pointer(ptr) {
            self.big_bin.deallocate(ptr);
            return;
        }

        if let Some(size_class) = self.small_size_class_of(ptr) {
            self.bins[small_bin_index(size_class)].deallocate(ptr);
        }
    }

    fn owns_pointer(&self, ptr: *mut u8) -> bool {
        // Bounded heaps occupy one contiguous arena range; unbounded heaps
        // are only ever asked as the final fallback.
        let info = self.info();
        let address = ptr as usize;
        address >= info.buffer_address && address < info.buffer_address + info.buffer_length
    }

    fn get_usable_size(&self, ptr: *mut u8) -> usize {
        if self.big_bin.owns_pointer(ptr) {
            return self.big_bin.get_usable_size(ptr);
        }
        self.small_size_class_of(ptr).unwrap_or(0)
    }
}

impl<A, C, C2, const DR: bool, const DR2: bool> TransferPagesFrom<Pow2Heap<A, C2, DR2>>
    for Pow2Heap<A, C, DR>
where
    A: ArenaOps,
    C: Concurrency,
    C2: Concurrency,
{
    fn transfer_pages_from(&self, from: &Pow2Heap<A, C2, DR2>) {
        for (bin, other) in self.bins.iter().zip(from.bins.iter()) {
            bin.transfer_pages_from(other);
        }
        self.big_bin.transfer_pages_from(&from.big_bin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::lock::NoLock;
    use crate::segment::{SingleThread, ThreadLocal};

    type TestArena = Arena<NoLock>;
    type TestHeap = Pow2Heap<TestArena, SingleThread>;

    const SMALL_PAGE: usize = 65536;

    fn arena() -> TestArena {
        let arena = TestArena::new();
        assert!(arena.create(64 * 1024 * 1024, SMALL_PAGE));
        arena
    }

    fn heap(arena: &TestArena) -> TestHeap {
        let heap = TestHeap::new();
        assert!(heap.create(&Pow2HeapParams::new(), arena));
        heap
    }

    #[test]
    fn bin_index_math() {
        assert_eq!(small_bin_index(16), 0);
        assert_eq!(small_bin_index(32), 1);
        assert_eq!(small_bin_index(2048), 7);
        assert_eq!(adjust_small_size(1), 16);
        assert_eq!(adjust_small_size(16), 16);
        assert_eq!(adjust_small_size(17), 32);
        assert_eq!(adjust_small_size(2048), 2048);
    }

    #[test]
    fn create_requires_matching_arena_alignment() {
        let arena = TestArena::new();
        assert!(arena.create(1 << 20, 4096 * 4));

        let heap = TestHeap::new();
        // Arena alignment (16 KiB) does not match the 64 KiB page size.
        let created = heap.create(&Pow2HeapParams::new(), &arena);
        #[cfg(unix)]
        assert!(!created);
        #[cfg(windows)]
        let _ = created;
    }

    #[test]
    fn create_rejects_mismatched_big_page_size() {
        let arena = arena();
        let heap = TestHeap::new();
        let mut params = Pow2HeapParams::new();
        params.big_page_size = SMALL_PAGE + SMALL_PAGE / 2;
        assert!(!heap.create(&params, &arena));
    }

    #[test]
    fn small_sizes_route_to_their_bins() {
        let arena = arena();
        let heap = heap(&arena);

        for (size, expected_class) in
            [(1usize, 16usize), (16, 16), (17, 32), (100, 128), (2048, 2048)]
        {
            let ptr = heap.allocate(size);
            assert!(!ptr.is_null(), "size {size}");
            assert_eq!(heap.get_usable_size(ptr), expected_class, "size {size}");
            heap.deallocate(ptr);
        }
    }

    #[test]
    fn big_sizes_route_to_the_big_bin() {
        let arena = arena();
        let heap = heap(&arena);

        let ptr = heap.allocate(5000);
        assert!(!ptr.is_null());
        assert!(heap.get_usable_size(ptr) >= 5000);
        // Nothing claims a big pointer but the big bin.
        assert!(heap.big_bin.owns_pointer(ptr));
        heap.deallocate(ptr);
    }

    #[test]
    fn allocate_deallocate_round_trip_restores_state() {
        let arena = arena();
        let heap = heap(&arena);

        let before = heap.small_bin_page_count(small_bin_index(64));
        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(heap.allocate(64));
        }
        for ptr in held {
            heap.deallocate(ptr);
        }
        assert_eq!(heap.small_bin_page_count(small_bin_index(64)), before);

        // And the chunks are genuinely reusable.
        let ptr = heap.allocate(64);
        assert!(!ptr.is_null());
        heap.deallocate(ptr);
    }

    #[test]
    fn aligned_allocations_for_every_power_up_to_8192() {
        let arena = arena();
        let heap = heap(&arena);

        let mut alignment = 2usize;
        while alignment <= 8192 {
            let ptr = heap.allocate_aligned(100, alignment);
            assert!(!ptr.is_null(), "alignment {alignment}");
            assert_eq!(ptr as usize % alignment, 0, "alignment {alignment}");
            unsafe { core::ptr::write_bytes(ptr, 0xA5, 100) };
            heap.deallocate(ptr);
            alignment <<= 1;
        }
    }

    #[test]
    fn aligned_big_allocation_round_trips_through_the_big_bin() {
        let arena = arena();
        let heap = heap(&arena);

        let pages_before = heap.big_bin_page_count();

        let ptr = heap.allocate_aligned(500, 4096);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 4096, 0);
        assert!(heap.big_bin.owns_pointer(ptr));
        assert!(heap.get_usable_size(ptr) >= 500);

        heap.deallocate(ptr);
        assert_eq!(heap.big_bin_page_count(), pages_before);

        // The serving segment is back to its original state: a fresh
        // allocation lands on the same spot.
        let again = heap.allocate_aligned(500, 4096);
        assert_eq!(again, ptr);
        heap.deallocate(again);
    }

    #[test]
    fn aligned_small_allocation_is_recovered_by_the_bin() {
        let arena = arena();
        let heap = heap(&arena);

        // 50 + 64 = 114 -> the 128 bin serves it, shifted.
        let ptr = heap.allocate_aligned(50, 64);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);
        assert_eq!(heap.get_usable_size(ptr), 128);

        heap.deallocate(ptr);

        // The page must be fully allocatable again: no chunk was lost to
        // the shifted free, so one page's worth of chunks fits without
        // growing the bin.
        let bin = small_bin_index(128);
        let before = heap.small_bin_page_count(bin);
        let chunks_per_page = (SMALL_PAGE - 64) / 128;
        let mut drained = Vec::new();
        for _ in 0..chunks_per_page * before {
            let chunk = heap.bins[bin].allocate(128);
            assert!(!chunk.is_null());
            drained.push(chunk);
        }
        assert_eq!(heap.small_bin_page_count(bin), before);
        for chunk in drained {
            heap.bins[bin].deallocate(chunk);
        }
    }

    #[test]
    fn foreign_pointer_deallocation_is_ignored() {
        let arena = arena();
        let heap = heap(&arena);

        // A mapped, page-aligned buffer the heap never handed out: the
        // masked header read sees zeroed bytes, which fail the size-class
        // sanity check, and the free becomes a no-op.
        let foreign = crate::arena::MetadataAllocator::allocate(SMALL_PAGE);
        assert!(!foreign.is_null());
        unsafe { core::ptr::write_bytes(foreign, 0, SMALL_PAGE) };

        let ptr = unsafe { foreign.add(256) };
        heap.deallocate(ptr);
        assert_eq!(heap.get_usable_size(ptr), 0);

        crate::arena::MetadataAllocator::deallocate(foreign, SMALL_PAGE);
    }

    #[test]
    fn transfer_adopts_all_bins() {
        let arena = arena();
        let central = heap(&arena);

        let local: Pow2Heap<TestArena, ThreadLocal> = Pow2Heap::new();
        assert!(local.create(&Pow2HeapParams::new(), &arena));

        // Touch one small bin and the big bin so their pages carry state.
        let small = local.allocate(64);
        let big = local.allocate(4096);
        assert!(!small.is_null() && !big.is_null());

        let central_small_before = central.small_bin_page_count(small_bin_index(64));
        let central_big_before = central.big_bin_page_count();

        central.transfer_pages_from(&local);

        assert_eq!(
            central.small_bin_page_count(small_bin_index(64)),
            central_small_before + 1
        );
        assert_eq!(central.big_bin_page_count(), central_big_before + 1);
        assert_eq!(local.small_bin_page_count(small_bin_index(64)), 0);
        assert_eq!(local.big_bin_page_count(), 0);

        // The donated pointers are now the central heap's to free.
        central.deallocate(small);
        central.deallocate(big);
    }

    #[test]
    fn bounded_heap_ownership_is_a_range_check() {
        let arena = arena();

        let local: Pow2Heap<TestArena, ThreadLocal> = Pow2Heap::new();
        assert!(local.create(&Pow2HeapParams::new(), &arena));

        let inside = local.allocate(32);
        assert!(local.owns_pointer(inside));
        assert!(!local.owns_pointer(0x40 as *mut u8));
        local.deallocate(inside);
    }

    #[test]
    fn usable_size_covers_request_for_all_routes() {
        let arena = arena();
        let heap = heap(&arena);

        for size in [1usize, 15, 16, 100, 2048, 2049, 10000] {
            let ptr = heap.allocate(size);
            assert!(!ptr.is_null(), "size {size}");
            assert!(heap.get_usable_size(ptr) >= size, "size {size}");
            heap.deallocate(ptr);
        }
    }
}
