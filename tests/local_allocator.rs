//! The bounded, single-threaded use case: heaps and segments composed
//! directly over an arena, no process-wide machinery involved.

use scalloc::heap::Heap;
use scalloc::page::PageOps;
use scalloc::{
    AnyPage, Arena, ArenaOps, NoLock, Pow2Heap, Pow2HeapParams, Segment, SegmentParams,
    SingleThread,
};

type LocalArena = Arena<NoLock>;

const PAGE: usize = if scalloc::os::PAGE_ALLOCATION_GRANULARITY > 65536 {
    scalloc::os::PAGE_ALLOCATION_GRANULARITY
} else {
    65536
};

fn arena(capacity: usize) -> LocalArena {
    let arena = LocalArena::new();
    assert!(arena.create(capacity, PAGE));
    arena
}

#[test]
fn single_threaded_heap_round_trip() {
    let arena = arena(32 * 1024 * 1024);
    let heap: Pow2Heap<LocalArena, SingleThread> = Pow2Heap::new();

    let mut params = Pow2HeapParams::new();
    params.small_page_size = PAGE;
    params.big_page_size = PAGE * 3;
    assert!(heap.create(&params, &arena));

    // A mixed workload with interleaved frees; everything must route home.
    let mut live = Vec::new();
    for round in 0..500usize {
        let size = match round % 5 {
            0 => 24,
            1 => 100,
            2 => 1500,
            3 => 4000,
            _ => 16,
        };
        let ptr = heap.allocate(size);
        assert!(!ptr.is_null(), "round {round}");
        assert!(heap.get_usable_size(ptr) >= size);
        unsafe { core::ptr::write_bytes(ptr, (round % 251) as u8, size) };
        live.push((ptr, size, (round % 251) as u8));

        if round % 3 == 0 {
            let (old, old_size, fill) = live.swap_remove(round % live.len());
            unsafe {
                assert_eq!(*old, fill);
                assert_eq!(*old.add(old_size - 1), fill);
            }
            heap.deallocate(old);
        }
    }

    for (ptr, _, _) in live {
        heap.deallocate(ptr);
    }
}

#[test]
fn any_size_segment_as_a_local_allocator() {
    // High-locality variant: one variable-size freelist, no size
    // segregation, bounded memory envelope.
    let arena = arena(PAGE * 16);
    let segment: Segment<AnyPage, LocalArena, SingleThread> = Segment::new();

    let buffer = arena.allocate(PAGE * 4);
    let params = SegmentParams {
        logical_page_size: PAGE * 4,
        logical_page_count: 1,
        page_recycling_threshold: 1,
        size_class: 0,
        ..SegmentParams::new()
    };
    assert!(segment.create(buffer, &arena, &params));

    let a = segment.allocate(1000);
    let b = segment.allocate(2000);
    let c = segment.allocate(3000);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    // Sequential allocations from one freelist sit close together.
    assert!((b as usize) > (a as usize));
    assert!((c as usize) > (b as usize));
    assert!((c as usize) - (a as usize) < PAGE);

    segment.deallocate(b);
    // First-fit reuses the hole.
    let d = segment.allocate(1500);
    assert_eq!(d, b);

    segment.deallocate(a);
    segment.deallocate(c);
    segment.deallocate(d);
}

#[test]
fn fixed_page_lifo_through_a_segment() {
    let arena = arena(PAGE * 8);
    let segment: Segment<scalloc::FixedPage, LocalArena, SingleThread> = Segment::new();

    let buffer = arena.allocate(PAGE);
    let params = SegmentParams {
        logical_page_size: PAGE,
        logical_page_count: 1,
        page_recycling_threshold: 1,
        size_class: 128,
        ..SegmentParams::new()
    };
    assert!(segment.create(buffer, &arena, &params));

    let chunk_count = (PAGE - 64) / 128;
    let mut held = Vec::new();
    for _ in 0..chunk_count {
        let ptr = segment.allocate(128);
        assert!(!ptr.is_null());
        held.push(ptr);
    }

    // Page exhausted; the next allocation grows by the minimum.
    let grown = segment.allocate(128);
    assert!(!grown.is_null());
    assert_eq!(segment.page_count(), 2);

    // Freeing the grown chunk lets immediate recycling release the page.
    segment.deallocate(grown);
    assert_eq!(segment.page_count(), 1);

    // Last-freed is first-allocated.
    let last = held.pop().unwrap();
    segment.deallocate(last);
    assert_eq!(segment.allocate(128), last);
}

#[test]
fn zeroing_arena_hands_out_cleared_pages() {
    let arena: Arena<NoLock, false, true> = Arena::new();
    assert!(arena.create(PAGE * 4, PAGE));

    let buffer = arena.allocate(PAGE);
    assert!(!buffer.is_null());
    for offset in (0..PAGE).step_by(511) {
        assert_eq!(unsafe { *buffer.add(offset) }, 0);
    }
    arena.release_to_system(buffer, PAGE);
}

#[test]
fn huge_page_arena_falls_back_to_regular_pages() {
    // With no huge pages configured the arena must still come up, served
    // by regular pages.
    let arena: Arena<NoLock, true> = Arena::new();
    assert!(arena.create(PAGE * 4, PAGE));

    let buffer = arena.allocate(PAGE);
    assert!(!buffer.is_null());
    unsafe {
        core::ptr::write_bytes(buffer, 0xEE, PAGE);
        assert_eq!(*buffer.add(PAGE - 1), 0xEE);
    }
    arena.release_to_system(buffer, PAGE);
}

#[test]
fn standalone_page_on_a_raw_buffer() {
    // Pages work without any segment when handed page-aligned memory.
    let buffer = scalloc::MetadataAllocator::allocate(PAGE);
    assert!(!buffer.is_null());

    let mut page: AnyPage = unsafe { core::mem::zeroed() };
    unsafe {
        assert!(page.init(buffer, PAGE, 0));

        let a = page.allocate(100);
        let b = page.allocate(200);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(page.free_bytes() + page.used_size() as usize, PAGE);

        page.deallocate(a);
        page.deallocate(b);
        assert_eq!(page.used_size(), 0);
        assert_eq!(page.free_node_count(), 1);
    }

    scalloc::MetadataAllocator::deallocate(buffer, PAGE);
}
