//! The heap seam: anything composing segments into a size-class policy.
//!
//! The core deliberately does not bless a single canonical heap; the
//! scalable allocator only needs the operations below. One concrete
//! composition ships in [`crate::pow2`].

use crate::arena::ArenaOps;

/// Alignment every heap already provides without any padding games.
pub const MINIMUM_ALIGNMENT: usize = 16;

pub trait Heap<A: ArenaOps> {
    type Params: Clone + Default;

    /// A blank heap; usable only after [`Heap::create`].
    fn new() -> Self
    where
        Self: Sized;

    /// Wires the heap to `arena` and carves its initial pages. The arena
    /// must outlive the heap.
    fn create(&self, params: &Self::Params, arena: *const A) -> bool;

    fn allocate(&self, size: usize) -> *mut u8;

    /// `alignment` must be a power of two. Alignments up to
    /// [`MINIMUM_ALIGNMENT`] are free; beyond that the heap either
    /// over-allocates and shifts (fixed-class bins invert the shift on
    /// deallocation) or places natively in an any-size bin.
    fn allocate_aligned(&self, size: usize, alignment: usize) -> *mut u8;

    fn deallocate(&self, ptr: *mut u8);

    /// O(1) for bounded heaps, which occupy one contiguous buffer. The
    /// scalable allocator leans on this when probing thread-local heaps on
    /// every deallocation.
    fn owns_pointer(&self, ptr: *mut u8) -> bool;

    fn get_usable_size(&self, ptr: *mut u8) -> usize;
}

/// Splicing pages between two heaps of different concurrency policies: the
/// central heap adopts every logical page of a dying thread's heap.
pub trait TransferPagesFrom<Source> {
    fn transfer_pages_from(&self, from: &Source);
}
