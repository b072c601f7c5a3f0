//! Shared heap vocabulary: bounded ranges, allocation handles, and the
//! traits at the seam between the collectors and the heap backends.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::globals::WORD_SIZE;
use crate::header::GcHeader;

/// A bounded byte range. This is the conventional stand-in for the
/// capability pointers the design assumes: a pointer plus the length it
/// may address. Interior offsets are preserved by plain arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Bounds {
    pub base: usize,
    pub len: usize,
}

impl Bounds {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub fn from_ptr(ptr: *const u8, len: usize) -> Self {
        Self::new(ptr as usize, len)
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// Addresses of every pointer-aligned word that fits entirely inside
    /// the range.
    pub fn words(&self) -> impl Iterator<Item = usize> {
        let first = (self.base + WORD_SIZE - 1) & !(WORD_SIZE - 1);
        let end = self.end();
        (0..)
            .map(move |i| first + i * WORD_SIZE)
            .take_while(move |addr| addr + WORD_SIZE <= end)
    }

    pub unsafe fn zero(&self) {
        std::ptr::write_bytes(self.as_ptr(), 0, self.len);
    }
}

/// One allocation as the collectors see it: whole-slot bounds plus the
/// out-of-line header slot. The header pointer is null when the heap was
/// instantiated with the `()` header.
#[derive(Clone, Copy, Debug)]
pub struct Allocation<H> {
    pub bounds: Bounds,
    pub header: *mut H,
}

/// Collection gate. Even means no collector is running; odd means one
/// is. Mutator allocations that race a collection spin until the counter
/// returns to even and then retry.
pub struct GcVersion {
    counter: CachePadded<AtomicUsize>,
}

impl GcVersion {
    pub fn new() -> Self {
        Self {
            counter: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Spin until no collection is running, returning the observed even
    /// value so callers can detect a collection that started mid-way.
    #[inline]
    pub fn wait_idle(&self) -> usize {
        loop {
            let v = self.counter.load(Ordering::Acquire);
            if v % 2 == 0 {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    pub fn start_gc(&self) {
        let old = self.counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old % 2 == 0, "nested collection");
    }

    pub fn end_gc(&self) {
        let old = self.counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old % 2 == 1, "thaw without freeze");
    }
}

/// What every heap backend owes the collectors.
pub trait GcHeap {
    type Header: GcHeader;

    /// Map any interior address to the allocation containing it. The
    /// returned bounds are the whole slot's, not the caller's original
    /// request. None if no allocator owns the address.
    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<Self::Header>>;

    /// Conservative pointer test: the word is aligned and falls inside
    /// memory this heap handed out.
    fn is_pointer_like(&self, word: usize) -> bool;

    /// Freeze notification; bumps the version counter to odd.
    fn start_gc(&self);
    /// Thaw notification; bumps the version counter back to even.
    fn end_gc(&self);

    fn for_each_allocation(&self, f: &mut dyn FnMut(Allocation<Self::Header>));
}

/// Heap that can return individual allocations to their allocator.
pub trait SweepableHeap: GcHeap {
    fn free_allocation(&self, allocation: &Allocation<Self::Header>);
}

/// Heap whose objects can slide. `for_each_allocation` must yield
/// allocations in address order for these heaps.
pub trait CompactableHeap: GcHeap {
    /// Whether this allocation can slide. Large allocations have their
    /// own mappings and never move.
    fn movable(&self, obj: &Bounds) -> bool;

    /// Move the object's bytes and its header slot by `displacement`
    /// (zero or negative) and return the new payload address.
    fn move_object(&self, obj: Bounds, displacement: isize) -> *mut u8;

    /// Drop a dead allocation's start marker so stale starts cannot
    /// corrupt later interior-pointer lookups.
    fn forget_object(&self, obj: Bounds);

    /// All objects at or after `end` are gone; the vacated tail becomes
    /// reusable and reads as zero.
    fn set_heap_tail(&self, end: usize);

    /// Reclaim dead entries of the unmovable large-allocation list and
    /// reset survivors' mark state. Returns the number reclaimed.
    fn sweep_large(&self) -> usize;
}
