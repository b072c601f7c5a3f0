//! The slab allocator: per-size chunk-based pools with out-of-line
//! per-object metadata.
//!
//! Small and medium buckets use folio allocators, large buckets use the
//! paged variant, and anything above a quarter chunk gets a one-shot
//! huge allocator. Every chunk-resident allocator starts with a common
//! `AllocatorHead`, so the chunk index can hold thin pointers and
//! callers dispatch on the kind tag.

pub mod folio;
pub mod huge;
pub mod paged;

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::bucket::{bucket_for_size, bucket_size, SizeClass, FIXED_BUCKETS, MEDIUM_BUCKETS, SMALL_BUCKETS};
use crate::chunk_index::ChunkIndex;
use crate::globals::{CHUNK_SIZE, ITER_BATCH, WORD_SIZE};
use crate::header::GcHeader;
use crate::heap::{Allocation, Bounds, GcHeap, GcVersion, SweepableHeap};
use crate::mmap;
use crate::utils::is_aligned;

pub use self::folio::FolioAllocator;
pub use self::huge::HugeAllocator;
pub use self::paged::PagedAllocator;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum AllocatorKind {
    Folio = 0,
    Paged,
    Huge,
}

/// Common prefix of every allocator. `next` chains allocators of one
/// bucket that still have space; `all_next` is the append-only registry
/// that iteration walks, so allocators popped from the ready chain are
/// never lost to the collector.
#[repr(C)]
pub struct AllocatorHead {
    pub kind: AllocatorKind,
    pub bucket: u32,
    pub next: AtomicPtr<AllocatorHead>,
    pub all_next: AtomicPtr<AllocatorHead>,
    /// Whether the allocator currently sits on its bucket's ready chain.
    pub linked: AtomicBool,
}

impl AllocatorHead {
    pub fn new(kind: AllocatorKind, bucket: u32) -> Self {
        Self {
            kind,
            bucket,
            next: AtomicPtr::new(null_mut()),
            all_next: AtomicPtr::new(null_mut()),
            linked: AtomicBool::new(false),
        }
    }
}

unsafe fn allocator_full<H: GcHeader>(a: *mut AllocatorHead) -> bool {
    match (*a).kind {
        AllocatorKind::Folio => (*(a as *mut FolioAllocator<H>)).full(),
        AllocatorKind::Paged => (*(a as *mut PagedAllocator<H>)).full(),
        AllocatorKind::Huge => !(*(a as *mut HugeAllocator<H>)).mapping().is_null(),
    }
}

/// Reserve from a fixed-size allocator. The returned bounds are exactly
/// the request; the slot itself is the allocator's fixed size.
unsafe fn allocator_reserve<H: GcHeader>(a: *mut AllocatorHead, size: usize) -> Option<Bounds> {
    let base = a as usize;
    match (*a).kind {
        AllocatorKind::Folio => {
            let f = &*(a as *const FolioAllocator<H>);
            debug_assert!(size <= f.object_size());
            f.reserve_allocation()
                .map(|offset| Bounds::new(base + offset, size))
        }
        AllocatorKind::Paged => {
            let p = &*(a as *const PagedAllocator<H>);
            debug_assert!(size <= p.object_size());
            p.reserve_allocation()
                .map(|offset| Bounds::new(base + offset, size))
        }
        AllocatorKind::Huge => unreachable!("huge allocations do not go through buckets"),
    }
}

unsafe fn allocator_allocation_for<H: GcHeader>(
    a: *mut AllocatorHead,
    addr: usize,
) -> Option<Allocation<H>> {
    match (*a).kind {
        AllocatorKind::Folio => (*(a as *const FolioAllocator<H>)).allocation_for(addr),
        AllocatorKind::Paged => (*(a as *const PagedAllocator<H>)).allocation_for(addr),
        AllocatorKind::Huge => (*(a as *const HugeAllocator<H>)).allocation_for(addr),
    }
}

unsafe fn allocator_collect<H: GcHeader>(
    a: *mut AllocatorHead,
    cursor: &mut usize,
    out: &mut [Allocation<H>],
) -> usize {
    match (*a).kind {
        AllocatorKind::Folio => (*(a as *const FolioAllocator<H>)).collect_allocated(cursor, out),
        AllocatorKind::Paged => (*(a as *const PagedAllocator<H>)).collect_allocated(cursor, out),
        AllocatorKind::Huge => 0,
    }
}

/// Manager for allocators. Constructs new allocators on demand.
pub struct Buckets<H: GcHeader> {
    fixed: [AtomicPtr<AllocatorHead>; FIXED_BUCKETS],
    all: AtomicPtr<AllocatorHead>,
    /// Chain of folio allocators that hold huge-allocator descriptors.
    /// These pools are metadata, not heap: they are never registered in
    /// the chunk index.
    huge_pools: AtomicPtr<AllocatorHead>,
    _header: PhantomData<H>,
}

impl<H: GcHeader> Buckets<H> {
    pub fn new() -> Self {
        Self {
            fixed: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
            all: AtomicPtr::new(null_mut()),
            huge_pools: AtomicPtr::new(null_mut()),
            _header: PhantomData,
        }
    }

    pub fn all_head(&self) -> *mut AllocatorHead {
        self.all.load(Ordering::Acquire)
    }

    pub fn huge_pools_head(&self) -> *mut AllocatorHead {
        self.huge_pools.load(Ordering::Acquire)
    }

    /// An allocator for `bucket` with space available, creating one when
    /// none is ready. The returned allocator is not locked, so callers
    /// may still need to retry their reservation.
    fn allocator_for_bucket(
        &self,
        index: &ChunkIndex,
        bucket: usize,
    ) -> Option<*mut AllocatorHead> {
        loop {
            let mut a = self.fixed[bucket].load(Ordering::Acquire);
            if a.is_null() {
                a = self.create_fixed(index, bucket)?;
                self.push_ready(bucket, a);
            }
            unsafe {
                if !allocator_full::<H>(a) {
                    return Some(a);
                }
                // Unlink the full head; the retry walks onward. A racing
                // push can make the exchange fail, in which case the head
                // stays where it is and we simply try again.
                let next = (*a).next.swap(null_mut(), Ordering::AcqRel);
                if self
                    .fixed[bucket]
                    .compare_exchange(a, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    (*a).linked.store(false, Ordering::Release);
                }
            }
        }
    }

    fn create_fixed(&self, index: &ChunkIndex, bucket: usize) -> Option<*mut AllocatorHead> {
        let chunk = mmap::map_anon_aligned(CHUNK_SIZE, CHUNK_SIZE);
        if chunk.is_null() {
            return None;
        }
        let object_size = bucket_size(bucket);
        let head = unsafe {
            if bucket < SMALL_BUCKETS + MEDIUM_BUCKETS {
                FolioAllocator::<H>::init(chunk, bucket as u32, object_size)
            } else {
                PagedAllocator::<H>::init(chunk, bucket as u32, object_size)
            }
        };
        if head.is_null() {
            mmap::unmap(chunk, CHUNK_SIZE);
            return None;
        }
        index.claim(chunk as usize, head);
        let mut old = self.all.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*head).all_next.store(old, Ordering::Relaxed);
            }
            match self
                .all
                .compare_exchange_weak(old, head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        Some(head)
    }

    fn push_ready(&self, bucket: usize, a: *mut AllocatorHead) {
        unsafe {
            (*a).linked.store(true, Ordering::Relaxed);
        }
        let mut old = self.fixed[bucket].load(Ordering::Relaxed);
        loop {
            unsafe {
                (*a).next.store(old, Ordering::Relaxed);
            }
            match self.fixed[bucket].compare_exchange_weak(
                old,
                a,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// A free just moved this allocator out of the full state; if it was
    /// unlinked, put it back on its ready chain. The `linked` swap makes
    /// sure only one caller pushes.
    fn note_free_transition(&self, a: *mut AllocatorHead) {
        unsafe {
            let bucket = (*a).bucket;
            if bucket == u32::MAX {
                return;
            }
            if !(*a).linked.swap(true, Ordering::AcqRel) {
                self.push_ready(bucket as usize, a);
            }
        }
    }

    /// Carve out space for one huge-allocator descriptor.
    fn alloc_huge_descriptor(&self) -> Option<*mut u8> {
        let descriptor_size = size_of::<HugeAllocator<H>>();
        loop {
            let pool = self.huge_pools.load(Ordering::Acquire);
            if pool.is_null() {
                let created = self.create_pool(descriptor_size)?;
                if self
                    .huge_pools
                    .compare_exchange(null_mut(), created, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    mmap::unmap(created as *mut u8, CHUNK_SIZE);
                }
                continue;
            }
            let fa = unsafe { &*(pool as *mut FolioAllocator<()>) };
            if let Some(offset) = fa.reserve_allocation() {
                return Some((pool as usize + offset) as *mut u8);
            }
            // Head pool is full; chain a fresh one in front of it. If we
            // lose the race to install it, drop ours and retry.
            let created = self.create_pool(descriptor_size)?;
            unsafe {
                (*created).next.store(pool, Ordering::Relaxed);
            }
            if self
                .huge_pools
                .compare_exchange(pool, created, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                mmap::unmap(created as *mut u8, CHUNK_SIZE);
            }
        }
    }

    fn create_pool(&self, descriptor_size: usize) -> Option<*mut AllocatorHead> {
        let chunk = mmap::map_anon_aligned(CHUNK_SIZE, CHUNK_SIZE);
        if chunk.is_null() {
            return None;
        }
        let head = unsafe { FolioAllocator::<()>::init(chunk, u32::MAX, descriptor_size) };
        if head.is_null() {
            mmap::unmap(chunk, CHUNK_SIZE);
            return None;
        }
        unsafe {
            (*head).linked.store(true, Ordering::Relaxed);
        }
        Some(head)
    }

    /// Return a huge descriptor to the pool that owns it.
    fn free_huge_descriptor(&self, descriptor: *mut AllocatorHead) {
        let addr = descriptor as usize;
        let mut pool = self.huge_pools.load(Ordering::Acquire);
        while !pool.is_null() {
            let base = pool as usize;
            if addr >= base && addr < base + CHUNK_SIZE {
                unsafe {
                    (*(pool as *mut FolioAllocator<()>)).free_allocation(addr - base);
                }
                return;
            }
            pool = unsafe { (*pool).next.load(Ordering::Relaxed) };
        }
        debug_assert!(false, "huge descriptor from no known pool");
    }
}

/// Top level of the slab allocator: one address index, one bucket
/// manager, and the spliced iterator over every live allocation.
pub struct SlabHeap<H: GcHeader> {
    index: ChunkIndex,
    buckets: Buckets<H>,
    version: GcVersion,
}

unsafe impl<H: GcHeader> Send for SlabHeap<H> {}
unsafe impl<H: GcHeader> Sync for SlabHeap<H> {}

impl<H: GcHeader> SlabHeap<H> {
    pub fn new() -> Self {
        Self {
            index: ChunkIndex::new(),
            buckets: Buckets::new(),
            version: GcVersion::new(),
        }
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Allocate `size` bytes. The returned bounds are exactly `size`.
    /// None means out of memory (or a zero-sized request).
    pub fn alloc(&self, size: usize) -> Option<Bounds> {
        if size == 0 {
            return None;
        }
        self.version.wait_idle();
        match bucket_for_size(size)? {
            SizeClass::Huge => self.alloc_huge(size),
            SizeClass::Fixed(bucket) => loop {
                let a = self.buckets.allocator_for_bucket(&self.index, bucket)?;
                if let Some(bounds) = unsafe { allocator_reserve::<H>(a, size) } {
                    return Some(bounds);
                }
            },
        }
    }

    fn alloc_huge(&self, size: usize) -> Option<Bounds> {
        let slot = self.buckets.alloc_huge_descriptor()?;
        unsafe {
            let huge = HugeAllocator::<H>::init(slot);
            match (*huge).alloc(&self.index, size) {
                Some(bounds) => Some(Bounds::new(bounds.base, size)),
                None => {
                    self.buckets
                        .free_huge_descriptor(slot as *mut AllocatorHead);
                    None
                }
            }
        }
    }

    /// Return an allocation to its allocator. Only the collector calls
    /// this; the mutator-facing path is the header's freed flag.
    pub fn free(&self, ptr: usize) {
        let a = self.index.allocator_for(ptr);
        assert!(!a.is_null(), "free of {:#x}: no owning allocator", ptr);
        unsafe {
            match (*a).kind {
                AllocatorKind::Folio => {
                    let f = &*(a as *const FolioAllocator<H>);
                    if f.free_allocation(ptr - a as usize) {
                        self.buckets.note_free_transition(a);
                    }
                }
                AllocatorKind::Paged => {
                    let p = &*(a as *const PagedAllocator<H>);
                    if p.free_allocation(ptr - a as usize) {
                        self.buckets.note_free_transition(a);
                    }
                }
                AllocatorKind::Huge => {
                    let h = &*(a as *const HugeAllocator<H>);
                    if h.free(&self.index) {
                        self.buckets.free_huge_descriptor(a);
                    }
                }
            }
        }
    }

    pub fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        let a = self.index.allocator_for(addr);
        if a.is_null() {
            return None;
        }
        unsafe { allocator_allocation_for::<H>(a, addr) }
    }

    /// Forward iterator over every live allocation: fixed-size
    /// allocators first, then huge allocations.
    pub fn allocations(&self) -> Allocations<'_, H> {
        Allocations {
            heap: self,
            current: self.buckets.all_head(),
            huge_phase: false,
            cursor: 0,
            buf: [empty_allocation(); ITER_BATCH],
            buf_len: 0,
            buf_idx: 0,
        }
    }
}

const fn empty_allocation<H>() -> Allocation<H> {
    Allocation {
        bounds: Bounds::new(0, 0),
        header: null_mut(),
    }
}

pub struct Allocations<'a, H: GcHeader> {
    heap: &'a SlabHeap<H>,
    current: *mut AllocatorHead,
    huge_phase: bool,
    cursor: usize,
    buf: [Allocation<H>; ITER_BATCH],
    buf_len: usize,
    buf_idx: usize,
}

const EMPTY_ALLOCATION: Allocation<()> = empty_allocation::<()>();

impl<'a, H: GcHeader> Iterator for Allocations<'a, H> {
    type Item = Allocation<H>;

    fn next(&mut self) -> Option<Allocation<H>> {
        loop {
            if self.buf_idx < self.buf_len {
                let allocation = self.buf[self.buf_idx];
                self.buf_idx += 1;
                return Some(allocation);
            }
            self.buf_idx = 0;
            self.buf_len = 0;

            if !self.huge_phase {
                if self.current.is_null() {
                    self.huge_phase = true;
                    self.current = self.heap.buckets.huge_pools_head();
                    self.cursor = 0;
                    continue;
                }
                let n =
                    unsafe { allocator_collect::<H>(self.current, &mut self.cursor, &mut self.buf) };
                if n == 0 {
                    self.current = unsafe { (*self.current).all_next.load(Ordering::Acquire) };
                    self.cursor = 0;
                    continue;
                }
                self.buf_len = n;
            } else {
                if self.current.is_null() {
                    return None;
                }
                let pool = unsafe { &*(self.current as *mut FolioAllocator<()>) };
                let mut descriptors = [EMPTY_ALLOCATION; ITER_BATCH];
                let n = pool.collect_allocated(&mut self.cursor, &mut descriptors);
                if n == 0 {
                    self.current = unsafe { (*self.current).next.load(Ordering::Relaxed) };
                    self.cursor = 0;
                    continue;
                }
                for descriptor in &descriptors[..n] {
                    let huge =
                        unsafe { &*(descriptor.bounds.base as *const HugeAllocator<H>) };
                    let mapping = huge.mapping();
                    if !mapping.is_null() {
                        self.buf[self.buf_len] = Allocation {
                            bounds: Bounds::new(mapping as usize, huge.size()),
                            header: huge.header_ptr(),
                        };
                        self.buf_len += 1;
                    }
                }
            }
        }
    }
}

impl<H: GcHeader> GcHeap for SlabHeap<H> {
    type Header = H;

    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        SlabHeap::object_for_allocation(self, addr)
    }

    fn is_pointer_like(&self, word: usize) -> bool {
        word != 0
            && is_aligned(word, WORD_SIZE)
            && !self.index.allocator_for(word).is_null()
    }

    fn start_gc(&self) {
        self.version.start_gc();
    }

    fn end_gc(&self) {
        self.version.end_gc();
    }

    fn for_each_allocation(&self, f: &mut dyn FnMut(Allocation<H>)) {
        for allocation in self.allocations() {
            f(allocation);
        }
    }
}

impl<H: GcHeader> SweepableHeap for SlabHeap<H> {
    fn free_allocation(&self, allocation: &Allocation<H>) {
        self.free(allocation.bounds.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SweepHeader;

    #[test]
    fn alloc_resolves_back_to_slot() {
        let heap = SlabHeap::<SweepHeader>::new();
        let bounds = heap.alloc(100).unwrap();
        assert_eq!(bounds.len, 100);
        let found = heap.object_for_allocation(bounds.base + 40).unwrap();
        assert!(found.bounds.contains(bounds.base + 40));
        assert!(found.bounds.contains(bounds.base));
        // The slot is the bucket size, not the request.
        assert_eq!(found.bounds.len, 112);
        assert!(!found.header.is_null());
    }

    #[test]
    fn zero_sized_alloc_is_nothing() {
        let heap = SlabHeap::<SweepHeader>::new();
        assert!(heap.alloc(0).is_none());
    }

    #[test]
    fn free_recycles_slot() {
        let heap = SlabHeap::<SweepHeader>::new();
        let first = heap.alloc(64).unwrap();
        heap.free(first.base);
        let second = heap.alloc(64).unwrap();
        assert_eq!(first.base, second.base);
    }

    #[test]
    fn iteration_sees_every_allocation() {
        let heap = SlabHeap::<SweepHeader>::new();
        let mut expected = Vec::new();
        for i in 0..500 {
            expected.push(heap.alloc(16 + (i % 7) * 24).unwrap().base);
        }
        expected.push(heap.alloc(HUGE_PLUS).unwrap().base);
        let mut seen: Vec<usize> = heap.allocations().map(|a| a.bounds.base).collect();
        seen.sort_unstable();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn huge_allocation_registers_spanned_cells() {
        let heap = SlabHeap::<SweepHeader>::new();
        let bounds = heap.alloc(3 * CHUNK_SIZE).unwrap();
        assert_eq!(bounds.len, 3 * CHUNK_SIZE);
        // Interior addresses in every spanned chunk resolve to the owner.
        let mut addr = bounds.base;
        while addr < bounds.base + 3 * CHUNK_SIZE {
            assert!(heap.object_for_allocation(addr).is_some());
            addr += CHUNK_SIZE / 2;
        }
        heap.free(bounds.base);
        addr = bounds.base;
        while addr < bounds.base + 3 * CHUNK_SIZE {
            assert!(heap.object_for_allocation(addr).is_none());
            addr += CHUNK_SIZE / 2;
        }
        assert_eq!(heap.allocations().count(), 0);
    }

    #[test]
    fn quarter_chunk_routes_fixed_above_routes_huge() {
        let heap = SlabHeap::<SweepHeader>::new();
        let large = heap.alloc(CHUNK_SIZE / 4).unwrap();
        let slot = heap.object_for_allocation(large.base).unwrap();
        assert_eq!(slot.bounds.len, CHUNK_SIZE / 4);
        let huge = heap.alloc(CHUNK_SIZE / 4 + 1).unwrap();
        let slot = heap.object_for_allocation(huge.base).unwrap();
        // Huge mappings are rounded up to whole pages.
        assert_eq!(slot.bounds.len, CHUNK_SIZE / 4 + crate::globals::PAGE_SIZE);
    }

    const HUGE_PLUS: usize = CHUNK_SIZE / 2;
}
