//! Bump-the-pointer heap with an overflow list for large objects. This
//! is the relocatable substrate the mark-compact collector runs on.
//!
//! Allocation starts are tracked in a FAT-style bitmap with one bit per
//! word, so mapping an interior pointer to its object is a short
//! backwards scan. Objects smaller than a page come from the bump
//! region and may slide during compaction; anything page-sized or more
//! gets its own mapping, an inline header in the overflow list, and
//! never moves.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;

use crate::bitset::AtomicBitSet;
use crate::globals::{PAGE_SIZE, WORD_SIZE};
use crate::header::{Color, GcHeader};
use crate::heap::{Allocation, Bounds, CompactableHeap, GcHeap, GcVersion};
use crate::mmap::{self, Mmap};
use crate::utils::{align_up, spin_lock, spin_unlock};

struct LargeAlloc<H> {
    header: H,
    base: usize,
    /// Mapping size, page rounded.
    size: usize,
}

pub struct BumpHeap<H: GcHeader> {
    map: Mmap,
    /// One bit per word; set at the first word of every allocation.
    start_bits: AtomicBitSet,
    /// Offset of the first unallocated byte. Allocation is a fetch-add.
    start: AtomicUsize,
    version: GcVersion,
    /// Held across an entire collection, so the list cannot grow while
    /// the collector walks it.
    large_lock: Lock,
    large: UnsafeCell<Vec<LargeAlloc<H>>>,
}

unsafe impl<H: GcHeader> Send for BumpHeap<H> {}
unsafe impl<H: GcHeader> Sync for BumpHeap<H> {}

/// Header bytes reserved in front of every bump-region payload.
const fn header_size<H>() -> usize {
    if core::mem::size_of::<H>() == 0 {
        0
    } else {
        align_up(core::mem::size_of::<H>(), WORD_SIZE)
    }
}

impl<H: GcHeader> BumpHeap<H> {
    pub fn new(size: usize) -> Self {
        let size = align_up(size, PAGE_SIZE);
        Self {
            map: Mmap::new(size),
            start_bits: AtomicBitSet::new(size / WORD_SIZE),
            start: AtomicUsize::new(0),
            version: GcVersion::new(),
            large_lock: Lock::INIT,
            large: UnsafeCell::new(Vec::new()),
        }
    }

    fn base(&self) -> usize {
        self.map.start() as usize
    }

    /// Bytes currently claimed in the bump region.
    pub fn allocated_bytes(&self) -> usize {
        self.start.load(Ordering::Relaxed).min(self.map.size())
    }

    fn contains_small(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.allocated_bytes()
    }

    /// Allocate `size` bytes. None means the bump region is exhausted
    /// (run a collection and retry) or the OS refused a large mapping.
    /// New memory always reads as zero, which doubles as an `Unmarked`
    /// header for the slot.
    pub fn alloc(&self, size: usize) -> Option<Bounds> {
        if size == 0 {
            return None;
        }
        if size >= PAGE_SIZE {
            return self.alloc_large(size);
        }
        let total = align_up(size, WORD_SIZE) + header_size::<H>();
        loop {
            // If a collection has started we are about to be stopped;
            // spin here until it finishes, then reserve.
            let version = self.version.wait_idle();
            let offset = self.start.fetch_add(total, Ordering::Relaxed);
            if offset + total > self.map.size() {
                return None;
            }
            self.start_bits.set(offset / WORD_SIZE);
            if self.version.load() != version {
                // A collection raced the reservation; the abandoned unit
                // reads as an unmarked object and is reclaimed next cycle.
                continue;
            }
            return Some(Bounds::new(
                self.base() + offset + header_size::<H>(),
                size,
            ));
        }
    }

    fn alloc_large(&self, size: usize) -> Option<Bounds> {
        let rounded = align_up(size, PAGE_SIZE);
        let mem = mmap::map_anon(rounded);
        if mem.is_null() {
            return None;
        }
        self.version.wait_idle();
        spin_lock(&self.large_lock);
        unsafe {
            (*self.large.get()).push(LargeAlloc {
                header: H::default(),
                base: mem as usize,
                size: rounded,
            });
            spin_unlock(&self.large_lock);
        }
        Some(Bounds::new(mem as usize, size))
    }

    fn small_allocation_at(&self, granule: usize, end_offset: usize) -> Allocation<H> {
        let unit = granule * WORD_SIZE;
        let next = self.start_bits.one_after(granule);
        let end = (next * WORD_SIZE).min(end_offset);
        let header = if header_size::<H>() == 0 {
            null_mut()
        } else {
            (self.base() + unit) as *mut H
        };
        Allocation {
            bounds: Bounds::new(
                self.base() + unit + header_size::<H>(),
                end - unit - header_size::<H>(),
            ),
            header,
        }
    }
}

impl<H: GcHeader> GcHeap for BumpHeap<H> {
    type Header = H;

    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        let end_offset = self.allocated_bytes();
        if addr >= self.base() && addr < self.base() + end_offset {
            let mut granule = (addr - self.base()) / WORD_SIZE;
            while granule > 0 && !self.start_bits.get(granule) {
                granule -= 1;
            }
            if !self.start_bits.get(granule) {
                return None;
            }
            return Some(self.small_allocation_at(granule, end_offset));
        }
        // The overflow list is only a handful of entries; scan it. The
        // collector holds the list lock for the whole collection, so the
        // walk cannot race a push while the world is stopped.
        unsafe {
            for large in (*self.large.get()).iter_mut() {
                if addr >= large.base && addr < large.base + large.size {
                    return Some(Allocation {
                        bounds: Bounds::new(large.base, large.size),
                        header: &mut large.header,
                    });
                }
            }
        }
        None
    }

    fn is_pointer_like(&self, word: usize) -> bool {
        if word == 0 || word % WORD_SIZE != 0 {
            return false;
        }
        if self.contains_small(word) {
            return true;
        }
        unsafe {
            (*self.large.get())
                .iter()
                .any(|l| word >= l.base && word < l.base + l.size)
        }
    }

    fn start_gc(&self) {
        self.version.start_gc();
        spin_lock(&self.large_lock);
    }

    fn end_gc(&self) {
        unsafe { spin_unlock(&self.large_lock) };
        self.version.end_gc();
    }

    /// Bump-region objects in address order, then the large list.
    fn for_each_allocation(&self, f: &mut dyn FnMut(Allocation<H>)) {
        let end_offset = self.allocated_bytes();
        if end_offset > 0 {
            debug_assert!(self.start_bits.get(0));
            let mut granule = 0;
            loop {
                let allocation = self.small_allocation_at(granule, end_offset);
                let end = allocation.bounds.end() - self.base();
                f(allocation);
                if end >= end_offset {
                    break;
                }
                granule = self.start_bits.one_after(granule);
            }
        }
        unsafe {
            for large in (*self.large.get()).iter_mut() {
                f(Allocation {
                    bounds: Bounds::new(large.base, large.size),
                    header: &mut large.header,
                });
            }
        }
    }
}

impl<H: GcHeader> CompactableHeap for BumpHeap<H> {
    fn movable(&self, obj: &Bounds) -> bool {
        self.contains_small(obj.base)
    }

    fn move_object(&self, obj: Bounds, displacement: isize) -> *mut u8 {
        debug_assert!(displacement < 0);
        debug_assert!(self.movable(&obj));
        let unit = obj.base - header_size::<H>();
        let new_unit = (unit as isize + displacement) as usize;
        debug_assert!(new_unit >= self.base());
        unsafe {
            // Header slot and payload travel together; ranges may overlap.
            std::ptr::copy(
                unit as *const u8,
                new_unit as *mut u8,
                header_size::<H>() + obj.len,
            );
        }
        self.start_bits.clear((unit - self.base()) / WORD_SIZE);
        self.start_bits.set((new_unit - self.base()) / WORD_SIZE);
        (new_unit + header_size::<H>()) as *mut u8
    }

    fn forget_object(&self, obj: Bounds) {
        let unit = obj.base - header_size::<H>();
        self.start_bits.clear((unit - self.base()) / WORD_SIZE);
    }

    fn set_heap_tail(&self, end: usize) {
        debug_assert!(end >= self.base() && end <= self.base() + self.map.size());
        let offset = end - self.base();
        let old = self.start.load(Ordering::Relaxed).min(self.map.size());
        if old > offset {
            // The vacated tail must read as zero for reuse.
            unsafe {
                std::ptr::write_bytes(end as *mut u8, 0, old - offset);
            }
        }
        self.start.store(offset, Ordering::Release);
    }

    fn sweep_large(&self) -> usize {
        unsafe {
            let large = &mut *self.large.get();
            let before = large.len();
            large.retain_mut(|l| {
                if l.header.color() == Color::Unmarked {
                    mmap::unmap(l.base as *mut u8, l.size);
                    false
                } else {
                    l.header.reset();
                    true
                }
            });
            before - large.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CompactHeader;

    #[test]
    fn interior_pointers_resolve() {
        let heap = BumpHeap::<CompactHeader>::new(64 * 1024);
        let a = heap.alloc(24).unwrap();
        let b = heap.alloc(40).unwrap();
        let found = heap.object_for_allocation(a.base + 8).unwrap();
        assert_eq!(found.bounds.base, a.base);
        let found = heap.object_for_allocation(b.base + 32).unwrap();
        assert_eq!(found.bounds.base, b.base);
        assert!(heap
            .object_for_allocation(heap.base() + heap.allocated_bytes() + 64)
            .is_none());
    }

    #[test]
    fn iteration_is_address_ordered() {
        let heap = BumpHeap::<CompactHeader>::new(64 * 1024);
        for i in 0..32 {
            heap.alloc(8 + i % 5 * 16).unwrap();
        }
        let mut last = 0;
        let mut count = 0;
        heap.for_each_allocation(&mut |a| {
            assert!(a.bounds.base > last);
            last = a.bounds.base;
            count += 1;
        });
        assert_eq!(count, 32);
    }

    #[test]
    fn large_allocations_live_off_heap() {
        let heap = BumpHeap::<CompactHeader>::new(64 * 1024);
        let small = heap.alloc(32).unwrap();
        let large = heap.alloc(2 * PAGE_SIZE).unwrap();
        assert!(!heap.movable(&large));
        assert!(heap.movable(&small));
        let found = heap.object_for_allocation(large.base + PAGE_SIZE).unwrap();
        assert_eq!(found.bounds.base, large.base);
        // Unmarked large entries are unmapped by the sweep.
        assert_eq!(heap.sweep_large(), 1);
        assert!(heap.object_for_allocation(large.base).is_none());
    }

    #[test]
    fn move_object_slides_header_and_payload() {
        let heap = BumpHeap::<CompactHeader>::new(64 * 1024);
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        unsafe {
            (b.base as *mut u64).write(0xfeed);
        }
        let hole = align_up(a.len, WORD_SIZE) + header_size::<CompactHeader>();
        let new = heap.move_object(b, -(hole as isize));
        assert_eq!(new as usize, a.base);
        unsafe {
            assert_eq!((new as *mut u64).read(), 0xfeed);
        }
    }
}
