//! Huge allocations: one descriptor and one fresh mapping per
//! allocation. Descriptors are placement-allocated out of a dedicated
//! folio-allocator pool and register themselves in every chunk-index
//! cell their mapping spans.

use std::cell::{Cell, UnsafeCell};

use crate::chunk_index::ChunkIndex;
use crate::globals::{CHUNK_SIZE, PAGE_SIZE};
use crate::header::GcHeader;
use crate::heap::{Allocation, Bounds};
use crate::mmap;
use crate::slab::{AllocatorHead, AllocatorKind};
use crate::utils::{align_down, align_up};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

#[repr(C)]
pub struct HugeAllocator<H> {
    pub head: AllocatorHead,
    /// The single mapping this allocator is responsible for.
    allocation: AtomicPtr<u8>,
    size: Cell<usize>,
    header: UnsafeCell<H>,
}

impl<H: GcHeader> HugeAllocator<H> {
    pub unsafe fn init(slot: *mut u8) -> *mut Self {
        let this = slot.cast::<Self>();
        this.write(Self {
            head: AllocatorHead::new(AllocatorKind::Huge, u32::MAX),
            allocation: AtomicPtr::new(null_mut()),
            size: Cell::new(0),
            header: UnsafeCell::new(H::default()),
        });
        this
    }

    pub fn header_ptr(&self) -> *mut H {
        self.header.get()
    }

    pub fn mapping(&self) -> *mut u8 {
        self.allocation.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    fn head_ptr(&self) -> *mut AllocatorHead {
        &self.head as *const _ as *mut AllocatorHead
    }

    /// Every chunk-index cell the mapping overlaps. Mappings are page
    /// aligned, not chunk aligned, so a mapping of `k` chunks worth of
    /// bytes can span up to `k + 1` cells.
    fn cells(base: usize, size: usize) -> impl Iterator<Item = usize> {
        let first = align_down(base, CHUNK_SIZE);
        let last = align_down(base + size - 1, CHUNK_SIZE);
        (first..=last).step_by(CHUNK_SIZE)
    }

    /// Map the allocation and claim its index cells. Fails only if the
    /// OS refuses the mapping.
    pub fn alloc(&self, index: &ChunkIndex, size: usize) -> Option<Bounds> {
        let rounded = align_up(size, PAGE_SIZE);
        let mem = mmap::map_anon(rounded);
        if mem.is_null() {
            return None;
        }
        self.size.set(rounded);
        if self
            .allocation
            .compare_exchange(null_mut(), mem, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Lost a claim race; this descriptor already owns a mapping.
            mmap::unmap(mem, rounded);
            return None;
        }
        for cell in Self::cells(mem as usize, rounded) {
            index.claim(cell, self.head_ptr());
        }
        Some(Bounds::new(mem as usize, rounded))
    }

    /// Release the mapping and its cells. Only the collector calls this,
    /// after proving the allocation unreachable. Returns false if the
    /// mapping was already gone.
    pub fn free(&self, index: &ChunkIndex) -> bool {
        let mem = self.allocation.load(Ordering::Acquire);
        if mem.is_null() {
            return false;
        }
        if self
            .allocation
            .compare_exchange(mem, null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let size = self.size.get();
        // Once the cells are cleared the allocator can no longer be found
        // from an address, so unmapping afterwards is safe under GC.
        for cell in Self::cells(mem as usize, size) {
            index.clear(cell);
        }
        mmap::unmap(mem, size);
        true
    }

    pub fn allocation_for(&self, addr: usize) -> Option<Allocation<H>> {
        let mem = self.allocation.load(Ordering::Acquire) as usize;
        if mem == 0 {
            return None;
        }
        let bounds = Bounds::new(mem, self.size.get());
        if !bounds.contains(addr) {
            return None;
        }
        Some(Allocation {
            bounds,
            header: self.header.get(),
        })
    }
}
