//! Fixed-size allocator for large buckets (32 KiB up to a quarter
//! chunk). Slots are page-aligned runs of pages, so there is no folio
//! structure: one bitmap covers the whole chunk and every freed slot is
//! handed straight back to the OS.

use std::cell::Cell;
use std::mem::{align_of, size_of};
use std::ptr::null_mut;

use parking_lot::RawMutex as Lock;
use parking_lot::lock_api::RawMutex as RawMutexApi;

use crate::bitset::BitSetView;
use crate::globals::CHUNK_SIZE;
use crate::header::GcHeader;
use crate::heap::{Allocation, Bounds};
use crate::mmap;
use crate::slab::{AllocatorHead, AllocatorKind};
use crate::utils::{align_up, spin_lock, spin_unlock};

#[repr(C)]
pub struct PagedAllocator<H> {
    pub head: AllocatorHead,
    object_size: u32,
    allocs_per_chunk: u32,
    first_slot: u32,
    lock: Lock,
    // Guarded by `lock`.
    free_allocs_total: Cell<u32>,
    /// Bits are set while a slot is live.
    allocated: *mut u64,
    headers: *mut H,
}

impl<H: GcHeader> PagedAllocator<H> {
    pub unsafe fn init(chunk: *mut u8, bucket: u32, object_size: usize) -> *mut AllocatorHead {
        let allocs_per_chunk = CHUNK_SIZE / object_size;

        let mut offset = size_of::<Self>();
        offset = align_up(offset, align_of::<u64>());
        let bitmap_offset = offset;
        offset += BitSetView::words_for_bits(allocs_per_chunk) * size_of::<u64>();
        offset = align_up(offset, align_of::<H>().max(1));
        let headers_offset = offset;
        offset += allocs_per_chunk * size_of::<H>();
        let metadata_end = offset;

        let meta_slots = (metadata_end + object_size - 1) / object_size;
        if meta_slots >= allocs_per_chunk {
            return null_mut();
        }

        let this = chunk.cast::<Self>();
        this.write(Self {
            head: AllocatorHead::new(AllocatorKind::Paged, bucket),
            object_size: object_size as u32,
            allocs_per_chunk: allocs_per_chunk as u32,
            first_slot: meta_slots as u32,
            lock: Lock::INIT,
            free_allocs_total: Cell::new((allocs_per_chunk - meta_slots) as u32),
            allocated: chunk.add(bitmap_offset).cast(),
            headers: chunk.add(headers_offset).cast(),
        });
        let bits = (*this).bits();
        for slot in 0..meta_slots {
            bits.set(slot);
        }

        &(*this).head as *const _ as *mut AllocatorHead
    }

    pub fn object_size(&self) -> usize {
        self.object_size as usize
    }

    fn chunk_base(&self) -> usize {
        self as *const Self as usize
    }

    fn bits(&self) -> BitSetView {
        unsafe { BitSetView::from_raw(self.allocated, self.allocs_per_chunk as usize) }
    }

    pub fn full(&self) -> bool {
        self.free_allocs_total.get() == 0
    }

    pub fn reserve_allocation(&self) -> Option<usize> {
        spin_lock(&self.lock);
        let result = if self.free_allocs_total.get() > 0 {
            let bits = self.bits();
            let slot = bits.first_zero();
            debug_assert!(slot < self.allocs_per_chunk as usize);
            bits.set(slot);
            self.free_allocs_total.set(self.free_allocs_total.get() - 1);
            if size_of::<H>() != 0 {
                unsafe {
                    *self.headers.add(slot) = H::default();
                }
            }
            Some(slot * self.object_size as usize)
        } else {
            None
        };
        unsafe { spin_unlock(&self.lock) };
        result
    }

    pub fn free_allocation(&self, offset: usize) -> bool {
        let object_size = self.object_size as usize;
        assert!(
            offset % object_size == 0 && offset < CHUNK_SIZE,
            "free of {:#x} is not a slot of this allocator",
            offset
        );
        let slot = offset / object_size;
        assert!(
            slot >= self.first_slot as usize,
            "free inside the metadata prefix"
        );

        spin_lock(&self.lock);
        let was_full = self.free_allocs_total.get() == 0;
        let bits = self.bits();
        debug_assert!(bits.get(slot), "double free of slot {}", slot);
        bits.clear(slot);
        self.free_allocs_total.set(self.free_allocs_total.get() + 1);
        if size_of::<H>() != 0 {
            unsafe {
                *self.headers.add(slot) = H::default();
            }
        }
        // Large slots are whole pages; return them immediately.
        mmap::discard((self.chunk_base() + offset) as *mut u8, object_size);
        unsafe { spin_unlock(&self.lock) };
        was_full
    }

    pub fn allocation_for(&self, addr: usize) -> Option<Allocation<H>> {
        let offset = addr - self.chunk_base();
        let slot = offset / self.object_size as usize;
        if slot >= self.allocs_per_chunk as usize {
            return None;
        }
        let header = if size_of::<H>() == 0 {
            null_mut()
        } else {
            unsafe { self.headers.add(slot) }
        };
        Some(Allocation {
            bounds: Bounds::new(
                self.chunk_base() + slot * self.object_size as usize,
                self.object_size as usize,
            ),
            header,
        })
    }

    pub fn collect_allocated(&self, cursor: &mut usize, out: &mut [Allocation<H>]) -> usize {
        let allocs_per_chunk = self.allocs_per_chunk as usize;
        let mut written = 0;
        let mut slot = (*cursor).max(self.first_slot as usize);

        spin_lock(&self.lock);
        let bits = self.bits();
        if slot < allocs_per_chunk && !bits.get(slot) {
            slot = bits.one_after(slot);
        }
        while slot < allocs_per_chunk && written < out.len() {
            out[written] = self
                .allocation_for(self.chunk_base() + slot * self.object_size as usize)
                .unwrap();
            written += 1;
            slot = bits.one_after(slot);
        }
        unsafe { spin_unlock(&self.lock) };
        *cursor = slot;
        written
    }
}
