//! Fixed-size allocator for small and medium buckets.
//!
//! The chunk layout is a metadata prefix at the chunk base (this struct,
//! the folio table, the per-folio allocation bitmaps, the free-list
//! heads, and the header table) followed by data folios. Slot addresses
//! are chunk-relative, so construction reserves the slots physically
//! covered by the prefix by marking them allocated.

use std::cell::Cell;
use std::mem::{align_of, size_of};
use std::ptr::null_mut;

use parking_lot::RawMutex as Lock;
use parking_lot::lock_api::RawMutex as RawMutexApi;

use crate::bitset::BitSetView;
use crate::globals::{CHUNK_SIZE, PAGE_SIZE};
use crate::header::GcHeader;
use crate::heap::{Allocation, Bounds};
use crate::mmap;
use crate::slab::{AllocatorHead, AllocatorKind};
use crate::utils::{align_up, lcm, spin_lock, spin_unlock};

/// Folio list element. Folios with free space sit on one doubly-linked
/// list per possible free count, so allocation can always pick the
/// most-full folio and keep internal fragmentation down. Links are
/// indexes into the folio table, which keeps them at 16 bits.
#[repr(C)]
#[derive(Clone, Copy)]
struct Folio {
    prev: u16,
    next: u16,
    free_count: u16,
}

const NOT_PRESENT: u16 = 0xffff;

#[repr(C)]
pub struct FolioAllocator<H> {
    pub head: AllocatorHead,
    object_size: u32,
    folio_size: u32,
    allocs_per_folio: u32,
    folios_per_chunk: u32,
    words_per_folio: u32,
    /// First slot past the metadata prefix; iteration starts here.
    first_slot: u32,
    lock: Lock,
    // Guarded by `lock`.
    /// Conservative lower bound on the most-full non-empty free list:
    /// the answer is always at or above this index.
    free_head: Cell<u16>,
    free_allocs_total: Cell<u32>,
    folios: *mut Folio,
    /// Per-folio allocation bitmaps; bits are set while a slot is live.
    allocated: *mut u64,
    free_lists: *mut u16,
    headers: *mut H,
}

impl<H: GcHeader> FolioAllocator<H> {
    /// Lay the allocator out at the base of a fresh zeroed chunk.
    /// Returns null if the metadata cannot leave any usable slot, which
    /// only happens for nonsensical object sizes.
    pub unsafe fn init(chunk: *mut u8, bucket: u32, object_size: usize) -> *mut AllocatorHead {
        let folio_size = lcm(PAGE_SIZE, object_size);
        if folio_size > CHUNK_SIZE {
            return null_mut();
        }
        let allocs_per_folio = folio_size / object_size;
        let folios_per_chunk = CHUNK_SIZE / folio_size;
        let allocs_per_chunk = allocs_per_folio * folios_per_chunk;
        let words_per_folio = BitSetView::words_for_bits(allocs_per_folio);

        let mut offset = size_of::<Self>();
        offset = align_up(offset, align_of::<Folio>());
        let folios_offset = offset;
        offset += folios_per_chunk * size_of::<Folio>();
        offset = align_up(offset, align_of::<u64>());
        let bitmap_offset = offset;
        offset += folios_per_chunk * words_per_folio * size_of::<u64>();
        let lists_offset = offset;
        offset += (allocs_per_folio + 1) * size_of::<u16>();
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
            head: AllocatorHead::new(AllocatorKind::Folio, bucket),
            object_size: object_size as u32,
            folio_size: folio_size as u32,
            allocs_per_folio: allocs_per_folio as u32,
            folios_per_chunk: folios_per_chunk as u32,
            words_per_folio: words_per_folio as u32,
            first_slot: meta_slots as u32,
            lock: Lock::INIT,
            free_head: Cell::new(1),
            free_allocs_total: Cell::new((allocs_per_chunk - meta_slots) as u32),
            folios: chunk.add(folios_offset).cast(),
            allocated: chunk.add(bitmap_offset).cast(),
            free_lists: chunk.add(lists_offset).cast(),
            headers: chunk.add(headers_offset).cast(),
        });
        let this = &*this;

        for i in 0..=allocs_per_folio {
            *this.free_lists.add(i) = NOT_PRESENT;
        }
        for folio_idx in 0..folios_per_chunk {
            // Slots of this folio covered by the metadata prefix.
            let reserved = meta_slots
                .saturating_sub(folio_idx * allocs_per_folio)
                .min(allocs_per_folio);
            let bits = this.folio_bits(folio_idx);
            for slot in 0..reserved {
                bits.set(slot);
            }
            (*this.folios.add(folio_idx)).free_count = (allocs_per_folio - reserved) as u16;
            this.insert_list_entry(folio_idx as u16);
        }

        &(*chunk.cast::<Self>()).head as *const _ as *mut AllocatorHead
    }

    pub fn object_size(&self) -> usize {
        self.object_size as usize
    }

    fn chunk_base(&self) -> usize {
        self as *const Self as usize
    }

    fn folio_bits(&self, folio_idx: usize) -> BitSetView {
        unsafe {
            BitSetView::from_raw(
                self.allocated.add(folio_idx * self.words_per_folio as usize),
                self.allocs_per_folio as usize,
            )
        }
    }

    #[inline]
    fn folio(&self, idx: u16) -> *mut Folio {
        unsafe { self.folios.add(idx as usize) }
    }

    #[inline]
    fn list_head(&self, free_count: usize) -> u16 {
        unsafe { *self.free_lists.add(free_count) }
    }

    #[inline]
    fn set_list_head(&self, free_count: usize, folio_idx: u16) {
        unsafe {
            *self.free_lists.add(free_count) = folio_idx;
        }
    }

    /// Unlink a folio from the free list that currently holds it.
    fn remove_list_entry(&self, folio_idx: u16) {
        unsafe {
            let l = *self.folio(folio_idx);
            if l.prev == NOT_PRESENT {
                self.set_list_head(l.free_count as usize, l.next);
            } else {
                (*self.folio(l.prev)).next = l.next;
            }
            if l.next != NOT_PRESENT {
                (*self.folio(l.next)).prev = l.prev;
            }
        }
    }

    /// Push a folio onto the free list matching its free count.
    fn insert_list_entry(&self, folio_idx: u16) {
        unsafe {
            let l = self.folio(folio_idx);
            let head = self.list_head((*l).free_count as usize);
            (*l).prev = NOT_PRESENT;
            (*l).next = head;
            if head != NOT_PRESENT {
                (*self.folio(head)).prev = folio_idx;
            }
            self.set_list_head((*l).free_count as usize, folio_idx);
        }
    }

    pub fn full(&self) -> bool {
        self.free_allocs_total.get() == 0
    }

    /// Reserve one slot and return its chunk-relative byte offset, or
    /// None if the allocator is exhausted (possible even after a `full`
    /// check, since another thread may reserve in parallel).
    pub fn reserve_allocation(&self) -> Option<usize> {
        let allocs_per_folio = self.allocs_per_folio as usize;
        spin_lock(&self.lock);

        let mut list = (self.free_head.get() as usize).max(1);
        while list <= allocs_per_folio && self.list_head(list) == NOT_PRESENT {
            list += 1;
        }
        if list > allocs_per_folio {
            unsafe { spin_unlock(&self.lock) };
            return None;
        }

        let folio_idx = self.list_head(list);
        let offset = unsafe {
            let l = self.folio(folio_idx);
            debug_assert!((*l).free_count as usize == list);
            self.remove_list_entry(folio_idx);
            (*l).free_count -= 1;
            self.insert_list_entry(folio_idx);
            // The list one below just gained a member; anything below it
            // is still known empty.
            self.free_head.set((list - 1).max(1) as u16);

            let bits = self.folio_bits(folio_idx as usize);
            let slot = bits.first_zero();
            debug_assert!(slot < allocs_per_folio);
            bits.set(slot);
            self.free_allocs_total.set(self.free_allocs_total.get() - 1);

            let slot_index = folio_idx as usize * allocs_per_folio + slot;
            if size_of::<H>() != 0 {
                *self.headers.add(slot_index) = H::default();
            }
            folio_idx as usize * self.folio_size as usize + slot * self.object_size as usize
        };
        unsafe { spin_unlock(&self.lock) };
        Some(offset)
    }

    /// Mark the slot at `offset` free. Zeroes the slot's payload and
    /// header; a folio that becomes entirely unused has its pages handed
    /// back to the OS. Returns true when this free moved the allocator
    /// out of the full state.
    pub fn free_allocation(&self, offset: usize) -> bool {
        let object_size = self.object_size as usize;
        assert!(
            offset % object_size == 0 && offset < CHUNK_SIZE,
            "free of {:#x} is not a slot of this allocator",
            offset
        );
        let slot_index = offset / object_size;
        assert!(
            slot_index >= self.first_slot as usize,
            "free inside the metadata prefix"
        );
        let folio_idx = (offset / self.folio_size as usize) as u16;
        let in_folio = slot_index % self.allocs_per_folio as usize;

        spin_lock(&self.lock);
        let was_full = self.free_allocs_total.get() == 0;
        unsafe {
            let l = self.folio(folio_idx);
            let bits = self.folio_bits(folio_idx as usize);
            debug_assert!(bits.get(in_folio), "double free of slot {}", slot_index);
            self.remove_list_entry(folio_idx);
            (*l).free_count += 1;
            bits.clear(in_folio);
            self.insert_list_entry(folio_idx);
            self.free_allocs_total.set(self.free_allocs_total.get() + 1);

            let dest = (*l).free_count as usize;
            if dest < self.free_head.get() as usize {
                self.free_head.set(dest.max(1) as u16);
            }

            if size_of::<H>() != 0 {
                *self.headers.add(slot_index) = H::default();
            }
            let slot_ptr = (self.chunk_base() + offset) as *mut u8;
            std::ptr::write_bytes(slot_ptr, 0, object_size);

            if dest == self.allocs_per_folio as usize {
                let folio_base =
                    self.chunk_base() + folio_idx as usize * self.folio_size as usize;
                mmap::discard(folio_base as *mut u8, self.folio_size as usize);
            }
        }
        unsafe { spin_unlock(&self.lock) };
        was_full
    }

    /// The fixed-size allocation containing `addr`. The bounds are the
    /// slot's, not the original request's.
    pub fn allocation_for(&self, addr: usize) -> Option<Allocation<H>> {
        let offset = addr - self.chunk_base();
        let slot = offset / self.object_size as usize;
        let allocs_per_chunk =
            self.allocs_per_folio as usize * self.folios_per_chunk as usize;
        if slot >= allocs_per_chunk {
            // Chunk tail not covered by any folio.
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

    /// Batched iteration: materialize up to `out.len()` allocated slots
    /// starting at `*cursor`, advancing the cursor. One lock acquisition
    /// per refill.
    pub fn collect_allocated(&self, cursor: &mut usize, out: &mut [Allocation<H>]) -> usize {
        let allocs_per_folio = self.allocs_per_folio as usize;
        let allocs_per_chunk = allocs_per_folio * self.folios_per_chunk as usize;
        let mut written = 0;
        let mut slot = (*cursor).max(self.first_slot as usize);

        spin_lock(&self.lock);
        'scan: while slot < allocs_per_chunk {
            let folio_idx = slot / allocs_per_folio;
            let folio = unsafe { *self.folio(folio_idx as u16) };
            if folio.free_count as usize == allocs_per_folio {
                slot = (folio_idx + 1) * allocs_per_folio;
                continue;
            }
            let bits = self.folio_bits(folio_idx);
            let mut in_folio = slot % allocs_per_folio;
            if !bits.get(in_folio) {
                in_folio = bits.one_after(in_folio);
            }
            while in_folio < allocs_per_folio {
                if written == out.len() {
                    slot = folio_idx * allocs_per_folio + in_folio;
                    break 'scan;
                }
                let slot_index = folio_idx * allocs_per_folio + in_folio;
                out[written] = self
                    .allocation_for(self.chunk_base() + slot_index * self.object_size as usize)
                    .unwrap();
                written += 1;
                in_folio = bits.one_after(in_folio);
            }
            slot = (folio_idx + 1) * allocs_per_folio;
        }
        unsafe { spin_unlock(&self.lock) };
        *cursor = slot;
        written
    }
}
