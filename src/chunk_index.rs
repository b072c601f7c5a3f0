//! Address to allocator mapping.
//!
//! One flat array covering the whole usable address space at chunk
//! granularity, indexed by the high bits of an address. The array is a
//! large anonymous mapping; the OS backs only the touched pages, so the
//! map from region to allocator stays small in practice. This design is
//! inspired by SuperMalloc.

use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use memmap2::MmapMut;

use crate::globals::{ADDRESS_SPACE_BITS, CHUNK_BITS};
use crate::slab::AllocatorHead;

const CELLS: usize = 1 << (ADDRESS_SPACE_BITS - CHUNK_BITS);

pub struct ChunkIndex {
    map: MmapMut,
}

unsafe impl Send for ChunkIndex {}
unsafe impl Sync for ChunkIndex {}

impl ChunkIndex {
    pub fn new() -> Self {
        // Avoid initializing the cells by hand: the zero pages the kernel
        // lends us are exactly the all-null table we want.
        let map = MmapMut::map_anon(CELLS * size_of::<*mut AllocatorHead>())
            .expect("failed to reserve the chunk index");
        Self { map }
    }

    /// The index of a virtual address. Chunks are strongly aligned, so
    /// the top bits beyond the mapped address space and the low bits that
    /// only give an offset within a chunk are both discarded.
    #[inline]
    pub fn index_for(addr: usize) -> usize {
        let trimmed = (addr << (usize::BITS as usize - ADDRESS_SPACE_BITS))
            >> (usize::BITS as usize - ADDRESS_SPACE_BITS);
        trimmed >> CHUNK_BITS
    }

    #[inline]
    fn cell(&self, addr: usize) -> &AtomicPtr<AllocatorHead> {
        unsafe {
            &*(self.map.as_ptr() as *const AtomicPtr<AllocatorHead>).add(Self::index_for(addr))
        }
    }

    /// The allocator owning `addr`'s chunk, or null.
    #[inline]
    pub fn allocator_for(&self, addr: usize) -> *mut AllocatorHead {
        self.cell(addr).load(Ordering::Relaxed)
    }

    /// Claim the cell for `addr`. At most one owner may hold any cell;
    /// the claim is a compare-and-swap against null, so huge allocations
    /// can safely write a run of cells without a per-cell lock.
    #[inline]
    pub fn claim(&self, addr: usize, allocator: *mut AllocatorHead) {
        let won = self
            .cell(addr)
            .compare_exchange(null_mut(), allocator, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        debug_assert!(won, "chunk index cell for {:#x} already owned", addr);
    }

    /// Release the cell for `addr` back to unowned.
    #[inline]
    pub fn clear(&self, addr: usize) {
        self.cell(addr).store(null_mut(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::CHUNK_SIZE;

    #[test]
    fn index_ignores_high_and_low_bits() {
        let base = 0x7f12_3450_0000usize & !(CHUNK_SIZE - 1);
        assert_eq!(ChunkIndex::index_for(base), ChunkIndex::index_for(base + 1));
        assert_eq!(
            ChunkIndex::index_for(base),
            ChunkIndex::index_for(base + CHUNK_SIZE - 1)
        );
        assert_ne!(
            ChunkIndex::index_for(base),
            ChunkIndex::index_for(base + CHUNK_SIZE)
        );
        // Bits above the mapped address space are trimmed.
        assert_eq!(
            ChunkIndex::index_for(base),
            ChunkIndex::index_for(base | (0xffffusize << ADDRESS_SPACE_BITS))
        );
    }

    #[test]
    fn claim_and_clear() {
        let index = ChunkIndex::new();
        let addr = 0x5500_0000_0000usize;
        let fake = 0x1000 as *mut AllocatorHead;
        assert!(index.allocator_for(addr).is_null());
        index.claim(addr, fake);
        assert_eq!(index.allocator_for(addr), fake);
        assert_eq!(index.allocator_for(addr + CHUNK_SIZE / 2), fake);
        assert!(index.allocator_for(addr + CHUNK_SIZE).is_null());
        index.clear(addr);
        assert!(index.allocator_for(addr).is_null());
    }
}
