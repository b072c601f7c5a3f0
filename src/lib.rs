//! Conservative stop-the-world garbage collection over a chunked slab
//! heap.
//!
//! Two heap backends and two collectors share one tracing engine:
//!
//! - [`slab::SlabHeap`] buckets allocations into per-size chunk pools
//!   and pairs with [`sweep::MarkAndSweep`].
//! - [`bump_heap::BumpHeap`] is a relocatable bump region and pairs
//!   with [`compact::MarkAndCompact`].
//!
//! Pointers are found conservatively: any aligned word that falls
//! inside memory the heap handed out is treated as a reference. The
//! process-wide [`gc_malloc`] / [`gc_collect`] / [`gc_free`] entry
//! points run mark-sweep over a shared slab heap.

pub mod bitset;
pub mod bucket;
pub mod bump_heap;
pub mod chunk_index;
pub mod compact;
pub mod globals;
pub mod header;
pub mod heap;
pub mod mark;
pub mod mmap;
pub mod roots;
pub mod safepoint;
pub mod slab;
pub mod sweep;
pub mod utils;

#[cfg(test)]
mod tests;

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::header::SweepHeader;
use crate::heap::GcHeap;
use crate::roots::Segment;
use crate::safepoint::GlobalSafepoint;
use crate::slab::SlabHeap;
use crate::sweep::{GcReason, MarkAndSweep};

struct GlobalGc {
    heap: &'static SlabHeap<SweepHeader>,
    safepoint: &'static GlobalSafepoint,
    collector: Mutex<MarkAndSweep<'static, SlabHeap<SweepHeader>>>,
}

/// 0 = untouched, 1 = one thread is initializing, 2 = ready. Late
/// arrivals spin until the flag reaches 2.
static INIT_FLAG: AtomicU32 = AtomicU32::new(0);
static GLOBAL: AtomicPtr<GlobalGc> = AtomicPtr::new(null_mut());

fn global() -> &'static GlobalGc {
    if INIT_FLAG.load(Ordering::Acquire) == 2 {
        return unsafe { &*GLOBAL.load(Ordering::Relaxed) };
    }
    if INIT_FLAG
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let heap: &'static SlabHeap<SweepHeader> = &*Box::leak(Box::new(SlabHeap::new()));
        let safepoint: &'static GlobalSafepoint = &*Box::leak(Box::new(GlobalSafepoint::new()));
        let collector = Mutex::new(MarkAndSweep::new(heap, safepoint));
        GLOBAL.store(
            Box::into_raw(Box::new(GlobalGc {
                heap,
                safepoint,
                collector,
            })),
            Ordering::Release,
        );
        INIT_FLAG.store(2, Ordering::Release);
    } else {
        while INIT_FLAG.load(Ordering::Acquire) != 2 {
            std::hint::spin_loop();
        }
    }
    unsafe { &*GLOBAL.load(Ordering::Relaxed) }
}

thread_local! {
    // Dropping the guard detaches the thread, so an exiting mutator can
    // never leave the stop-the-world handshake waiting on it.
    static MUTATOR_GUARD: MutatorGuard = const { MutatorGuard };
}

struct MutatorGuard;

impl Drop for MutatorGuard {
    fn drop(&mut self) {
        if INIT_FLAG.load(Ordering::Acquire) == 2 {
            unsafe { &*GLOBAL.load(Ordering::Relaxed) }
                .safepoint
                .detach_current_thread();
        }
    }
}

fn mutator_checkin(gc: &GlobalGc) {
    gc.safepoint.attach_current_thread();
    MUTATOR_GUARD.with(|_| {});
    gc.safepoint.poll();
}

/// Allocate at least `size` bytes of collected memory; the allocation's
/// bounds are exactly `size`. A failed allocation forces one synchronous
/// collection before giving up. Size zero allocates nothing.
pub fn gc_malloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    let gc = global();
    mutator_checkin(gc);
    if let Some(bounds) = gc.heap.alloc(size) {
        return NonNull::new(bounds.as_ptr());
    }
    match gc.collector.try_lock() {
        Some(mut collector) => {
            collector.collect_for(GcReason::AllocationFailure);
        }
        // Someone else is already collecting; wait for them instead.
        None => gc.safepoint.poll(),
    }
    gc.heap.alloc(size).and_then(|b| NonNull::new(b.as_ptr()))
}

/// Synchronously run a collection.
pub fn gc_collect() {
    let gc = global();
    mutator_checkin(gc);
    match gc.collector.try_lock() {
        Some(mut collector) => {
            collector.collect();
        }
        None => gc.safepoint.poll(),
    }
}

/// Request asynchronous release: the header is flagged and the
/// collector reclaims the allocation on the next cycle, reporting it if
/// it was still reachable at that point. Passing a pointer no allocator
/// owns is fatal.
pub fn gc_free(ptr: *mut u8) {
    let gc = global();
    match gc.heap.object_for_allocation(ptr as usize) {
        Some(allocation) if !allocation.header.is_null() => unsafe {
            (*allocation.header).set_freed(true);
        },
        _ => panic!("invalid free of {:p}: no owning allocator", ptr),
    }
}

/// Feed one loaded image segment to the root set. The loader-side
/// enumerator is an external collaborator; call this once per segment
/// it reports.
pub fn gc_register_segment(base: *const u8, len: usize, writable: bool) {
    let gc = global();
    let heap = gc.heap;
    // Never block on the collector mutex from an attached thread: a
    // running collection would wait for this thread to park while it
    // waits for the collection to finish.
    loop {
        if let Some(mut collector) = gc.collector.try_lock() {
            collector.roots_mut().register_segment(
                Segment {
                    base: base as usize,
                    len,
                    writable,
                },
                &|word| heap.is_pointer_like(word),
            );
            return;
        }
        gc.safepoint.poll();
        std::hint::spin_loop();
    }
}
