//! Mark-sweep collector: trace from the roots, return everything
//! unmarked to its allocator.

use std::time::Instant;

use crate::header::{Color, GcHeader, SweepHeader};
use crate::heap::SweepableHeap;
use crate::mark::{Marker, SkipFreed};
use crate::roots::Roots;
use crate::safepoint::{with_spilled_registers, zero_scratch_registers, ThreadRegistry};
use crate::utils::formatted_size;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcReason {
    RequestedByUser,
    AllocationFailure,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    /// Objects that survived the collection.
    pub visited: usize,
    /// Objects returned to their allocators.
    pub reclaimed: usize,
    /// Slot bytes those objects gave back.
    pub reclaimed_bytes: usize,
    /// Objects the mutator freed that were still reachable at sweep.
    pub free_reachable: usize,
}

pub struct MarkAndSweep<'h, H: SweepableHeap<Header = SweepHeader>> {
    marker: Marker<'h, H, SkipFreed>,
    threads: &'h dyn ThreadRegistry,
    pub verbose: bool,
    total_gcs: usize,
}

impl<'h, H: SweepableHeap<Header = SweepHeader>> MarkAndSweep<'h, H> {
    pub fn new(heap: &'h H, threads: &'h dyn ThreadRegistry) -> Self {
        Self {
            marker: Marker::new(heap),
            threads,
            verbose: false,
            total_gcs: 0,
        }
    }

    pub fn roots_mut(&mut self) -> &mut Roots {
        &mut self.marker.roots
    }

    /// The `gc_free` entry: flag the allocation for reclamation on the
    /// next cycle. A pointer no allocator owns is a fatal error.
    pub fn free(&self, ptr: usize) {
        match self.marker.heap().object_for_allocation(ptr) {
            Some(allocation) if !allocation.header.is_null() => unsafe {
                (*allocation.header).set_freed(true);
            },
            _ => panic!("invalid free of {:#x}: no owning allocator", ptr),
        }
    }

    pub fn collect(&mut self) -> SweepStats {
        self.collect_for(GcReason::RequestedByUser)
    }

    pub fn collect_for(&mut self, reason: GcReason) -> SweepStats {
        let time = self.verbose.then(Instant::now);

        let stats = with_spilled_registers(|| {
            let heap = self.marker.heap();
            let threads = self.threads;

            self.marker.begin_collection();
            self.marker.roots.clear_temporary();
            // Attached mutators park before the version goes odd, so only
            // threads outside the registry ever spin on it.
            threads.stop_all_other_threads();
            heap.start_gc();
            threads
                .for_each_suspended_thread(&mut |stack| self.marker.roots.add_thread_range(stack));
            self.marker
                .roots
                .add_thread_range(threads.current_stack_bounds());

            self.marker.mark_roots();
            self.marker.trace();
            let stats = self.free_unmarked();

            heap.end_gc();
            threads.resume_all_other_threads();
            stats
        });
        zero_scratch_registers();

        if let Some(time) = time {
            eprintln!(
                "[gc] GC({}) Pause Sweep ({:?}) visited {} reclaimed {}({}) free-but-reachable {} {:.4}ms",
                self.total_gcs,
                reason,
                stats.visited,
                stats.reclaimed,
                formatted_size(stats.reclaimed_bytes),
                stats.free_reachable,
                time.elapsed().as_micros() as f64 / 1000.0
            );
        }
        self.total_gcs += 1;
        stats
    }

    fn free_unmarked(&mut self) -> SweepStats {
        let heap = self.marker.heap();
        let mut reclaimed = 0;
        let mut reclaimed_bytes = 0;
        let mut free_reachable = 0;
        heap.for_each_allocation(&mut |allocation| {
            if allocation.header.is_null() {
                return;
            }
            unsafe {
                let header = &mut *allocation.header;
                // Marked-but-not-visited only happens for freed objects,
                // which the trace filter refuses to scan.
                debug_assert!(header.color() != Color::Marked || header.freed());
                if header.freed() {
                    allocation.bounds.zero();
                    if header.color() != Color::Unmarked {
                        free_reachable += 1;
                    }
                }
                if header.color() == Color::Unmarked {
                    heap.free_allocation(&allocation);
                    reclaimed += 1;
                    reclaimed_bytes += allocation.bounds.len;
                } else {
                    header.reset();
                }
            }
        });
        SweepStats {
            visited: self.marker.visited,
            reclaimed,
            reclaimed_bytes,
            free_reachable,
        }
    }
}
