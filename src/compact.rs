//! Mark-compact collector, based on the LISP2 design: after the shared
//! trace, compute sliding displacements in heap order, rewrite every
//! root slot and interior pointer, then move the survivors.

use std::time::Instant;

use crate::header::{Color, CompactHeader, GcHeader};
use crate::heap::CompactableHeap;
use crate::mark::{AlwaysMark, Marker};
use crate::roots::Roots;
use crate::safepoint::{with_spilled_registers, zero_scratch_registers, ThreadRegistry};
use crate::sweep::GcReason;
use crate::utils::formatted_size;

#[derive(Clone, Copy, Debug, Default)]
pub struct CompactStats {
    /// Objects that survived the collection.
    pub visited: usize,
    /// Surviving objects that changed address.
    pub moved: usize,
    /// Payload bytes those objects carried with them.
    pub moved_bytes: usize,
    /// Dead large allocations unmapped after the slide.
    pub large_reclaimed: usize,
}

pub struct MarkAndCompact<'h, H: CompactableHeap<Header = CompactHeader>> {
    marker: Marker<'h, H, AlwaysMark>,
    threads: &'h dyn ThreadRegistry,
    pub verbose: bool,
    total_gcs: usize,
}

impl<'h, H: CompactableHeap<Header = CompactHeader>> MarkAndCompact<'h, H> {
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

    pub fn collect(&mut self) -> CompactStats {
        self.collect_for(GcReason::RequestedByUser)
    }

    pub fn collect_for(&mut self, reason: GcReason) -> CompactStats {
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

            self.calculate_displacements();
            self.update_pointers();
            let (moved, moved_bytes) = self.move_objects();
            let large_reclaimed = heap.sweep_large();

            heap.end_gc();
            threads.resume_all_other_threads();
            CompactStats {
                visited: self.marker.visited,
                moved,
                moved_bytes,
                large_reclaimed,
            }
        });
        zero_scratch_registers();

        if let Some(time) = time {
            eprintln!(
                "[gc] GC({}) Pause Compact ({:?}) visited {} moved {}({}) large reclaimed {} {:.4}ms",
                self.total_gcs,
                reason,
                stats.visited,
                stats.moved,
                formatted_size(stats.moved_bytes),
                stats.large_reclaimed,
                time.elapsed().as_micros() as f64 / 1000.0
            );
        }
        self.total_gcs += 1;
        stats
    }

    /// Plan pass: walk the heap in address order tracking the byte just
    /// past the previous kept object; every survivor is assigned the
    /// (zero or negative) distance to close the gap. Dead objects are
    /// skipped, so their space is what the gap consists of.
    fn calculate_displacements(&mut self) {
        let heap = self.marker.heap();
        let mut last_end = 0usize;
        heap.for_each_allocation(&mut |allocation| {
            if !heap.movable(&allocation.bounds) {
                return;
            }
            let unit = allocation.header as usize;
            if last_end == 0 {
                last_end = unit;
            }
            unsafe {
                let header = &mut *allocation.header;
                if header.color() == Color::Unmarked {
                    return;
                }
                debug_assert_eq!(header.color(), Color::Visited);
                header.set_displacement(if unit > last_end {
                    last_end as isize - unit as isize
                } else {
                    0
                });
                last_end = allocation.bounds.end();
            }
        });
    }

    /// Rewrite pass: every root slot and every interior pointer of a
    /// live object is redirected by its target's displacement, keeping
    /// the offset into the target.
    fn update_pointers(&mut self) {
        let heap = self.marker.heap();
        for root in self.marker.roots.iter() {
            let Some(allocation) = heap.object_for_allocation(root.value) else {
                continue;
            };
            if allocation.header.is_null() {
                continue;
            }
            unsafe {
                let header = &*allocation.header;
                debug_assert_eq!(header.color(), Color::Visited);
                let displacement = header.displacement();
                if displacement != 0 {
                    root.slot
                        .write((root.value as isize + displacement) as usize);
                }
            }
        }

        let mut live = 0usize;
        let mut dead = 0usize;
        heap.for_each_allocation(&mut |allocation| {
            if allocation.header.is_null() {
                return;
            }
            unsafe {
                let header = &*allocation.header;
                if header.color() != Color::Visited {
                    dead += 1;
                    return;
                }
                live += 1;
                if !header.contains_pointers() {
                    return;
                }
                for slot in allocation.bounds.words() {
                    let word = (slot as *const usize).read();
                    if !heap.is_pointer_like(word) {
                        continue;
                    }
                    let Some(pointee) = heap.object_for_allocation(word) else {
                        continue;
                    };
                    if pointee.header.is_null() {
                        continue;
                    }
                    let displacement = (*pointee.header).displacement();
                    if displacement != 0 {
                        (slot as *mut usize).write((word as isize + displacement) as usize);
                    }
                }
            }
        });
        if self.verbose {
            eprintln!("[gc] {} live objects, {} dead", live, dead);
        }
        debug_assert_eq!(self.marker.visited, live);
    }

    /// Slide pass: move displaced survivors down, drop dead start bits,
    /// reset colors, and hand the vacated tail back to the heap.
    fn move_objects(&mut self) -> (usize, usize) {
        let heap = self.marker.heap();
        let mut moved = 0usize;
        let mut moved_bytes = 0usize;
        let mut first_unit = None;
        let mut last_live_end = None;
        heap.for_each_allocation(&mut |allocation| {
            if !heap.movable(&allocation.bounds) {
                return;
            }
            let unit = allocation.header as usize;
            if first_unit.is_none() {
                first_unit = Some(unit);
            }
            unsafe {
                let header = &mut *allocation.header;
                if header.color() != Color::Visited {
                    debug_assert_eq!(header.color(), Color::Unmarked);
                    heap.forget_object(allocation.bounds);
                    return;
                }
                let displacement = header.displacement();
                header.reset();
                if displacement != 0 {
                    let new_payload = heap.move_object(allocation.bounds, displacement) as usize;
                    last_live_end = Some(new_payload + allocation.bounds.len);
                    moved += 1;
                    moved_bytes += allocation.bounds.len;
                } else {
                    last_live_end = Some(allocation.bounds.end());
                }
            }
        });
        match (last_live_end, first_unit) {
            (Some(end), _) => heap.set_heap_tail(end),
            (None, Some(first)) => heap.set_heap_tail(first),
            (None, None) => {}
        }
        (moved, moved_bytes)
    }
}
