//! Root discovery.
//!
//! A root is a snapshot of a pointer-shaped slot found outside the heap:
//! the slot's address and the value it held at freeze time. The mark
//! phase wants the snapshot; compaction later uses the slot address to
//! rewrite the slot in place.
//!
//! Three sources feed two pools. Read-only image segments cannot change,
//! so they are scanned once at registration and their roots retained
//! forever (the permanent pool). Writable image segments must be
//! re-scanned every collection, and stacks exist only for one collection;
//! both land in the temporary pool, which is rebuilt each freeze.

use crate::heap::Bounds;

/// A loaded image segment, as reported by the loader's enumerator.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub base: usize,
    pub len: usize,
    pub writable: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Root {
    pub slot: *mut usize,
    pub value: usize,
}

pub struct Roots {
    /// Writable image segments; the slots move over time, so these are
    /// re-scanned at every freeze.
    permanent_ranges: Vec<Bounds>,
    /// Stacks and other per-collection scratch.
    temporary_ranges: Vec<Bounds>,
    pub permanent_roots: Vec<Root>,
    pub temporary_roots: Vec<Root>,
}

fn add_range_to_roots(roots: &mut Vec<Root>, range: Bounds, pointer_like: &dyn Fn(usize) -> bool) {
    for addr in range.words() {
        let value = unsafe { (addr as *const usize).read_volatile() };
        if pointer_like(value) {
            roots.push(Root {
                slot: addr as *mut usize,
                value,
            });
        }
    }
}

impl Roots {
    pub fn new() -> Self {
        Self {
            permanent_ranges: Vec::new(),
            temporary_ranges: Vec::new(),
            permanent_roots: Vec::new(),
            temporary_roots: Vec::new(),
        }
    }

    /// Feed one loader segment in. Read-only segments are scanned right
    /// here; writable ones are kept as ranges for per-collection scans.
    pub fn register_segment(&mut self, segment: Segment, pointer_like: &dyn Fn(usize) -> bool) {
        let range = Bounds::new(segment.base, segment.len);
        if segment.writable {
            self.permanent_ranges.push(range);
        } else {
            add_range_to_roots(&mut self.permanent_roots, range, pointer_like);
        }
    }

    /// Register a thread's stack for this collection.
    pub fn add_thread_range(&mut self, range: Bounds) {
        self.temporary_ranges.push(range);
    }

    /// Reset per-collection state; run at freeze start.
    pub fn clear_temporary(&mut self) {
        self.temporary_roots.clear();
        self.temporary_ranges.clear();
    }

    /// Scan all ranges and snapshot every pointer-shaped slot.
    pub fn collect_from_ranges(&mut self, pointer_like: &dyn Fn(usize) -> bool) {
        for i in 0..self.temporary_ranges.len() {
            let range = self.temporary_ranges[i];
            add_range_to_roots(&mut self.temporary_roots, range, pointer_like);
        }
        for i in 0..self.permanent_ranges.len() {
            let range = self.permanent_ranges[i];
            add_range_to_roots(&mut self.temporary_roots, range, pointer_like);
        }
    }

    /// All roots: the temporary pool spliced with the permanent pool.
    pub fn iter(&self) -> impl Iterator<Item = Root> + '_ {
        self.temporary_roots
            .iter()
            .chain(self.permanent_roots.iter())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.temporary_roots.len() + self.permanent_roots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_segments_rescan_each_collection() {
        let mut slots = vec![0usize; 8];
        let accept = |w: usize| w == 0xdead0 || w == 0xbeef0;
        let segment = Segment {
            base: slots.as_ptr() as usize,
            len: slots.len() * core::mem::size_of::<usize>(),
            writable: true,
        };

        let mut roots = Roots::new();
        roots.register_segment(segment, &accept);
        roots.collect_from_ranges(&accept);
        assert_eq!(roots.len(), 0);

        slots[2] = 0xdead0;
        slots[5] = 0xbeef0;
        slots[6] = 0x1234; // not pointer-shaped
        roots.clear_temporary();
        roots.collect_from_ranges(&accept);
        let found: Vec<usize> = roots.iter().map(|r| r.value).collect();
        assert_eq!(found, vec![0xdead0, 0xbeef0]);

        // The snapshot records the slot so it can be rewritten later.
        let slot2 = roots.iter().next().unwrap().slot;
        assert_eq!(slot2 as usize, &slots[2] as *const usize as usize);
    }

    #[test]
    fn read_only_segments_scan_once() {
        let slots = vec![0usize, 0xdead0, 0];
        let accept = |w: usize| w == 0xdead0;
        let mut roots = Roots::new();
        roots.register_segment(
            Segment {
                base: slots.as_ptr() as usize,
                len: slots.len() * core::mem::size_of::<usize>(),
                writable: false,
            },
            &accept,
        );
        assert_eq!(roots.permanent_roots.len(), 1);
        roots.clear_temporary();
        roots.collect_from_ranges(&accept);
        // Not re-scanned, not duplicated.
        assert_eq!(roots.len(), 1);
    }
}
