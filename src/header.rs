use modular_bitfield::prelude::*;

// Per-object GC metadata. Headers live out of line from the object, in a
// side table of the owning allocator, so they are designed to be tightly
// packed:
//
// +-------------------+------+--------------------------------------+
// | name              | bits |                                      |
// +-------------------+------+--------------------------------------+
// | color             |    2 | unmarked / marked / visited          |
// | contains pointers |    1 |                                      |
// | freed             |    1 | sweep header only: gc_free requested |
// | displacement      |   60 | compact header only: slide distance  |
// +-------------------+------+--------------------------------------+
//
// The sweep header fits in one byte; the compact header in one word.

/// Mark-phase state of an object. The only valid sequence within one
/// collection is `Unmarked -> Marked -> Visited -> Unmarked`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
#[repr(u8)]
pub enum Color {
    /// Not seen by the collector yet.
    Unmarked = 0,
    /// Known live, not yet scanned.
    Marked,
    /// Scanned.
    Visited,
}

impl Specifier for Color {
    type Bytes = u8;
    const BITS: usize = 2;
    type InOut = Self;
    fn from_bytes(
        bytes: Self::Bytes,
    ) -> Result<Self::InOut, modular_bitfield::error::InvalidBitPattern<Self::Bytes>> {
        Ok(match bytes {
            0 => Self::Unmarked,
            1 => Self::Marked,
            2 => Self::Visited,
            _ => unreachable!(),
        })
    }
    fn into_bytes(input: Self::InOut) -> Result<Self::Bytes, modular_bitfield::error::OutOfBounds> {
        match input {
            Self::Unmarked => Ok(0),
            Self::Marked => Ok(1),
            Self::Visited => Ok(2),
        }
    }
}

/// Operations the tracing engine needs from any header type. `()` is the
/// "no header" instantiation: zero-sized, every operation inert.
pub trait GcHeader: Copy + Default + 'static {
    fn color(&self) -> Color;
    fn set_color(&mut self, color: Color);
    fn contains_pointers(&self) -> bool;
    fn set_contains_pointers(&mut self, yes: bool);
    /// Clear mark state between collections. Flags that outlive a
    /// collection (`freed`) are kept.
    fn reset(&mut self);
}

/// Header for the mark-sweep collector.
#[bitfield]
#[derive(Clone, Copy)]
pub struct SweepHeader {
    pub state: Color,
    pub pointers: bool,
    pub freed: bool,
    #[skip]
    __: B4,
}

const _: () = assert!(core::mem::size_of::<SweepHeader>() == 1);

impl Default for SweepHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeader for SweepHeader {
    #[inline(always)]
    fn color(&self) -> Color {
        self.state()
    }
    #[inline(always)]
    fn set_color(&mut self, color: Color) {
        self.set_state(color);
    }
    #[inline(always)]
    fn contains_pointers(&self) -> bool {
        self.pointers()
    }
    #[inline(always)]
    fn set_contains_pointers(&mut self, yes: bool) {
        self.set_pointers(yes);
    }
    #[inline(always)]
    fn reset(&mut self) {
        self.set_state(Color::Unmarked);
        self.set_pointers(false);
    }
}

/// Header for the mark-compact collector. The displacement is written
/// during the compact plan; it is zero or negative and measured in bytes,
/// so only its magnitude is stored.
#[bitfield]
#[derive(Clone, Copy)]
pub struct CompactHeader {
    pub state: Color,
    pub pointers: bool,
    #[skip]
    __: B1,
    slide: B60,
}

const _: () = assert!(core::mem::size_of::<CompactHeader>() == core::mem::size_of::<usize>());

impl Default for CompactHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactHeader {
    /// Byte distance this object is about to move; always <= 0.
    #[inline(always)]
    pub fn displacement(&self) -> isize {
        -(self.slide() as isize)
    }

    #[inline(always)]
    pub fn set_displacement(&mut self, displacement: isize) {
        debug_assert!(displacement <= 0);
        self.set_slide(displacement.unsigned_abs() as u64);
    }
}

impl GcHeader for CompactHeader {
    #[inline(always)]
    fn color(&self) -> Color {
        self.state()
    }
    #[inline(always)]
    fn set_color(&mut self, color: Color) {
        self.set_state(color);
    }
    #[inline(always)]
    fn contains_pointers(&self) -> bool {
        self.pointers()
    }
    #[inline(always)]
    fn set_contains_pointers(&mut self, yes: bool) {
        self.set_pointers(yes);
    }
    #[inline(always)]
    fn reset(&mut self) {
        self.set_state(Color::Unmarked);
        self.set_pointers(false);
        self.set_slide(0);
    }
}

impl GcHeader for () {
    #[inline(always)]
    fn color(&self) -> Color {
        Color::Unmarked
    }
    #[inline(always)]
    fn set_color(&mut self, _color: Color) {}
    #[inline(always)]
    fn contains_pointers(&self) -> bool {
        false
    }
    #[inline(always)]
    fn set_contains_pointers(&mut self, _yes: bool) {}
    #[inline(always)]
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_header_packs() {
        let mut h = SweepHeader::default();
        assert_eq!(h.color(), Color::Unmarked);
        h.set_color(Color::Marked);
        h.set_contains_pointers(true);
        h.set_freed(true);
        assert_eq!(h.color(), Color::Marked);
        assert!(h.contains_pointers());
        assert!(h.freed());
        h.reset();
        assert_eq!(h.color(), Color::Unmarked);
        assert!(!h.contains_pointers());
        // gc_free's request must survive a reset.
        assert!(h.freed());
    }

    #[test]
    fn compact_header_displacement() {
        let mut h = CompactHeader::default();
        assert_eq!(h.displacement(), 0);
        h.set_displacement(-4096);
        h.set_color(Color::Visited);
        assert_eq!(h.displacement(), -4096);
        assert_eq!(h.color(), Color::Visited);
        h.reset();
        assert_eq!(h.displacement(), 0);
        assert_eq!(h.color(), Color::Unmarked);
    }
}
