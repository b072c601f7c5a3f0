use std::fmt;

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

pub const fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Least common multiple; folios are sized to `lcm(page_size, object_size)`.
pub const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Acquire an uncontended spinlock. The per-allocator locks are strictly
/// try-lock oriented; a failing caller spins and retries.
#[inline]
pub fn spin_lock(lock: &Lock) {
    while !lock.try_lock() {
        std::hint::spin_loop();
    }
}

#[inline]
pub unsafe fn spin_unlock(lock: &Lock) {
    lock.unlock();
}

/// Byte count rendered with a binary-unit suffix, for the pause lines.
pub struct FormattedSize(usize);

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const UNITS: [&str; 3] = ["K", "M", "G"];
        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }
        let mut value = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{:.1}{}", value, UNITS[unit])
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize(size)
}
