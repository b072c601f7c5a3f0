//! Freeze / thaw: stopping every mutator so a collection can run.
//!
//! The thread-suspension primitive is an external collaborator behind
//! the `ThreadRegistry` trait. `GlobalSafepoint` is the in-crate
//! cooperative realization: mutator threads attach once, poll at
//! allocation sites, and park (recording their stack pointer) whenever
//! the collection counter is odd.

use std::cell::{Cell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;

use crate::heap::Bounds;
use crate::utils::{spin_lock, spin_unlock};

/// The thread-suspension collaborator. The collector is the only caller
/// and must resume on every exit path.
pub trait ThreadRegistry {
    fn stop_all_other_threads(&self);
    fn resume_all_other_threads(&self);
    /// Scannable stack range of the calling thread.
    fn current_stack_bounds(&self) -> Bounds;
    /// Scannable stack range of every suspended thread.
    fn for_each_suspended_thread(&self, f: &mut dyn FnMut(Bounds));
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    Active = 0,
    Parked = 1,
}

pub struct ThreadData {
    /// Top of the thread's stack (stacks grow down).
    stack_high: usize,
    /// Stack pointer recorded when the thread parked.
    last_sp: AtomicUsize,
    state: Atomic<ThreadState>,
}

thread_local! {
    static CURRENT_THREAD: Cell<*mut ThreadData> = Cell::new(null_mut());
}

pub struct GlobalSafepoint {
    /// Even: no collection running. Odd: collection in progress.
    gc_running: AtomicUsize,
    threads_lock: Lock,
    threads: UnsafeCell<Vec<*mut ThreadData>>,
}

unsafe impl Send for GlobalSafepoint {}
unsafe impl Sync for GlobalSafepoint {}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            gc_running: AtomicUsize::new(0),
            threads_lock: Lock::INIT,
            threads: UnsafeCell::new(Vec::new()),
        }
    }

    /// Register the calling thread as a mutator. The thread must poll
    /// and must detach before exiting.
    pub fn attach_current_thread(&self) {
        if !CURRENT_THREAD.with(|c| c.get()).is_null() {
            return;
        }
        let data = Box::into_raw(Box::new(ThreadData {
            stack_high: current_stack_high(),
            last_sp: AtomicUsize::new(0),
            state: Atomic::new(ThreadState::Active),
        }));
        CURRENT_THREAD.with(|c| c.set(data));
        spin_lock(&self.threads_lock);
        unsafe {
            (*self.threads.get()).push(data);
            spin_unlock(&self.threads_lock);
        }
    }

    pub fn detach_current_thread(&self) {
        let data = CURRENT_THREAD.with(|c| c.replace(null_mut()));
        if data.is_null() {
            return;
        }
        // Blocks while a collection holds the thread list, so a thread
        // can never vanish under a running collector.
        spin_lock(&self.threads_lock);
        unsafe {
            (*self.threads.get()).retain(|&t| t != data);
            spin_unlock(&self.threads_lock);
            drop(Box::from_raw(data));
        }
    }

    /// Mutator check-in. Cheap when no collection is running; parks with
    /// the stack pointer recorded when one is.
    #[inline]
    pub fn poll(&self) {
        if self.gc_running.load(Ordering::Acquire) % 2 == 1 {
            self.park();
        }
    }

    #[cold]
    fn park(&self) {
        let data = CURRENT_THREAD.with(|c| c.get());
        if data.is_null() {
            // Unattached threads just wait the collection out.
            while self.gc_running.load(Ordering::Acquire) % 2 == 1 {
                std::hint::spin_loop();
            }
            return;
        }
        unsafe {
            (*data).last_sp.store(approximate_sp(), Ordering::Relaxed);
            (*data).state.store(ThreadState::Parked, Ordering::Release);
            while self.gc_running.load(Ordering::Acquire) % 2 == 1 {
                std::hint::spin_loop();
            }
            (*data).state.store(ThreadState::Active, Ordering::Release);
        }
    }
}

impl ThreadRegistry for GlobalSafepoint {
    fn stop_all_other_threads(&self) {
        let old = self.gc_running.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old % 2 == 0, "nested stop-the-world");
        // Hold the list until resume so threads cannot attach or detach
        // under the collector.
        spin_lock(&self.threads_lock);
        let current = CURRENT_THREAD.with(|c| c.get());
        unsafe {
            for &thread in (*self.threads.get()).iter() {
                if thread == current {
                    continue;
                }
                while (*thread).state.load(Ordering::Acquire) == ThreadState::Active {
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn resume_all_other_threads(&self) {
        unsafe { spin_unlock(&self.threads_lock) };
        let old = self.gc_running.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old % 2 == 1, "resume without stop");
    }

    fn current_stack_bounds(&self) -> Bounds {
        let sp = approximate_sp();
        let high = {
            let data = CURRENT_THREAD.with(|c| c.get());
            if data.is_null() {
                current_stack_high()
            } else {
                unsafe { (*data).stack_high }
            }
        };
        Bounds::new(sp, high.saturating_sub(sp))
    }

    fn for_each_suspended_thread(&self, f: &mut dyn FnMut(Bounds)) {
        let current = CURRENT_THREAD.with(|c| c.get());
        unsafe {
            for &thread in (*self.threads.get()).iter() {
                if thread == current {
                    continue;
                }
                let sp = (*thread).last_sp.load(Ordering::Relaxed);
                if sp == 0 {
                    continue;
                }
                f(Bounds::new(sp, (*thread).stack_high.saturating_sub(sp)));
            }
        }
    }
}

/// An address inside the caller's frame; everything at or above it is
/// live stack.
#[inline(never)]
pub fn approximate_sp() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

#[cfg(target_os = "linux")]
fn current_stack_high() -> usize {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
            let mut stack_addr: *mut libc::c_void = null_mut();
            let mut stack_size: libc::size_t = 0;
            libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
            libc::pthread_attr_destroy(&mut attr);
            return stack_addr as usize + stack_size;
        }
        approximate_sp()
    }
}

#[cfg(not(target_os = "linux"))]
fn current_stack_high() -> usize {
    // Attach runs near the top of the thread's life, so its frame is a
    // usable upper bound for the scannable range.
    approximate_sp()
}

/// Run `f` with the callee-saved registers copied into this frame, so a
/// conservative scan of the stack observes any pointers held only in
/// registers. The spill slots are scrubbed before returning.
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce() -> R) -> R {
    let mut regs = [0usize; 12];
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "mov {0}, rbx",
            out(reg) regs[0],
            out("r12") regs[1],
            out("r13") regs[2],
            out("r14") regs[3],
            out("r15") regs[4],
            options(nomem, nostack, preserves_flags)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "",
            out("x19") regs[0],
            out("x20") regs[1],
            out("x21") regs[2],
            out("x22") regs[3],
            out("x23") regs[4],
            out("x24") regs[5],
            out("x25") regs[6],
            out("x26") regs[7],
            out("x27") regs[8],
            out("x28") regs[9],
            options(nomem, nostack, preserves_flags)
        );
    }
    let slots = &mut regs as *mut [usize; 12];
    unsafe { std::ptr::write_volatile(slots, regs) };
    let result = f();
    unsafe { std::ptr::write_volatile(slots, [0usize; 12]) };
    result
}

/// Clear the caller-save registers so stale heap pointers do not leak
/// out of a collection.
#[inline(never)]
pub fn zero_scratch_registers() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "xor eax, eax",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            out("rax") _,
            out("rcx") _,
            out("rdx") _,
            out("rsi") _,
            out("rdi") _,
            out("r8") _,
            out("r9") _,
            out("r10") _,
            out("r11") _,
            options(nomem, nostack)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "mov x0, xzr",
            "mov x1, xzr",
            "mov x2, xzr",
            "mov x3, xzr",
            "mov x4, xzr",
            "mov x5, xzr",
            "mov x6, xzr",
            "mov x7, xzr",
            "mov x8, xzr",
            "mov x9, xzr",
            "mov x10, xzr",
            "mov x11, xzr",
            "mov x12, xzr",
            "mov x13, xzr",
            "mov x14, xzr",
            "mov x15, xzr",
            out("x0") _,
            out("x1") _,
            out("x2") _,
            out("x3") _,
            out("x4") _,
            out("x5") _,
            out("x6") _,
            out("x7") _,
            out("x8") _,
            out("x9") _,
            out("x10") _,
            out("x11") _,
            out("x12") _,
            out("x13") _,
            out("x14") _,
            out("x15") _,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn stop_parks_running_threads() {
        const THREADS: usize = 4;
        let safepoint = Arc::new(GlobalSafepoint::new());
        let stop = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let attached = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let safepoint = safepoint.clone();
            let stop = stop.clone();
            let counter = counter.clone();
            let attached = attached.clone();
            handles.push(std::thread::spawn(move || {
                safepoint.attach_current_thread();
                attached.fetch_add(1, Ordering::Release);
                while stop.load(Ordering::Relaxed) == 0 {
                    counter.fetch_add(1, Ordering::Relaxed);
                    safepoint.poll();
                }
                safepoint.detach_current_thread();
            }));
        }

        safepoint.attach_current_thread();
        while attached.load(Ordering::Acquire) != THREADS as u32 {
            std::hint::spin_loop();
        }
        for _ in 0..3 {
            safepoint.stop_all_other_threads();
            let frozen = counter.load(Ordering::Relaxed);
            let mut stacks = 0;
            safepoint.for_each_suspended_thread(&mut |bounds| {
                assert!(bounds.len > 0);
                stacks += 1;
            });
            assert_eq!(stacks, THREADS);
            // Nobody makes progress while the world is stopped.
            std::thread::sleep(std::time::Duration::from_millis(10));
            assert_eq!(counter.load(Ordering::Relaxed), frozen);
            safepoint.resume_all_other_threads();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        stop.store(1, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
        safepoint.detach_current_thread();
    }

    #[test]
    fn current_stack_bounds_covers_caller() {
        let safepoint = GlobalSafepoint::new();
        safepoint.attach_current_thread();
        let local = 0usize;
        let bounds = safepoint.current_stack_bounds();
        assert!(bounds.contains(&local as *const usize as usize));
        safepoint.detach_current_thread();
    }
}
