//! The execution stack: mmap'd memory with a trailing guard page.
//!
//! All interpreter state that scales with guest recursion lives here:
//! operand slots and local-variable frames. Values occupy 8-byte slots
//! (`v128` takes two). Pushes and pops are not bounds-checked; exhausting
//! the stack hits the guard page and is recovered as a stack-overflow
//! trap by the signal handler.

use crate::trap_handler::{GuardKind, GuardRegion};

/// Default capacity: 1 MiB of virtual memory. Physical pages are
/// demand-paged, so a large capacity costs nothing until used.
const DEFAULT_CAPACITY: usize = 1024 * 1024;

pub(crate) struct Stack {
    base: *mut u8,
    sp: u32,
    capacity: u32,
    mmap_size: usize,
}

// The stack is only ever used by the thread that created it; the raw
// pointer does not make it inherently thread-bound.
unsafe impl Send for Stack {}

impl Stack {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let page_size = page_size();
        let capacity = capacity.div_ceil(page_size) * page_size;
        let mmap_size = capacity + page_size;

        // SAFETY: anonymous private mapping; the final page is immediately
        // protected as the guard.
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert!(base != libc::MAP_FAILED, "stack mmap of {mmap_size} bytes failed");

            let guarded = libc::mprotect(
                (base as *mut u8).add(capacity) as *mut libc::c_void,
                page_size,
                libc::PROT_NONE,
            );
            assert!(guarded == 0, "stack guard mprotect failed");

            Self {
                base: base as *mut u8,
                sp: 0,
                capacity: capacity as u32,
                mmap_size,
            }
        }
    }

    /// The guard region for trap-handler registration.
    pub(crate) fn guard_region(&self) -> GuardRegion {
        GuardRegion {
            start: self.base as usize + self.capacity as usize,
            end: self.base as usize + self.mmap_size,
            kind: GuardKind::StackOverflow,
        }
    }

    #[inline(always)]
    pub(crate) fn sp(&self) -> u32 {
        self.sp
    }

    #[inline(always)]
    pub(crate) fn set_sp(&mut self, sp: u32) {
        self.sp = sp;
    }

    #[inline(always)]
    pub(crate) unsafe fn push_u64(&mut self, value: u64) {
        unsafe {
            let ptr = self.base.add(self.sp as usize) as *mut u64;
            ptr.write_unaligned(value);
        }
        self.sp += 8;
    }

    #[inline(always)]
    pub(crate) unsafe fn pop_u64(&mut self) -> u64 {
        self.sp -= 8;
        unsafe {
            let ptr = self.base.add(self.sp as usize) as *const u64;
            ptr.read_unaligned()
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn peek_u64(&self) -> u64 {
        unsafe { self.read_u64(self.sp - 8) }
    }

    #[inline(always)]
    pub(crate) unsafe fn read_u64(&self, offset: u32) -> u64 {
        unsafe {
            let ptr = self.base.add(offset as usize) as *const u64;
            ptr.read_unaligned()
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn write_u64(&mut self, offset: u32, value: u64) {
        unsafe {
            let ptr = self.base.add(offset as usize) as *mut u64;
            ptr.write_unaligned(value);
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn push_u128(&mut self, value: u128) {
        unsafe {
            self.push_u64(value as u64);
            self.push_u64((value >> 64) as u64);
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn pop_u128(&mut self) -> u128 {
        unsafe {
            let hi = self.pop_u64();
            let lo = self.pop_u64();
            ((hi as u128) << 64) | lo as u128
        }
    }

    /// Push `count` zero bytes (zero-initialized locals).
    #[inline(always)]
    pub(crate) unsafe fn push_zeroes(&mut self, count: u32) {
        unsafe {
            std::ptr::write_bytes(self.base.add(self.sp as usize), 0, count as usize);
        }
        self.sp += count;
    }

    /// Copy `count` bytes from `src` down to `dst` (frame teardown: move
    /// results over dead locals). Ranges may overlap.
    #[inline(always)]
    pub(crate) unsafe fn copy_down(&mut self, src: u32, dst: u32, count: u32) {
        unsafe {
            std::ptr::copy(
                self.base.add(src as usize),
                self.base.add(dst as usize),
                count as usize,
            );
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: base/mmap_size come from the successful mmap in new.
        unsafe {
            let result = libc::munmap(self.base as *mut libc::c_void, self.mmap_size);
            debug_assert!(result == 0, "stack munmap failed");
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) is always safe.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trips() {
        let mut stack = Stack::new();
        unsafe {
            stack.push_u64(7);
            stack.push_u64(u64::MAX);
            assert_eq!(stack.pop_u64(), u64::MAX);
            assert_eq!(stack.pop_u64(), 7);
            assert_eq!(stack.sp(), 0);
        }
    }

    #[test]
    fn v128_values_take_two_slots() {
        let mut stack = Stack::new();
        unsafe {
            let value = 0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10u128;
            stack.push_u128(value);
            assert_eq!(stack.sp(), 16);
            assert_eq!(stack.pop_u128(), value);
        }
    }

    #[test]
    fn copy_down_moves_results_over_locals() {
        let mut stack = Stack::new();
        unsafe {
            stack.push_zeroes(24);
            stack.write_u64(16, 42);
            stack.copy_down(16, 0, 8);
            assert_eq!(stack.read_u64(0), 42);
        }
    }

    #[test]
    fn zeroes_are_zero() {
        let mut stack = Stack::new();
        unsafe {
            stack.push_u64(u64::MAX);
            stack.set_sp(0);
            stack.push_zeroes(8);
            assert_eq!(stack.read_u64(0), 0);
        }
    }
}
