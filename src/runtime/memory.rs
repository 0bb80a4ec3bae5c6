//! Guard-page linear memory.
//!
//! A memory reserves its entire 32-bit addressable span plus a guard
//! region up front as PROT_NONE, then commits pages read-write as the
//! memory grows. Any `base + address + offset` computed from 32-bit guest
//! operands lands inside the reservation, so guest loads and stores need
//! no bounds checks: an out-of-bounds access faults on a protected page
//! and the signal handler converts it into an access-violation trap.
//!
//! Growth never moves the base — it only flips protection on pages that
//! are already reserved — so shared memories may grow while other threads
//! are mid-access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::runtime::{Trap, TrapKind};
use crate::trap_handler::{GuardKind, GuardRegion};
use crate::types::MemoryType;

pub(crate) const PAGE_BYTES: u64 = 65536;
const MAX_PAGES: u64 = 1 << 16;

/// Reservation: the 8 GiB reachable by `u32 address + u32 offset` plus one
/// 64 KiB guard tail for the widest access.
const RESERVATION_BYTES: usize = (1usize << 33) + PAGE_BYTES as usize;

pub(crate) struct MemoryInstance {
    ty: MemoryType,
    base: *mut u8,
    /// Current size in pages; plain loads for `memory.size`.
    pages: AtomicU64,
    /// Serializes growth; also guards mprotect against racing growers.
    grow_lock: Mutex<()>,
    /// Thread imprint for non-shared memories; 0 means unclaimed.
    owner_thread: AtomicU64,
    wait_queues: Mutex<HashMap<u64, Arc<WaitQueue>>>,
}

// SAFETY: all mutation goes through atomics, the grow lock, or (for the
// byte contents) guest code whose cross-thread access is either atomic
// opcodes on shared memories or rejected by the thread imprint.
unsafe impl Send for MemoryInstance {}
unsafe impl Sync for MemoryInstance {}

impl MemoryInstance {
    pub(crate) fn new(ty: MemoryType) -> Result<Self, Trap> {
        // SAFETY: fresh anonymous reservation; commit happens below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                RESERVATION_BYTES,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Trap::new(TrapKind::OutOfMemory, "memory reservation failed"));
        }
        let memory = Self {
            ty,
            base: base as *mut u8,
            pages: AtomicU64::new(0),
            grow_lock: Mutex::new(()),
            owner_thread: AtomicU64::new(0),
            wait_queues: Mutex::new(HashMap::new()),
        };
        if memory.commit(0, ty.size.min).is_err() {
            return Err(Trap::new(TrapKind::OutOfMemory, "memory commit failed"));
        }
        memory.pages.store(ty.size.min, Ordering::SeqCst);
        Ok(memory)
    }

    fn commit(&self, from_page: u64, to_page: u64) -> Result<(), ()> {
        if from_page == to_page {
            return Ok(());
        }
        // SAFETY: the range lies inside our reservation.
        let result = unsafe {
            libc::mprotect(
                self.base.add((from_page * PAGE_BYTES) as usize) as *mut libc::c_void,
                ((to_page - from_page) * PAGE_BYTES) as usize,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if result == 0 { Ok(()) } else { Err(()) }
    }

    pub(crate) fn ty(&self) -> MemoryType {
        self.ty
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.ty.is_shared
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn size_pages(&self) -> u64 {
        self.pages.load(Ordering::SeqCst)
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.size_pages() * PAGE_BYTES
    }

    /// The whole reservation, registered so faults on uncommitted pages
    /// become access-violation traps.
    pub(crate) fn guard_region(&self) -> GuardRegion {
        GuardRegion {
            start: self.base as usize,
            end: self.base as usize + RESERVATION_BYTES,
            kind: GuardKind::MemoryAccess,
        }
    }

    /// Grow by `delta` pages; returns the previous size, or -1 on failure.
    pub(crate) fn grow(&self, delta: u64) -> i64 {
        let _guard = self.grow_lock.lock().unwrap();
        let old_pages = self.pages.load(Ordering::SeqCst);
        let Some(new_pages) = old_pages.checked_add(delta) else {
            return -1;
        };
        let limit = if self.ty.size.is_bounded() {
            self.ty.size.max.min(MAX_PAGES)
        } else {
            MAX_PAGES
        };
        if new_pages > limit {
            return -1;
        }
        if self.commit(old_pages, new_pages).is_err() {
            return -1;
        }
        self.pages.store(new_pages, Ordering::SeqCst);
        old_pages as i64
    }

    /// Stamp the calling thread onto a non-shared memory; a second thread
    /// touching it traps instead of racing.
    pub(crate) fn claim_thread(&self) -> Result<(), Trap> {
        if self.ty.is_shared {
            return Ok(());
        }
        let me = current_thread_token();
        match self
            .owner_thread
            .compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == me => Ok(()),
            Err(_) => Err(Trap::new(
                TrapKind::AccessViolation,
                "non-shared memory accessed from a second thread",
            )),
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), Trap> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.size_bytes() => Ok(()),
            _ => Err(Trap::new(TrapKind::AccessViolation, "out-of-bounds memory access")),
        }
    }

    /// Bounds-checked write, for hosts and segment initialization.
    pub(crate) fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        self.check_range(offset, bytes.len() as u64)?;
        // SAFETY: range checked against the committed size.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset as usize), bytes.len());
        }
        Ok(())
    }

    /// Bounds-checked read.
    pub(crate) fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Trap> {
        self.check_range(offset, out.len() as u64)?;
        // SAFETY: range checked against the committed size.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    // -- atomic wait/notify ------------------------------------------------

    fn wait_queue(&self, address: u64) -> Arc<WaitQueue> {
        let mut queues = self.wait_queues.lock().unwrap();
        queues.entry(address).or_default().clone()
    }

    fn check_wait_address(&self, address: u64, size: u64) -> Result<(), Trap> {
        if !self.ty.is_shared {
            return Err(Trap::new(
                TrapKind::AccessViolation,
                "atomic wait on a non-shared memory",
            ));
        }
        if address % size != 0 {
            return Err(Trap::new(TrapKind::AccessViolation, "misaligned atomic access"));
        }
        self.check_range(address, size)
    }

    /// Park until notified, value mismatch, or timeout: 0 = woken,
    /// 1 = value differed, 2 = timed out. Negative timeout waits forever.
    pub(crate) fn wait32(&self, address: u64, expected: i32, timeout_ns: i64) -> Result<i32, Trap> {
        self.check_wait_address(address, 4)?;
        // SAFETY: in-bounds, aligned; the queue lock orders the load
        // against notifiers.
        let cell = unsafe { &*(self.base.add(address as usize) as *const AtomicI32) };
        self.wait_on(address, timeout_ns, || cell.load(Ordering::SeqCst) == expected)
    }

    pub(crate) fn wait64(&self, address: u64, expected: i64, timeout_ns: i64) -> Result<i32, Trap> {
        self.check_wait_address(address, 8)?;
        // SAFETY: as in wait32.
        let cell = unsafe { &*(self.base.add(address as usize) as *const AtomicI64) };
        self.wait_on(address, timeout_ns, || cell.load(Ordering::SeqCst) == expected)
    }

    fn wait_on(
        &self,
        address: u64,
        timeout_ns: i64,
        still_expected: impl Fn() -> bool,
    ) -> Result<i32, Trap> {
        let queue = self.wait_queue(address);
        let deadline = if timeout_ns < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
        };

        let mut state = queue.state.lock().unwrap();
        // The value check happens under the queue lock; notify takes the
        // same lock before handing out wake tokens, so a concurrent store
        // plus notify cannot slip between this check and the park.
        if !still_expected() {
            return Ok(1);
        }
        state.waiters += 1;
        loop {
            if state.wake_tokens > 0 {
                state.wake_tokens -= 1;
                state.waiters -= 1;
                return Ok(0);
            }
            match deadline {
                None => {
                    state = queue.condvar.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters -= 1;
                        return Ok(2);
                    }
                    let (next, timeout) =
                        queue.condvar.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                    if timeout.timed_out() && state.wake_tokens == 0 {
                        state.waiters -= 1;
                        return Ok(2);
                    }
                }
            }
        }
    }

    /// Wake up to `count` waiters at `address`; returns how many were
    /// actually woken.
    pub(crate) fn notify(&self, address: u64, count: u32) -> Result<i32, Trap> {
        if address % 4 != 0 {
            return Err(Trap::new(TrapKind::AccessViolation, "misaligned atomic access"));
        }
        self.check_range(address, 4)?;
        if !self.ty.is_shared {
            return Ok(0);
        }
        let queue = self.wait_queue(address);
        let mut state = queue.state.lock().unwrap();
        let available = state.waiters.saturating_sub(state.wake_tokens);
        let woken = count.min(available);
        state.wake_tokens += woken;
        drop(state);
        queue.condvar.notify_all();
        Ok(woken as i32)
    }
}

impl Drop for MemoryInstance {
    fn drop(&mut self) {
        // SAFETY: base/RESERVATION_BYTES come from the mmap in new.
        unsafe {
            let result = libc::munmap(self.base as *mut libc::c_void, RESERVATION_BYTES);
            debug_assert!(result == 0, "memory munmap failed");
        }
    }
}

#[derive(Default)]
struct WaitQueue {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

#[derive(Default)]
struct WaitState {
    waiters: u32,
    wake_tokens: u32,
}

/// Process-unique token for the current thread; thread ids are not
/// directly convertible to integers on stable.
fn current_thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SizeConstraints;

    fn plain(min: u64, max: Option<u64>) -> MemoryInstance {
        MemoryInstance::new(MemoryType {
            is_shared: false,
            size: SizeConstraints::new(min, max),
        })
        .unwrap()
    }

    #[test]
    fn committed_range_is_readable_and_writable() {
        let memory = plain(1, None);
        memory.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        memory.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_bounds_checked_access_traps() {
        let memory = plain(1, None);
        let err = memory.write(PAGE_BYTES - 2, b"abc").unwrap_err();
        assert_eq!(err.kind(), TrapKind::AccessViolation);
    }

    #[test]
    fn grow_respects_the_declared_maximum() {
        let memory = plain(1, Some(2));
        assert_eq!(memory.grow(1), 1);
        assert_eq!(memory.size_pages(), 2);
        assert_eq!(memory.grow(1), -1);
        assert_eq!(memory.size_pages(), 2);
    }

    #[test]
    fn grow_commits_new_pages_in_place() {
        let memory = plain(1, None);
        let base = memory.base();
        assert_eq!(memory.grow(3), 1);
        assert_eq!(memory.base(), base);
        memory.write(3 * PAGE_BYTES, &[7]).unwrap();
    }

    #[test]
    fn shared_wait_notify_wakes_one() {
        let memory = Arc::new(
            MemoryInstance::new(MemoryType {
                is_shared: true,
                size: SizeConstraints::new(1, Some(1)),
            })
            .unwrap(),
        );
        let waiter = {
            let memory = Arc::clone(&memory);
            std::thread::spawn(move || memory.wait32(0, 0, 5_000_000_000).unwrap())
        };
        // Give the waiter time to park, then notify.
        std::thread::sleep(Duration::from_millis(50));
        let woken = memory.notify(0, 1).unwrap();
        assert_eq!(woken, 1);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn wait_times_out() {
        let memory = MemoryInstance::new(MemoryType {
            is_shared: true,
            size: SizeConstraints::new(1, Some(1)),
        })
        .unwrap();
        let started = Instant::now();
        assert_eq!(memory.wait32(0, 0, 20_000_000).unwrap(), 2);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_with_unexpected_value_returns_immediately() {
        let memory = MemoryInstance::new(MemoryType {
            is_shared: true,
            size: SizeConstraints::new(1, Some(1)),
        })
        .unwrap();
        memory.write(0, &5i32.to_le_bytes()).unwrap();
        assert_eq!(memory.wait32(0, 0, -1).unwrap(), 1);
    }
}
