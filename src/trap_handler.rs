//! Signal-based recovery for guest faults.
//!
//! Guest memory accesses are not bounds-checked: linear memories reserve
//! their whole addressable span plus a guard region, and the execution
//! stack ends in a guard page, so an out-of-bounds access raises
//! SIGSEGV/SIGBUS inside a registered range. This module installs a
//! process-wide handler that recognises faults in registered ranges and
//! uses sigsetjmp/siglongjmp to recover back to the interpreter entry,
//! converting the fault into a typed trap. Faults outside registered
//! ranges are chained to the previous handler.
//!
//! # Safety
//!
//! - The handler is async-signal-safe: it reads thread-local data and
//!   calls siglongjmp, both permitted by POSIX.
//! - siglongjmp skips Rust destructors between sigsetjmp and the fault.
//!   The interpreter keeps its state in plain memory owned outside the
//!   guarded closure, so nothing user-visible leaks.

use std::cell::UnsafeCell;
use std::sync::Once;

/// What a fault inside a registered range means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardKind {
    /// The execution stack's guard page.
    StackOverflow,
    /// A linear-memory reservation (committed pages excluded by mprotect).
    MemoryAccess,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GuardRegion {
    pub start: usize,
    pub end: usize,
    pub kind: GuardKind,
}

/// Alternate signal stack size. 64 KiB is generous.
const ALT_STACK_SIZE: usize = 64 * 1024;

/// Fixed-size buffer for sigjmp_buf; 256 bytes covers all supported
/// platforms.
const JMP_BUF_SIZE: usize = 256;

/// `sigjmp_buf` requires pointer/register alignment beyond what `[u8; N]`
/// guarantees on its own.
#[repr(align(16))]
#[derive(Clone, Copy)]
struct JmpBuf([u8; JMP_BUF_SIZE]);

impl JmpBuf {
    const fn new() -> Self {
        JmpBuf([0u8; JMP_BUF_SIZE])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

unsafe extern "C" {
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(buf: *mut u8, save_signals: libc::c_int) -> libc::c_int;
    fn siglongjmp(buf: *mut u8, val: libc::c_int) -> !;
}

struct TrapContext {
    jmp_buf: JmpBuf,
    active: bool,
    /// Kind of the fault that triggered recovery, set by the handler.
    fault_kind: GuardKind,
    regions: Vec<GuardRegion>,
}

impl TrapContext {
    const fn new() -> Self {
        Self {
            jmp_buf: JmpBuf::new(),
            active: false,
            fault_kind: GuardKind::StackOverflow,
            regions: Vec::new(),
        }
    }
}

// UnsafeCell because the signal handler needs access without RefCell's
// bookkeeping, which is not async-signal-safe.
thread_local! {
    static TRAP_CTX: UnsafeCell<TrapContext> = const { UnsafeCell::new(TrapContext::new()) };
}

static mut PREV_SIGSEGV: libc::sigaction = unsafe { std::mem::zeroed() };

static INSTALL_ONCE: Once = Once::new();

/// Install the global SIGSEGV/SIGBUS handler. Idempotent.
pub(crate) fn init() {
    INSTALL_ONCE.call_once(|| unsafe { install_handler() });
}

unsafe fn install_handler() {
    unsafe {
        // An alternate signal stack lets the handler run even when the
        // fault is the thread's own stack guard.
        let alt_stack = libc::mmap(
            std::ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        assert_ne!(alt_stack, libc::MAP_FAILED, "alt stack mmap failed");

        let ss = libc::stack_t {
            ss_sp: alt_stack,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        let ret = libc::sigaltstack(&ss, std::ptr::null_mut());
        assert_eq!(ret, 0, "sigaltstack failed");

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigsegv_handler as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut sa.sa_mask);

        let ret = libc::sigaction(libc::SIGSEGV, &sa, std::ptr::addr_of_mut!(PREV_SIGSEGV));
        assert_eq!(ret, 0, "sigaction SIGSEGV failed");

        // Some platforms deliver SIGBUS for guard page faults.
        let ret = libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut());
        assert_eq!(ret, 0, "sigaction SIGBUS failed");
    }
}

unsafe extern "C" fn sigsegv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let fault_addr = unsafe { (*info).si_addr() as usize };
    unsafe { libc::write(2, b"handler entered\n".as_ptr() as *const _, 16); }

    TRAP_CTX.with(|cell| {
        let ctx = unsafe { &mut *cell.get() };
        if !ctx.active {
            unsafe { libc::write(2, b"not active\n".as_ptr() as *const _, 11); }
            unsafe { chain_to_previous(sig, info, ucontext) };
            return;
        }

        let hit = ctx
            .regions
            .iter()
            .find(|region| fault_addr >= region.start && fault_addr < region.end);

        match hit {
            Some(region) => {
                unsafe { libc::write(2, b"hit region, longjmp\n".as_ptr() as *const _, 21); }
                ctx.fault_kind = region.kind;
                ctx.active = false;
                unsafe { siglongjmp(ctx.jmp_buf.as_mut_ptr(), 1) };
            }
            None => {
                unsafe { libc::write(2, b"no hit\n".as_ptr() as *const _, 7); }
                unsafe { chain_to_previous(sig, info, ucontext) }
            },
        }
    });
}

unsafe fn chain_to_previous(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let prev = unsafe { std::ptr::addr_of!(PREV_SIGSEGV).read() };
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(prev.sa_sigaction) };
        unsafe { handler(sig, info, ucontext) };
    } else {
        let handler = prev.sa_sigaction;
        if handler == libc::SIG_DFL {
            unsafe {
                libc::signal(sig, libc::SIG_DFL);
                libc::raise(sig);
            }
        } else if handler != libc::SIG_IGN {
            let handler: unsafe extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            unsafe { handler(sig) };
        }
    }
}

/// Run `f` with fault recovery over the given guard regions.
///
/// If a SIGSEGV/SIGBUS lands in one of the regions while `f` runs, control
/// returns here and the region's [`GuardKind`] is reported. Nested entries
/// (a host function re-entering guest code) save and restore the outer
/// recovery point.
pub(crate) fn enter_guarded<F, T>(regions: &[GuardRegion], f: F) -> Result<T, GuardKind>
where
    F: FnOnce() -> T,
{
    init();

    // Save the outer recovery point and region set for nested entries.
    let (saved_buf, saved_active, saved_len) = TRAP_CTX.with(|cell| {
        let ctx = unsafe { &mut *cell.get() };
        let saved = (ctx.jmp_buf, ctx.active, ctx.regions.len());
        ctx.regions.extend_from_slice(regions);
        saved
    });

    let recovered = TRAP_CTX.with(|cell| {
        let ctx = unsafe { &mut *cell.get() };
        let ret = unsafe { sigsetjmp(ctx.jmp_buf.as_mut_ptr(), 0) };
        if ret == 0 {
            ctx.active = true;
            None
        } else {
            Some(ctx.fault_kind)
        }
    });

    if let Some(kind) = recovered {
        restore(saved_buf, saved_active, saved_len);
        return Err(kind);
    }

    let result = f();

    restore(saved_buf, saved_active, saved_len);
    Ok(result)
}

fn restore(saved_buf: JmpBuf, saved_active: bool, saved_len: usize) {
    TRAP_CTX.with(|cell| {
        let ctx = unsafe { &mut *cell.get() };
        ctx.jmp_buf = saved_buf;
        ctx.active = saved_active;
        ctx.regions.truncate(saved_len);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_from_a_guarded_fault() {
        init();
        unsafe {
            let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let base = libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(base, libc::MAP_FAILED);

            let region = GuardRegion {
                start: base as usize,
                end: base as usize + page,
                kind: GuardKind::MemoryAccess,
            };
            let result = enter_guarded(&[region], || {
                std::ptr::read_volatile(base as *const u8)
            });
            assert_eq!(result.unwrap_err(), GuardKind::MemoryAccess);

            libc::munmap(base, page);
        }
    }

    #[test]
    fn unguarded_code_runs_normally() {
        let result = enter_guarded(&[], || 41 + 1);
        assert_eq!(result.unwrap(), 42);
    }
}
