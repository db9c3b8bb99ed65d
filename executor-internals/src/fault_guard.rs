//! Crash-safe syscall invocation.
//!
//! `guarded(f)` runs `f` with a synchronous memory fault (SIGSEGV/SIGBUS)
//! converted into an early `None` return instead of process termination,
//! via a process-wide signal handler plus a raw `sigsetjmp`/`siglongjmp`
//! pair that rewinds to the guarded region's entry point.

use libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Once;

/// Opaque, intentionally oversized `sigjmp_buf`. Every known `sigsetjmp`
/// implementation only reads/writes within its own ABI-defined layout, so a
/// generously sized buffer is a safe superset on every architecture this
/// harness targets; it is never interpreted by our own code.
#[repr(C, align(16))]
struct SigJmpBuf([u8; 256]);

impl SigJmpBuf {
    const fn zeroed() -> Self {
        SigJmpBuf([0u8; 256])
    }
}

extern "C" {
    fn sigsetjmp(env: *mut SigJmpBuf, savesigs: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

thread_local! {
    /// Nonzero while this thread is inside a guarded region; re-entrant.
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    /// Points at the innermost active region's recovery point; valid only
    /// while `COUNTER` is nonzero.
    static RECOVERY_PTR: AtomicPtr<SigJmpBuf> = AtomicPtr::new(std::ptr::null_mut());
}

static INSTALL: Once = Once::new();

/// Install the process-wide SIGSEGV/SIGBUS handler. Idempotent; called
/// automatically on first use of [`guarded`].
pub fn ensure_installed() {
    INSTALL.call_once(|| unsafe { install_handler() });
}

unsafe fn install_handler() {
    // Do not mask further occurrences of these signals during handling:
    // empty mask, and no SA_NODEFER needed for SIGSEGV vs. SIGBUS since
    // they are distinct signals already unmasked by default; SA_NODEFER
    // additionally keeps a repeat of *the same* signal unmasked.
    let sa = SigAction::new(
        SigHandler::SigAction(handle_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    sigaction(Signal::SIGSEGV, &sa).expect("sigaction succeeds");
    sigaction(Signal::SIGBUS, &sa).expect("sigaction succeeds");
}

/// Run `f` inside a guarded region. Returns `Some(f())` on normal
/// completion, or `None` if a synchronous memory fault occurred anywhere
/// during `f`'s execution and was recovered.
///
/// Nested calls are supported: the innermost region's recovery point wins,
/// because it overwrote the thread-local pointer last and is restored first
/// on the way back out.
pub fn guarded<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    ensure_installed();

    let mut buf = SigJmpBuf::zeroed();
    let buf_ptr: *mut SigJmpBuf = &mut buf;
    let previous_ptr = RECOVERY_PTR.with(|p| p.load(Ordering::SeqCst));

    // Counter is raised, with full ordering, before the recovery point is
    // armed.
    COUNTER.with(|c| c.fetch_add(1, Ordering::SeqCst));
    RECOVERY_PTR.with(|p| p.store(buf_ptr, Ordering::SeqCst));

    let jumped_back = unsafe { sigsetjmp(buf_ptr, 1) };
    let result = if jumped_back == 0 { Some(f()) } else { None };

    // Decremented, with full ordering, on every path out of the region:
    // normal completion or recovered fault.
    RECOVERY_PTR.with(|p| p.store(previous_ptr, Ordering::SeqCst));
    COUNTER.with(|c| c.fetch_sub(1, Ordering::SeqCst));

    result
}

/// Handler for SIGSEGV/SIGBUS. Allocates nothing and takes no locks: a
/// relaxed load of the counter (synchronous with this same thread's stores)
/// decides whether to unwind via `siglongjmp` or terminate the process with
/// the signal number as exit status.
extern "C" fn handle_fault(signum: c_int, _siginfo: *mut siginfo_t, _ucontext: *mut c_void) {
    let counter = COUNTER.with(|c| c.load(Ordering::Relaxed));
    if counter == 0 {
        unsafe { libc::_exit(signum) };
    }
    let ptr = RECOVERY_PTR.with(|p| p.load(Ordering::Relaxed));
    unsafe { siglongjmp(ptr, 1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // Process-mutating (installs real signal handlers, dereferences bad
    // pointers) so each scenario runs in a forked child rather than risk
    // taking down the whole test binary.
    fn in_forked_child<F: FnOnce()>(body: F) {
        match unsafe { fork() }.expect("fork succeeds") {
            ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid succeeds") {
                WaitStatus::Exited(_, 0) => {}
                other => panic!("child did not exit cleanly: {:?}", other),
            },
            ForkResult::Child => {
                body();
                unsafe { libc::_exit(0) };
            }
        }
    }

    #[test]
    fn recovers_from_null_deref() {
        in_forked_child(|| {
            let result = guarded(|| {
                let p: *mut u8 = std::ptr::null_mut();
                unsafe { std::ptr::write_volatile(p, 1) };
                42u32
            });
            assert_eq!(result, None);
        });
    }

    #[test]
    fn normal_completion_returns_some() {
        in_forked_child(|| {
            let result = guarded(|| 7u32);
            assert_eq!(result, Some(7));
        });
    }

    #[test]
    fn nested_regions_restore_counter_to_zero() {
        in_forked_child(|| {
            let outer = guarded(|| {
                let inner = guarded(|| {
                    let p: *mut u8 = std::ptr::null_mut();
                    unsafe { std::ptr::write_volatile(p, 1) };
                    1u32
                });
                assert_eq!(inner, None);
                COUNTER.with(|c| assert_eq!(c.load(Ordering::SeqCst), 1));
                5u32
            });
            assert_eq!(outer, Some(5));
            COUNTER.with(|c| assert_eq!(c.load(Ordering::SeqCst), 0));
        });
    }
}
