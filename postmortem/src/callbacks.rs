//! The post-crash callback.
//!
//! A narrow, explicitly documented escape hatch: after the report has been
//! written (or the write has failed), the reporter invokes one caller
//! function from within the fault-handling context. It runs after the write
//! on purpose — the report is already on disk, so a misbehaving callback can
//! delay termination but cannot lose the report.

use postmortem_context::{CrashContext, ThreadState};
use std::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

/// Signature of the post-crash callback.
///
/// `state` points at the captured register state of the faulting thread, or
/// is null when the capture came from the exception-port mechanism, whose
/// register representation does not round-trip into the signal-style context
/// (documented degraded behavior, kept rather than backfilled).
pub type PostCrashCallback =
    unsafe extern "C" fn(signo: i32, fault_addr: u64, state: *const ThreadState, context: *mut c_void);

/// Callbacks the host application registers with
/// [`crate::Reporter::set_callbacks`].
///
/// # Safety contract (documented, not enforced)
///
/// `on_crash` executes with the same constraints as the rest of the fatal
/// path: no allocation, no locks, no non-reentrant services. `context` is
/// passed through untouched; the caller guarantees it stays valid (and is
/// not freed by the callback — no ownership moves here) for as long as the
/// reporter is enabled.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Callbacks {
    /// Version tag for this struct; 0 is the only defined version, anything
    /// else is ignored at dispatch time.
    pub version: u16,
    /// Arbitrary user pointer handed back to `on_crash`. May be null.
    pub context: *mut c_void,
    pub on_crash: Option<PostCrashCallback>,
}

// SAFETY: the struct is only ever read from the single thread running the
// fatal path; validity of `context` across threads is the caller's
// documented obligation
unsafe impl Send for Callbacks {}
unsafe impl Sync for Callbacks {}

/// Registered callbacks; null or a leaked box swapped in whole so the fault
/// path reads a consistent struct with one atomic load.
static REGISTERED: AtomicPtr<Callbacks> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn set(callbacks: Callbacks) {
    let fresh = Box::into_raw(Box::new(callbacks));
    let old = REGISTERED.swap(fresh, Ordering::AcqRel);
    // Deliberately leaked, not dropped: the fault path may have loaded the
    // old pointer and be mid-dispatch on another thread
    let _ = old;
}

/// Invokes the registered callback, if any. Runs in the fault-handling
/// context; everything here must stay async-signal-safe.
pub(crate) fn dispatch(ctx: &CrashContext) {
    let registered = REGISTERED.load(Ordering::Acquire);
    if registered.is_null() {
        return;
    }

    // SAFETY: set() only ever stores leaked boxes, which are never freed
    // while the reporter can still crash
    let callbacks = unsafe { &*registered };
    if callbacks.version != 0 {
        return;
    }
    let Some(on_crash) = callbacks.on_crash else {
        return;
    };

    let state: *const ThreadState = if ctx.fault.has_exception != 0 || ctx.thread_count == 0 {
        ptr::null()
    } else {
        &ctx.threads[0].state
    };

    // SAFETY: the callback upholds the documented contract
    unsafe {
        on_crash(ctx.fault.signo, ctx.fault.addr, state, callbacks.context);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize};

    static SEEN_SIGNO: AtomicI32 = AtomicI32::new(0);
    static SEEN_STATE: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe extern "C" fn record(signo: i32, _addr: u64, state: *const ThreadState, _cx: *mut c_void) {
        SEEN_SIGNO.store(signo, Ordering::SeqCst);
        SEEN_STATE.store(state as usize, Ordering::SeqCst);
    }

    #[test]
    fn dispatch_passes_signal_state_and_degrades_for_exceptions() {
        set(Callbacks {
            version: 0,
            context: ptr::null_mut(),
            on_crash: Some(record),
        });

        let mut ctx = Box::new(CrashContext::zeroed());
        ctx.fault.signo = libc::SIGBUS;
        ctx.push_thread().unwrap();

        dispatch(&ctx);
        assert_eq!(SEEN_SIGNO.load(Ordering::SeqCst), libc::SIGBUS);
        assert_ne!(SEEN_STATE.load(Ordering::SeqCst), 0);

        // Exception-port origin: context pointer degrades to null
        ctx.fault.has_exception = 1;
        dispatch(&ctx);
        assert_eq!(SEEN_STATE.load(Ordering::SeqCst), 0);

        // An unknown struct version is ignored entirely
        SEEN_SIGNO.store(-1, Ordering::SeqCst);
        set(Callbacks {
            version: 99,
            context: ptr::null_mut(),
            on_crash: Some(record),
        });
        dispatch(&ctx);
        assert_eq!(SEEN_SIGNO.load(Ordering::SeqCst), -1);
    }
}
