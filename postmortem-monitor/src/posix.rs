//! The POSIX signal mechanism.
//!
//! Handler installation/teardown runs on normal threads and may lock; the
//! signal handler itself touches only atomics, static buffers, and raw
//! syscalls. The saved-handler table is therefore split in two: a bookkeeping
//! mutex that serializes attach/detach, and a plain static snapshot of the
//! previous actions published through an atomic flag for the handler to read
//! without locking.

mod stack;

use crate::{Error, FaultSink, MonitorOptions, Signal, ALL_SIGNALS};
use postmortem_context::{capture, CrashContext, THREAD_FAULTING, THREAD_STATE_VALID};
#[cfg(any(target_os = "linux", target_os = "android"))]
use postmortem_context::{fill_state, ucontext_t};
use std::{
    cell::UnsafeCell,
    mem, ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// kill
const SI_USER: i32 = 0;

/// Serializes attach/detach. Never touched by the signal handler.
static ATTACHED: parking_lot::Mutex<bool> = parking_lot::const_mutex(false);

/// Previously installed actions, index-aligned with [`ALL_SIGNALS`]; `None`
/// in a slot means that signal was not intercepted. Written under [`ATTACHED`]
/// and only read by the handler after [`SAVED_VALID`] is observed set.
struct SavedActions(UnsafeCell<[Option<libc::sigaction>; 6]>);

// SAFETY: writes are serialized by ATTACHED and published via SAVED_VALID
unsafe impl Sync for SavedActions {}

static SAVED_ACTIONS: SavedActions = SavedActions(UnsafeCell::new([None; 6]));
static SAVED_VALID: AtomicBool = AtomicBool::new(false);

/// Single in-flight guard for the whole fatal path. Claimed with a
/// compare-and-swap, never a lock: the faulting thread may own any mutex in
/// the process, including an allocator's.
static IN_FLIGHT: AtomicBool = AtomicBool::new(false);

/// The registered [`FaultSink`], stored as a plain address so the handler
/// reads it with a single atomic load.
static SINK: AtomicUsize = AtomicUsize::new(0);

/// Whether to restore the previously installed handlers (chaining) instead
/// of the OS defaults after the pipeline runs.
static CHAIN: AtomicBool = AtomicBool::new(false);

struct ContextBuffer(UnsafeCell<CrashContext>);

// SAFETY: exclusively owned by whoever wins the in-flight guard
unsafe impl Sync for ContextBuffer {}

/// The size of `CrashContext` is far too big w.r.t. the size of the
/// alternate stack, so it lives in .bss instead.
static CRASH_CONTEXT: ContextBuffer = ContextBuffer(UnsafeCell::new(unsafe { mem::zeroed() }));

pub(crate) fn attach(options: &MonitorOptions, sink: FaultSink) -> Result<(), Error> {
    let mut attached = ATTACHED.lock();
    if *attached {
        return Err(Error::AlreadyAttached);
    }

    SINK.store(sink as usize, Ordering::Release);
    CHAIN.store(options.chain_previous, Ordering::Release);

    // SAFETY: syscalls, and the SAVED_ACTIONS write is serialized by the
    // lock we hold
    unsafe {
        stack::install_sigaltstack()?;
        capture::install_capture_handler()?;

        let saved = install_handlers(&options.signals)?;
        *SAVED_ACTIONS.0.get() = saved;
    }
    SAVED_VALID.store(true, Ordering::Release);

    *attached = true;
    Ok(())
}

/// Detaches the signal mechanism, restoring the previously installed or
/// default handlers
pub(crate) fn detach() {
    let mut attached = ATTACHED.lock();
    if !*attached {
        return;
    }

    SAVED_VALID.store(false, Ordering::Release);
    SINK.store(0, Ordering::Release);

    // SAFETY: syscalls; SAVED_ACTIONS reads are serialized by the lock
    unsafe {
        restore_handlers(&*SAVED_ACTIONS.0.get());
        *SAVED_ACTIONS.0.get() = [None; 6];
        capture::restore_capture_handler();
        stack::restore_sigaltstack();
    }

    *attached = false;
}

/// Runs the capture pipeline for a synthesized fault without dying: no
/// handler restore, no re-raise, and the in-flight guard is handed back.
pub(crate) fn simulate(signal: Signal) -> bool {
    if IN_FLIGHT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }

    // SAFETY: the guard we just won is what hands out exclusive access
    let ctx = unsafe { &mut *CRASH_CONTEXT.0.get() };
    ctx.reset();
    let tid = current_tid();
    ctx.fault.signo = signal as i32;
    ctx.fault.code = SI_USER;
    ctx.pid = std::process::id();
    ctx.fault_tid = tid;
    ctx.timestamp = wall_clock_seconds();

    if let Some(record) = ctx.push_thread() {
        record.tid = tid;
        record.flags |= THREAD_FAULTING;
        if postmortem_context::capture_current_state(&mut record.state) {
            record.flags |= THREAD_STATE_VALID;
        }
    }

    let sink = SINK.load(Ordering::Acquire);
    if sink != 0 {
        // SAFETY: only ever stored from a valid `FaultSink`
        let sink: FaultSink = unsafe { mem::transmute(sink) };
        sink(ctx);
    }

    IN_FLIGHT.store(false, Ordering::Release);
    sink != 0
}

/// Installs our handler for each selected signal, returning the table of
/// previous actions.
///
/// SAFETY: syscalls
unsafe fn install_handlers(signals: &[Signal]) -> Result<[Option<libc::sigaction>; 6], Error> {
    let mut saved: [Option<libc::sigaction>; 6] = [None; 6];

    let mut sa: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut sa.sa_mask);

    // Mask every intercepted signal while we're handling one of them
    for sig in ALL_SIGNALS {
        libc::sigaddset(&mut sa.sa_mask, sig as i32);
    }

    sa.sa_sigaction = signal_handler as usize;
    sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

    for (idx, sig) in ALL_SIGNALS.into_iter().enumerate() {
        if !signals.contains(&sig) {
            continue;
        }

        let mut prev = mem::zeroed();
        if libc::sigaction(sig as i32, &sa, &mut prev) == -1 {
            // Roll back whatever we managed to install; a half-covered
            // monitor is worse than none
            restore_handlers(&saved);
            return Err(std::io::Error::last_os_error().into());
        }
        saved[idx] = Some(prev);
    }

    Ok(saved)
}

/// Restores every saved action, falling back to the default disposition for
/// any that cannot be restored.
///
/// SAFETY: syscalls
unsafe fn restore_handlers(saved: &[Option<libc::sigaction>; 6]) {
    for (slot, sig) in saved.iter().zip(ALL_SIGNALS) {
        if let Some(prev) = slot {
            if libc::sigaction(sig as i32, prev, ptr::null_mut()) == -1 {
                install_default_handler(sig as i32);
            }
        }
    }
}

/// Restores the handler for the specified signal back to the default, which
/// _should_ perform the default signal action
#[inline]
unsafe fn install_default_handler(sig: i32) {
    // Android L+ exposes signal/sigaction symbols that ignore a request to
    // set SIG_DFL, which would leave us re-entering our own handler forever;
    // go through the raw syscall there
    cfg_if::cfg_if! {
        if #[cfg(target_os = "android")] {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_sigaction = libc::SIG_DFL;
            sa.sa_flags = libc::SA_RESTART;
            libc::syscall(
                libc::SYS_rt_sigaction,
                sig,
                &sa,
                ptr::null::<libc::sigaction>(),
                mem::size_of::<libc::sigset_t>(),
            );
        } else {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// SAFETY: syscalls
unsafe fn install_all_defaults() {
    for sig in ALL_SIGNALS {
        install_default_handler(sig as i32);
    }
}

#[inline]
fn current_tid() -> u32 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: no preconditions
            unsafe { libc::syscall(libc::SYS_gettid) as u32 }
        } else {
            let mut tid = 0u64;
            // SAFETY: writes the id of the calling thread
            unsafe { libc::pthread_threadid_np(ptr::null_mut(), &mut tid) };
            tid as u32
        }
    }
}

fn wall_clock_seconds() -> u64 {
    // SAFETY: clock_gettime is async-signal-safe
    unsafe {
        let mut ts: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        ts.tv_sec as u64
    }
}

#[inline]
unsafe fn fault_address(info: *const libc::siginfo_t) -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            (*info).si_addr() as u64
        } else {
            (*info).si_addr as u64
        }
    }
}

/// This is the actual function installed for each signal we intercept,
/// invoked by the kernel
unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    // We might run inside a process where some other buggy code saves and
    // restores signal handlers temporarily with `signal` instead of
    // `sigaction`, losing the SA_SIGINFO flag and making `info`/`uc` bogus.
    // Detect that, re-install ourselves with the right flags, and return to
    // let the kernel redeliver with the correct arguments.
    {
        let mut cur_handler = mem::zeroed();
        if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
            && cur_handler.sa_sigaction == signal_handler as usize
            && cur_handler.sa_flags & libc::SA_SIGINFO == 0
        {
            libc::sigemptyset(&mut cur_handler.sa_mask);
            libc::sigaddset(&mut cur_handler.sa_mask, sig);

            cur_handler.sa_sigaction = signal_handler as usize;
            cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

            if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                // If we can't fix ourselves up, at least don't loop
                install_default_handler(sig);
            }
            return;
        }
    }

    if IN_FLIGHT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // A second fault arrived while the first is being handled. Fail safe:
        // put the defaults back and let the retrigger run the OS disposition
        // (abort, core dump).
        debug_print!("re-entrant fault, falling back to default disposition");
        install_all_defaults();
        return;
    }

    debug_print!("staging machine state");

    // SAFETY: exclusive by the guard above; never handed to another thread
    let ctx = &mut *CRASH_CONTEXT.0.get();
    ctx.reset();

    let info_ref = &*info;
    ctx.fault.signo = info_ref.si_signo;
    ctx.fault.code = info_ref.si_code;
    ctx.fault.addr = match sig {
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGTRAP => {
            fault_address(info)
        }
        _ => 0,
    };
    let fault_tid = current_tid();
    ctx.pid = std::process::id();
    ctx.fault_tid = fault_tid;
    ctx.timestamp = wall_clock_seconds();

    if let Some(record) = ctx.push_thread() {
        record.tid = fault_tid;
        record.flags |= THREAD_FAULTING | THREAD_STATE_VALID;

        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                fill_state(&*uc.cast::<ucontext_t>(), &mut record.state);
            } else {
                // On macOS the port mechanism is the first-class capture
                // path; the signal fallback approximates the interrupted
                // state with the handler's own position
                let _ = uc;
                postmortem_context::capture_current_state(&mut record.state);
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        ctx.flags |= postmortem_context::SNAPSHOT_DEGRADED_STATE;
    }

    let sink = SINK.load(Ordering::Acquire);
    if sink != 0 {
        debug_print!("entering fault sink");
        let sink: FaultSink = mem::transmute(sink);
        sink(ctx);
    }

    // The report (if any) is on disk; hand the signal on so the OS's normal
    // fatal disposition still happens
    if CHAIN.load(Ordering::Acquire) && SAVED_VALID.load(Ordering::Acquire) {
        debug_print!("restoring previous handlers");
        restore_handlers(&*SAVED_ACTIONS.0.get());
    } else {
        debug_print!("restoring default handlers");
        install_all_defaults();
    }

    if info_ref.si_code <= 0 || sig == libc::SIGABRT || sig == libc::SIGTRAP {
        // Returning only retriggers faults whose instruction re-executes.
        // kill()/raise() deliveries don't re-execute anything, and a
        // breakpoint trap on x86 leaves the pc already past the int3, so
        // those are queued again ourselves. (SIGABRT is also special cased
        // as the kernel sends it for SysRq user requests.)
        requeue(sig);
    } else {
        // A synchronous hard fault retriggers by itself when we return
    }
}

/// SAFETY: syscalls
unsafe fn requeue(sig: i32) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let tid = libc::syscall(libc::SYS_gettid);
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                // A sandbox may deny tgkill; terminating with a wrong exit
                // code beats not terminating
                libc::_exit(1);
            }
        } else {
            if libc::raise(sig) != 0 {
                libc::_exit(1);
            }
        }
    }
}
