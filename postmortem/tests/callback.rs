#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Callbacks, Config, Reporter, Signal, ThreadState};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

static SEEN_SIGNO: AtomicI32 = AtomicI32::new(0);
static SEEN_ADDR: AtomicU64 = AtomicU64::new(u64::MAX);
static SEEN_SP: AtomicU64 = AtomicU64::new(0);
static SEEN_CONTEXT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn on_crash(
    signo: i32,
    fault_addr: u64,
    state: *const ThreadState,
    context: *mut std::ffi::c_void,
) {
    SEEN_SIGNO.store(signo, Ordering::SeqCst);
    SEEN_ADDR.store(fault_addr, Ordering::SeqCst);
    if !state.is_null() {
        SEEN_SP.store((*state).stack_pointer(), Ordering::SeqCst);
    }
    SEEN_CONTEXT.store(context as usize, Ordering::SeqCst);
}

// The callback runs after the report hits the disk, with the signal info and
// captured thread state; a simulated fault drives the identical pipeline
// without killing the process.
#[test]
fn callback_runs_after_the_report_is_written() {
    let path = shared::report_path("callback");
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));
    let mut token = 0xc0ffee_u32;
    reporter.set_callbacks(Callbacks {
        version: 0,
        context: (&mut token as *mut u32).cast(),
        on_crash: Some(on_crash),
    });
    reporter.enable().unwrap();

    assert!(reporter.simulate_crash(Signal::Trap));

    assert_eq!(SEEN_SIGNO.load(Ordering::SeqCst), libc::SIGTRAP);
    assert_eq!(SEEN_ADDR.load(Ordering::SeqCst), 0);
    assert_ne!(SEEN_SP.load(Ordering::SeqCst), 0);
    assert_eq!(
        SEEN_CONTEXT.load(Ordering::SeqCst),
        (&mut token as *mut u32) as usize
    );

    // The report was published before the callback fired
    assert!(reporter.has_pending_crash_report());
    let report = reporter.load_pending_crash_report().unwrap();
    assert_eq!(report.fault.signo, libc::SIGTRAP);
    reporter.purge_pending_crash_report().unwrap();

    // The in-flight guard was handed back: a second simulated fault works
    assert!(reporter.simulate_crash(Signal::Illegal));
    assert_eq!(SEEN_SIGNO.load(Ordering::SeqCst), libc::SIGILL);
    assert!(reporter.has_pending_crash_report());
    reporter.purge_pending_crash_report().unwrap();

    reporter.disable();
}
