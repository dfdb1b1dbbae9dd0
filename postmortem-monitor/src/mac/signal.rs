//! macOS doesn't have an exception for process aborts, so we hook `SIGABRT`
//! and forward it into the watcher's message loop.
use std::mem;

/// Installs our `SIGABRT` handler, returning the previously registered
/// action so it can be restored on detach.
///
/// SAFETY: syscall
pub(crate) unsafe fn install_abort_handler() -> Result<libc::sigaction, std::io::Error> {
    let mut sa: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut sa.sa_mask);
    libc::sigaddset(&mut sa.sa_mask, libc::SIGABRT);
    sa.sa_sigaction = signal_handler as usize;
    sa.sa_flags = libc::SA_SIGINFO;

    let mut old_action = mem::MaybeUninit::uninit();

    if libc::sigaction(libc::SIGABRT, &sa, old_action.as_mut_ptr()) != -1 {
        Ok(old_action.assume_init())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Restores the action for `SIGABRT` to the specified handler
///
/// SAFETY: syscall
#[inline]
pub(crate) unsafe fn restore_abort_handler(action: libc::sigaction) {
    libc::sigaction(libc::SIGABRT, &action, std::ptr::null_mut());
}

unsafe extern "C" fn signal_handler(
    signal: i32,
    _info: *mut libc::siginfo_t,
    _uc: *mut std::ffi::c_void,
) {
    use super::ffi;

    // The watcher stages the context, writes the report, and detaches,
    // restoring the previous SIGABRT action
    super::report_synthesized(
        ffi::et::EXC_SOFTWARE as u32,
        ffi::EXC_SOFT_SIGNAL,
        Some(signal as u64),
    );

    // Wait for the detach, then return; abort re-raises and the process
    // dies through whatever action the detach restored
    while super::is_attached() {
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 10_000_000,
        };
        libc::nanosleep(&ts, std::ptr::null_mut());
    }
}
