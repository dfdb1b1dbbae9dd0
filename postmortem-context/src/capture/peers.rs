//! Cooperative capture of sibling-thread register state.
//!
//! A process cannot `ptrace` its own threads, so a crashed thread cannot
//! simply read a sibling's registers the way an out-of-process dumper would.
//! Instead each sibling reports its own state: the capturing thread publishes
//! a record slot through an atomic pointer, sends the sibling a dedicated
//! realtime signal, and waits on a semaphore with a deadline. The sibling's
//! handler copies its delivered register state into the slot and posts.
//!
//! Everything on both sides is async-signal-safe: `tgkill`, `sem_post` and
//! `sem_timedwait` are all on the safe list, and the only shared state is an
//! atomic pointer and a process-local semaphore.

use crate::{ThreadRecord, THREAD_STATE_VALID};
use std::{
    cell::UnsafeCell,
    mem::{self, MaybeUninit},
    ptr,
    sync::atomic::{AtomicI32, AtomicPtr, Ordering},
};

/// Offset from `SIGRTMIN` of the capture signal. Realtime signals are a
/// process-wide resource; the offset leaves the first few free for runtimes
/// that claim them (glibc itself reserves the ones below `SIGRTMIN`).
const CAPTURE_SIGNAL_OFFSET: i32 = 4;

/// The chosen capture signal, 0 while no handler is installed.
static CAPTURE_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// The record the next signalled sibling should fill. Published with a store
/// before `tgkill`, taken by the handler with a swap so exactly one writer
/// ever touches the slot.
static PEER_SLOT: AtomicPtr<ThreadRecord> = AtomicPtr::new(ptr::null_mut());

struct Semaphore(UnsafeCell<MaybeUninit<libc::sem_t>>);

// SAFETY: the sem_* syscalls provide the synchronization
unsafe impl Sync for Semaphore {}

impl Semaphore {
    const fn new() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }

    fn get(&self) -> *mut libc::sem_t {
        self.0.get().cast()
    }
}

static PEER_SEM: Semaphore = Semaphore::new();

/// Installs the capture-signal handler and initializes the handshake
/// semaphore. Must be called (once) from a normal context before any
/// [`capture_peer`] call can succeed.
pub fn install_capture_handler() -> Result<(), std::io::Error> {
    let signo = libc::SIGRTMIN() + CAPTURE_SIGNAL_OFFSET;
    if signo > libc::SIGRTMAX() {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }

    // SAFETY: syscalls
    unsafe {
        if libc::sem_init(PEER_SEM.get(), 0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = capture_signal_handler as usize;
        // No SA_ONSTACK: the handler runs on the reporting thread's own
        // stack, which is fine for the few hundred bytes it needs
        sa.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(signo, &sa, ptr::null_mut()) == -1 {
            libc::sem_destroy(PEER_SEM.get());
            return Err(std::io::Error::last_os_error());
        }
    }

    CAPTURE_SIGNAL.store(signo, Ordering::Release);
    Ok(())
}

/// Resets the capture signal to its default disposition and tears down the
/// semaphore. No-op if nothing is installed.
pub fn restore_capture_handler() {
    let signo = CAPTURE_SIGNAL.swap(0, Ordering::AcqRel);
    if signo != 0 {
        // SAFETY: syscalls
        unsafe {
            libc::signal(signo, libc::SIG_DFL);
            libc::sem_destroy(PEER_SEM.get());
        }
    }
}

/// Asks `tid` to copy its own register state into `record`.
///
/// Returns true if the sibling responded within `deadline_ms`, in which case
/// the record carries [`THREAD_STATE_VALID`]. On timeout or send failure the
/// record holds the id only; the sibling is accounted for, not waited on
/// forever.
pub fn capture_peer(pid: u32, tid: u32, record: &mut ThreadRecord, deadline_ms: u32) -> bool {
    let signo = CAPTURE_SIGNAL.load(Ordering::Acquire);
    if signo == 0 {
        return false;
    }

    record.tid = tid;
    PEER_SLOT.store(record as *mut ThreadRecord, Ordering::Release);

    // SAFETY: syscalls
    unsafe {
        if libc::syscall(libc::SYS_tgkill, pid, tid, signo) != 0 {
            // Thread likely exited between enumeration and now
            PEER_SLOT.store(ptr::null_mut(), Ordering::Release);
            return false;
        }

        let mut deadline: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
        add_millis(&mut deadline, deadline_ms);

        loop {
            if libc::sem_timedwait(PEER_SEM.get(), &deadline) == 0 {
                return true;
            }
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            // Deadline passed. Revoke the slot; if the handler already took
            // it, it is mid-copy and will post momentarily, so grant one
            // short grace wait rather than returning with the record half
            // written.
            if PEER_SLOT.swap(ptr::null_mut(), Ordering::AcqRel).is_null() {
                let mut grace: libc::timespec = mem::zeroed();
                libc::clock_gettime(libc::CLOCK_REALTIME, &mut grace);
                add_millis(&mut grace, 10);
                return libc::sem_timedwait(PEER_SEM.get(), &grace) == 0;
            }
            return false;
        }
    }
}

fn add_millis(ts: &mut libc::timespec, ms: u32) {
    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    ts.tv_sec += libc::time_t::from(ms / 1000);
    ts.tv_nsec += libc::c_long::from(ms % 1000) * 1_000_000;
    if ts.tv_nsec >= NANOS_PER_SEC {
        ts.tv_sec += 1;
        ts.tv_nsec -= NANOS_PER_SEC;
    }
}

/// Runs on the signalled sibling. Copies the thread's own delivered register
/// state into the published slot and posts the handshake semaphore.
unsafe extern "C" fn capture_signal_handler(
    _sig: i32,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let slot = PEER_SLOT.swap(ptr::null_mut(), Ordering::AcqRel);
    if slot.is_null() {
        // Stray or revoked request
        return;
    }

    let record = &mut *slot;
    record.tid = libc::syscall(libc::SYS_gettid) as u32;
    crate::fill_state(&*uc.cast::<crate::ucontext_t>(), &mut record.state);
    record.flags |= THREAD_STATE_VALID;

    libc::sem_post(PEER_SEM.get());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MAX_REGS;

    fn blank_record() -> ThreadRecord {
        ThreadRecord {
            tid: 0,
            flags: 0,
            stack_base: 0,
            stack_limit: 0,
            state: crate::ThreadState {
                regs: [0; MAX_REGS],
                ip: 0,
                sp: 0,
                nregs: 0,
                _reserved: 0,
            },
        }
    }

    // One test body: install/restore manipulate process-wide signal state and
    // must not run concurrently with themselves
    #[test]
    fn captures_a_live_sibling() {
        install_capture_handler().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            // SAFETY: gettid has no preconditions
            let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
            tx.send(tid).unwrap();
            done_rx.recv().unwrap();
        });

        let tid = rx.recv().unwrap();
        let pid = std::process::id();

        let mut record = blank_record();
        assert!(capture_peer(pid, tid, &mut record, 1000));
        assert_eq!(record.tid, tid);
        assert_ne!(record.flags & THREAD_STATE_VALID, 0);
        assert_ne!(record.state.sp, 0);

        done_tx.send(()).unwrap();
        handle.join().unwrap();

        let mut record = blank_record();
        // A tid that cannot exist
        let start = std::time::Instant::now();
        assert!(!capture_peer(std::process::id(), u32::MAX - 1, &mut record, 100));
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(record.flags & THREAD_STATE_VALID, 0);

        restore_capture_handler();
    }
}
