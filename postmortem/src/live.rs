//! The live report generator.
//!
//! A non-fatal snapshot path the host application calls explicitly — for
//! handled exceptions, "the OS is about to kill us" moments, or inspecting
//! another thread. It runs on a normal scheduled thread and may allocate and
//! lock, but it feeds the same capture primitives into the same encoder, so
//! a live report and a fatal report decode through one parser.
//!
//! Live reports are returned to the caller as bytes; persisting or shipping
//! them is the caller's decision, the pending store is not touched.

use crate::{errors::Error, fatal};
use postmortem_context::{
    capture, CrashContext, THREAD_FAULTING, THREAD_STATE_VALID, SNAPSHOT_LIVE,
};

/// What a live report snapshots.
#[derive(Copy, Clone, Debug)]
pub enum LiveTarget {
    /// The calling thread.
    CurrentThread,
    /// A specific thread of this process.
    ///
    /// Capturing another thread's registers uses the same cooperative
    /// handshake as the fatal path, which requires the capture handler to be
    /// installed — i.e. the reporter must be enabled. The target not
    /// responding surfaces as [`Error::InvalidThread`].
    Thread(u32),
}

/// A caller-supplied exception to record in a live report, e.g. a handled
/// panic or an error about to take the process down.
#[derive(Copy, Clone, Debug)]
pub struct AppliedException<'a> {
    pub name: &'a str,
    pub reason: &'a str,
}

/// How long to wait for a [`LiveTarget::Thread`] to report its state.
const LIVE_PEER_DEADLINE_MS: u32 = 200;

pub(crate) fn generate(
    target: LiveTarget,
    exception: Option<AppliedException<'_>>,
    capture_all_threads: bool,
) -> Result<Vec<u8>, Error> {
    let mut ctx = Box::new(CrashContext::zeroed());
    ctx.flags |= SNAPSHOT_LIVE;
    ctx.pid = std::process::id();
    ctx.timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    if let Some(exc) = exception {
        ctx.set_applied_exception(exc.name.as_bytes(), exc.reason.as_bytes());
    }

    match target {
        LiveTarget::CurrentThread => {
            let tid = current_tid();
            ctx.fault_tid = tid;
            let record = ctx.push_thread().expect("fresh context");
            record.tid = tid;
            record.flags |= THREAD_FAULTING;
            if postmortem_context::capture_current_state(&mut record.state) {
                record.flags |= THREAD_STATE_VALID;
            }
        }
        LiveTarget::Thread(tid) => {
            ctx.fault_tid = tid;
            let pid = ctx.pid;
            let record = ctx.push_thread().expect("fresh context");
            record.flags |= THREAD_FAULTING;
            if !capture::capture_peer(pid, tid, record, LIVE_PEER_DEADLINE_MS) {
                return Err(Error::InvalidThread);
            }
        }
    }

    if capture_all_threads {
        capture::fill_sibling_threads(&mut ctx);
    }
    capture::scan_process_maps(&mut ctx);
    fatal::stage_custom_data(&mut ctx);

    let mut bytes = Vec::new();
    crate::encode::encode_report(&ctx, &mut bytes)?;
    log::debug!(
        "generated live report: {} bytes, {} thread(s), {} image(s)",
        bytes.len(),
        ctx.thread_count,
        ctx.image_count
    );
    Ok(bytes)
}

fn current_tid() -> u32 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: no preconditions
            unsafe { libc::syscall(libc::SYS_gettid) as u32 }
        } else {
            let mut tid = 0u64;
            // SAFETY: writes the id of the calling thread
            unsafe { libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid) };
            tid as u32
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse_report;

    #[test]
    fn live_report_for_current_thread_parses() {
        let bytes = generate(LiveTarget::CurrentThread, None, false).unwrap();
        let report = parse_report(&bytes).unwrap();

        assert!(report.is_live());
        assert_eq!(report.pid, std::process::id());
        assert_eq!(report.fault.signo, 0);

        let thread = report.faulting_thread().unwrap();
        assert!(thread.is_faulting());
        assert_eq!(thread.tid, report.fault_tid);
        assert!(thread.state_valid());
        assert_ne!(thread.sp, 0);

        assert!(!report.images.is_empty());
    }

    #[test]
    fn live_report_records_applied_exception() {
        let exc = AppliedException {
            name: "HandledError",
            reason: "synthetic reason for the test",
        };
        let bytes = generate(LiveTarget::CurrentThread, Some(exc), false).unwrap();
        let report = parse_report(&bytes).unwrap();

        let applied = report.fault.applied.unwrap();
        assert_eq!(applied.name, "HandledError");
        assert_eq!(applied.reason, "synthetic reason for the test");
    }

    #[test]
    fn unknown_thread_target_errors() {
        // Without the capture handler installed the handshake cannot work
        assert!(matches!(
            generate(LiveTarget::Thread(u32::MAX - 1), None, false),
            Err(Error::InvalidThread)
        ));
    }
}
