#![allow(dead_code)] // each test file uses the subset of helpers it needs

//! Fork-based crash harness shared by the integration tests.
//!
//! Each test enables the reporter, forks, and lets the child die by the
//! re-raise path; the parent then plays the "next launch": it finds the
//! pending report at the shared path, loads and parses it, and checks the
//! basics before handing it to the test for scenario-specific asserts.

use postmortem::{Config, Report, Reporter};
use std::path::PathBuf;

pub const CUSTOM_DATA: &[u8] = b"build=abc123;session=42";

pub fn report_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("postmortem-test-{}-{name}.bin", std::process::id()))
}

/// Enables a reporter, raises `raiser` in a forked child, and returns the
/// report the child left behind along with its pid.
pub fn crash_and_collect(name: &str, expected_signal: i32, raiser: impl FnOnce()) -> Report {
    let path = report_path(name);
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));
    reporter.set_custom_data(CUSTOM_DATA);
    reporter.enable().expect("failed to enable the reporter");

    // SAFETY: the child runs only the raiser and the reporter's own
    // async-signal-safe fatal path before dying
    let child = unsafe { libc::fork() };
    assert!(child >= 0, "fork failed");

    if child == 0 {
        raiser();
        // The raiser is supposed to never return
        // SAFETY: child process exit
        unsafe { libc::_exit(86) };
    }

    let mut status = 0;
    // SAFETY: waiting on our own child
    let waited = unsafe { libc::waitpid(child, &mut status, 0) };
    assert_eq!(waited, child);
    reporter.disable();

    assert!(
        libc::WIFSIGNALED(status),
        "child did not die from a signal, status {status:#x}"
    );
    assert_eq!(
        libc::WTERMSIG(status),
        expected_signal,
        "child died from the wrong signal"
    );

    assert!(
        reporter.has_pending_crash_report(),
        "the crash left no pending report"
    );
    let data = reporter
        .load_pending_crash_report_data()
        .expect("pending report did not load");
    let report = postmortem::parse_report(&data).expect("pending report did not parse");

    // The invariants every fatal report upholds
    assert_eq!(report.fault.signo, expected_signal);
    assert_eq!(report.pid, child as u32);
    assert!(!report.is_live());
    assert_eq!(report.custom, CUSTOM_DATA);

    let faulting = report.faulting_thread().expect("no thread records");
    assert!(faulting.is_faulting());
    assert!(faulting.state_valid());
    assert_ne!(faulting.sp, 0);
    assert_eq!(faulting.tid, report.fault_tid);

    assert!(!report.images.is_empty(), "no loaded images captured");

    // Consume it: the slot must read empty afterwards
    reporter.purge_pending_crash_report().unwrap();
    assert!(!reporter.has_pending_crash_report());
    assert!(matches!(
        reporter.load_pending_crash_report_data(),
        Err(postmortem::Error::NotFound)
    ));

    report
}
