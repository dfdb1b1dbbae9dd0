#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Config, Error, Reporter};

// Enabling twice — on the same reporter or a second one — must fail without
// corrupting the first handler chain: a real fault afterwards still produces
// a valid report.
#[test]
fn double_enable_fails_and_first_monitor_still_works() {
    let path = shared::report_path("double-enable");
    let _ = std::fs::remove_file(&path);

    let first = Reporter::new(Config::new(&path));
    first.enable().unwrap();

    assert!(matches!(first.enable(), Err(Error::AlreadyActive)));

    let second = Reporter::new(Config::new(shared::report_path("double-enable-other")));
    assert!(matches!(second.enable(), Err(Error::AlreadyActive)));
    assert!(!second.is_enabled());
    drop(second);

    // The first reporter is still the one wired up
    assert!(first.is_enabled());

    // SAFETY: the child only raises and dies
    let child = unsafe { libc::fork() };
    assert!(child >= 0);
    if child == 0 {
        havoc_generator::raise_segfault();
        // SAFETY: child process exit
        unsafe { libc::_exit(86) };
    }

    let mut status = 0;
    // SAFETY: waiting on our own child
    unsafe { libc::waitpid(child, &mut status, 0) };
    assert!(libc::WIFSIGNALED(status));
    assert_eq!(libc::WTERMSIG(status), libc::SIGSEGV);

    assert!(first.has_pending_crash_report());
    let report = first.load_pending_crash_report().unwrap();
    assert_eq!(report.fault.signo, libc::SIGSEGV);

    first.purge_pending_crash_report().unwrap();
    first.disable();

    // With the claim released a fresh enable works again
    first.enable().unwrap();
    first.disable();
}
