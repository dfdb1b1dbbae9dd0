#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Config, Reporter};

// An uncaught panic is a language-level crash: the hook persists a
// live-format report with the panic message before the default hook runs.
#[test]
fn panic_is_captured_as_a_pending_report() {
    let path = shared::report_path("panic-hook");
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));
    reporter.set_custom_data(shared::CUSTOM_DATA);
    reporter.install_panic_hook();

    // The hook fires for every panic, including one we contain
    let result = std::panic::catch_unwind(|| {
        panic!("the widget count went negative");
    });
    assert!(result.is_err());

    assert!(reporter.has_pending_crash_report());
    let report = reporter.load_pending_crash_report().unwrap();

    assert!(report.is_live());
    assert_eq!(report.pid, std::process::id());
    assert_eq!(report.custom, shared::CUSTOM_DATA);

    let applied = report.fault.applied.expect("panic info missing");
    assert_eq!(applied.name, "panic");
    assert!(
        applied.reason.contains("widget count went negative"),
        "reason: {}",
        applied.reason
    );
    assert!(applied.reason.contains("panic_hook.rs"));

    reporter.purge_pending_crash_report().unwrap();
}
