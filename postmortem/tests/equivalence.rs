#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Config, LiveTarget, Reporter, Signal};

// A report written by the fatal path and one from the live generator for the
// same process state decode to equivalent structured data through the one
// parser.
#[test]
fn fatal_and_live_reports_decode_equivalently() {
    let path = shared::report_path("equivalence");
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));
    reporter.set_custom_data(shared::CUSTOM_DATA);
    reporter.enable().unwrap();

    assert!(reporter.simulate_crash(Signal::Segv));
    let fatal = reporter.load_pending_crash_report().unwrap();
    reporter.purge_pending_crash_report().unwrap();

    let live_bytes = reporter
        .generate_live_report(LiveTarget::CurrentThread, None)
        .unwrap();
    let live = postmortem::parse_report(&live_bytes).unwrap();
    reporter.disable();

    // Same process, same snapshot shape; only the origin flag differs
    assert!(!fatal.is_live());
    assert!(live.is_live());
    assert_eq!(fatal.pid, live.pid);
    assert_eq!(fatal.arch, live.arch);
    assert_eq!(fatal.custom, live.custom);

    for report in [&fatal, &live] {
        let faulting = report.faulting_thread().unwrap();
        assert!(faulting.is_faulting());
        assert!(faulting.state_valid());
        assert_ne!(faulting.sp, 0);
    }

    // Both scans saw the same loaded objects
    let fatal_paths: Vec<_> = fatal.images.iter().map(|img| img.path.clone()).collect();
    let live_paths: Vec<_> = live.images.iter().map(|img| img.path.clone()).collect();
    assert_eq!(fatal_paths, live_paths);
}
