#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Config, LiveTarget, Reporter, MAX_THREADS};
use std::sync::{Arc, Barrier};

// More live threads than the snapshot can hold: the capture truncates at the
// record capacity and flags it, instead of growing or failing.
#[test]
fn thread_capture_truncates_at_the_bound() {
    let path = shared::report_path("truncation");
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));
    reporter.enable().unwrap();

    let spawn_count = MAX_THREADS + 8;
    let barrier = Arc::new(Barrier::new(spawn_count + 1));
    let handles: Vec<_> = (0..spawn_count)
        .map(|_| {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
            })
        })
        .collect();

    let bytes = reporter
        .generate_live_report(LiveTarget::CurrentThread, None)
        .unwrap();
    let report = postmortem::parse_report(&bytes).unwrap();

    barrier.wait();
    for handle in handles {
        handle.join().unwrap();
    }
    reporter.disable();

    assert!(report.threads_truncated());
    assert_eq!(report.threads.len(), MAX_THREADS);
    assert!(report.faulting_thread().unwrap().is_faulting());
}
