#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use postmortem::{Config, Error, FormatError, LiveTarget, Reporter};

// A corrupted pending report is rejected with a typed format error, never a
// crash or a silent misparse.
#[test]
fn corrupted_pending_report_is_rejected() {
    let path = shared::report_path("corrupt");
    let _ = std::fs::remove_file(&path);

    let reporter = Reporter::new(Config::new(&path));

    // Manufacture a valid pending report from the live path
    let bytes = reporter
        .generate_live_report(LiveTarget::CurrentThread, None)
        .unwrap();
    std::fs::write(&path, &bytes).unwrap();
    assert!(reporter.has_pending_crash_report());
    reporter.load_pending_crash_report().unwrap();

    // Flip the version field (offset 6: magic, then endian marker)
    let mut corrupted = bytes.clone();
    corrupted[6] ^= 0xff;
    std::fs::write(&path, &corrupted).unwrap();

    match reporter.load_pending_crash_report() {
        Err(Error::Format(FormatError::UnknownVersion { .. })) => {}
        other => panic!("expected UnknownVersion, got {other:?}"),
    }

    // Truncation mid-record is also caught
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    match reporter.load_pending_crash_report() {
        Err(Error::Format(FormatError::Truncated)) => {}
        other => panic!("expected Truncated, got {other:?}"),
    }

    reporter.purge_pending_crash_report().unwrap();
}
