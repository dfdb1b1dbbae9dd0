#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

#[test]
fn segv_produces_a_pending_report() {
    let report =
        shared::crash_and_collect("segv", libc::SIGSEGV, havoc_generator::raise_segfault);

    // A null read faults at (or very near) address zero
    assert!(report.fault.addr < 0x1000, "addr {:#x}", report.fault.addr);
    assert!(report.faulting_thread().unwrap().ip != 0);
}
