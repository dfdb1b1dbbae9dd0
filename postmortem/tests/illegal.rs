#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

#[test]
fn illegal_instruction_produces_a_pending_report() {
    let report = shared::crash_and_collect(
        "illegal",
        libc::SIGILL,
        havoc_generator::raise_illegal_instruction,
    );

    // For SIGILL the fault address is the offending instruction
    let faulting = report.faulting_thread().unwrap();
    assert_eq!(report.fault.addr, faulting.ip);
}
