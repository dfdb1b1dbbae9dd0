#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

// A stack overflow lands as SIGSEGV on the guard page; handling it at all
// proves the alternate signal stack is in place
#[test]
fn stack_overflow_produces_a_pending_report() {
    let report = shared::crash_and_collect(
        "stack-overflow",
        libc::SIGSEGV,
        havoc_generator::raise_stack_overflow,
    );

    // The faulting address is in the dead zone just below the stack mapping
    let faulting = report.faulting_thread().unwrap();
    if faulting.stack_limit != 0 {
        assert!(report.fault.addr < faulting.stack_limit + 0x1000);
    }
}
