#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

#[test]
fn abort_produces_a_pending_report() {
    shared::crash_and_collect("abort", libc::SIGABRT, || havoc_generator::raise_abort());
}
