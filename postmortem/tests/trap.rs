#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

#[test]
fn trap_produces_a_pending_report() {
    shared::crash_and_collect("trap", libc::SIGTRAP, havoc_generator::raise_trap);
}
