#![cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))]

mod shared;

#[test]
fn fpe_produces_a_pending_report() {
    shared::crash_and_collect(
        "fpe",
        libc::SIGFPE,
        havoc_generator::raise_floating_point_exception,
    );
}
