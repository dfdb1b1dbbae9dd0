#![cfg(target_os = "linux")]

mod shared;

#[test]
fn bus_produces_a_pending_report() {
    let backing = std::env::temp_dir().join(format!("postmortem-bus-{}", std::process::id()));
    let backing_str = backing.to_str().unwrap().to_owned();

    shared::crash_and_collect("bus", libc::SIGBUS, move || {
        havoc_generator::raise_bus(&backing_str);
    });

    let _ = std::fs::remove_file(backing);
}
