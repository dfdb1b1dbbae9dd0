//! State capture primitives.
//!
//! Every function in this module (and its platform submodules) is intended to
//! be callable while the process is in a faulted state: no allocation, no
//! locks, raw syscalls only, bounded buffers. The live report path reuses the
//! same primitives; they are merely *also* safe in a normal context.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod maps;
        mod peers;
        mod tasks;

        pub use maps::scan_process_maps;
        pub use peers::{capture_peer, install_capture_handler, restore_capture_handler};
        pub use tasks::thread_ids;

        use crate::{CrashContext, MAX_THREADS, SNAPSHOT_THREADS_TRUNCATED};

        /// How long the crashed thread waits for any single sibling to report
        /// its own register state before accounting for it as unresponsive.
        const PEER_DEADLINE_MS: u32 = 50;

        /// Records every sibling of the faulting thread into `ctx.threads[1..]`,
        /// asking each one to capture its own register state.
        ///
        /// Threads that do not respond within the deadline are recorded by id
        /// only, without [`crate::THREAD_STATE_VALID`]. The enumeration and
        /// the record list are both bounded; exceeding either sets the
        /// truncation flag.
        pub fn fill_sibling_threads(ctx: &mut CrashContext) {
            // Slightly larger than the record capacity so running into the
            // enumeration bound implies the record list also overflowed
            let mut tids = [0u32; MAX_THREADS + 8];
            let (count, truncated) = thread_ids(&mut tids);
            if truncated {
                ctx.flags |= SNAPSHOT_THREADS_TRUNCATED;
            }

            let pid = ctx.pid;
            let fault_tid = ctx.fault_tid;
            for &tid in &tids[..count] {
                if tid == fault_tid {
                    continue;
                }
                let Some(record) = ctx.push_thread() else {
                    break;
                };
                record.tid = tid;
                capture_peer(pid, tid, record, PEER_DEADLINE_MS);
            }
        }
    } else if #[cfg(target_os = "macos")] {
        mod mac;

        pub use mac::{fill_sibling_threads, scan_process_maps, thread_ids};

        /// The signal-handshake machinery is Linux-only; sibling state on
        /// macOS comes from `thread_get_state` while the task is suspended.
        pub fn install_capture_handler() -> Result<(), std::io::Error> {
            Ok(())
        }

        pub fn restore_capture_handler() {}

        /// Reads `tid`'s (a Mach thread port's) register state directly; no
        /// handshake needed on this platform.
        pub fn capture_peer(
            _pid: u32,
            tid: u32,
            record: &mut crate::ThreadRecord,
            _deadline_ms: u32,
        ) -> bool {
            record.tid = tid;
            if crate::fill_state_for_thread(tid, &mut record.state) {
                record.flags |= crate::THREAD_STATE_VALID;
                true
            } else {
                false
            }
        }
    }
}
