//! In-process crash reporting: capture a faulted process's state and persist
//! a structured report that survives termination, so the crash can be
//! inspected post-mortem without a debugger attached.
//!
//! # The pipeline
//!
//! [`Reporter::enable`] installs fault interception (POSIX signal handlers,
//! or a Mach exception-port watcher on macOS — see
//! [`postmortem_monitor::Mechanism`]). When a fatal fault lands:
//!
//! 1. the monitor wins an atomic in-flight guard and stages the faulting
//!    thread's registers and the fault cause into a static
//!    [`CrashContext`](postmortem_context::CrashContext);
//! 2. the fatal sink completes the snapshot — sibling threads, loaded
//!    images, stack bounds, custom data — using only async-signal-safe
//!    primitives;
//! 3. the encoder streams the versioned binary report to a temp file with
//!    bare `write(2)` calls and atomically renames it into the pending slot;
//! 4. the registered post-crash [`Callbacks`] run (after the write, so a
//!    misbehaving callback cannot lose the report);
//! 5. handlers are restored and the signal re-raised, so the OS's normal
//!    fatal disposition (core dump, parent notification) still happens.
//!
//! Nothing on that path allocates, locks, or calls a non-reentrant service:
//! the process is already in an undefined state, and there is exactly one
//! chance to get the report out.
//!
//! On the next launch:
//!
//! ```no_run
//! use postmortem::{Config, Reporter};
//!
//! let reporter = Reporter::new(Config::new("/var/tmp/myapp.crash"));
//! if reporter.has_pending_crash_report() {
//!     let report = reporter.load_pending_crash_report()?;
//!     eprintln!(
//!         "previous run died with signal {} at {:#x}",
//!         report.fault.signo, report.fault.addr
//!     );
//!     reporter.purge_pending_crash_report()?;
//! }
//! reporter.enable()?;
//! # Ok::<(), postmortem::Error>(())
//! ```
//!
//! # Live reports
//!
//! [`Reporter::generate_live_report`] snapshots current state on demand from
//! a normal thread, in the identical format (one parser downstream), without
//! touching the pending slot. [`Reporter::install_panic_hook`] uses the same
//! path to persist uncaught panics.
//!
//! # What this crate does not do
//!
//! No symbolication, no human-readable rendering, no upload — a report is an
//! opaque blob for offline tooling. And no resuming: after a fatal fault the
//! process dies the way the OS intended.

#![allow(unsafe_code)]

mod callbacks;
mod config;
mod encode;
mod errors;
mod fatal;
mod format;
mod live;
mod parse;
mod reporter;
mod store;

pub use callbacks::{Callbacks, PostCrashCallback};
pub use config::Config;
pub use encode::{encode_report, FdSink, ReportSink};
pub use errors::{EncodeError, Error};
pub use format::{
    arch, AppliedExceptionInfo, Fault, FormatError, Image, MachException, Report, Thread,
    FORMAT_VERSION,
};
pub use live::{AppliedException, LiveTarget};
pub use parse::parse_report;
pub use reporter::Reporter;
pub use store::PendingStore;

// The pieces callers need to configure interception or interpret snapshots
pub use postmortem_context::{
    CrashContext, ThreadState, MAX_CUSTOM_DATA, MAX_IMAGES, MAX_THREADS,
};
pub use postmortem_monitor::{Mechanism, Registry, Signal, ALL_SIGNALS};
