//! Fault interception for the crash reporting pipeline.
//!
//! A [`Monitor`] claims the process's fault-handling slot, installs one of
//! two interception mechanisms, and on the first fault stages the machine
//! state of the faulting thread into a static [`CrashContext`] before handing
//! it to a registered [`FaultSink`]:
//!
//! - [`Mechanism::Signal`] installs POSIX handlers (with an alternate stack)
//!   for the six fatal signals: `SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL`,
//!   `SIGSEGV`, `SIGTRAP`.
//! - [`Mechanism::ExceptionPort`] (macOS only) swaps the task's Mach
//!   exception ports and services exception messages on a dedicated watcher
//!   thread; `SIGABRT` is still covered by a signal handler as it has no Mach
//!   equivalent.
//!
//! The fatal path is deliberately flat: an atomic in-flight guard, a fixed
//! fill of the context buffer, one call through a plain function pointer, a
//! handler restore, and a re-raise. No allocation, no locks, no dynamic
//! dispatch. A second fault while the first is being handled loses the guard
//! and falls straight through to the OS default disposition.
//!
//! The sink runs in a compromised context and must obey the same rules; see
//! the [`FaultSink`] documentation.

#![allow(unsafe_code)]

mod error;
mod registry;

pub use error::Error;
pub use registry::Registry;

use postmortem_context::CrashContext;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        $crate::write_stderr(concat!($s, "\n"));
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// The function a [`Monitor`] hands a staged crash to.
///
/// A plain function pointer, not a trait object: the fault path stays a flat
/// call with nothing a corrupted heap could have scribbled over.
///
/// # Safety contract (documented, not enforced)
///
/// The sink runs inside a signal handler (or on the exception watcher thread
/// while the rest of the task is suspended). It must not allocate, take
/// locks, or call into any non-reentrant service. The context it receives is
/// the monitor's static buffer; it is exclusively owned by the sink for the
/// duration of the call.
pub type FaultSink = fn(&mut CrashContext);

/// How faults are intercepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mechanism {
    /// POSIX signal handlers.
    Signal,
    /// A dedicated thread servicing the task's Mach exception ports.
    /// Only available on macOS; selecting it elsewhere fails `attach` with
    /// [`Error::UnsupportedMechanism`].
    ExceptionPort,
}

/// The signals that we support catching and raising
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

/// Every signal the monitor knows how to intercept, in the order the
/// saved-handler table uses.
pub const ALL_SIGNALS: [Signal; 6] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// Attach-time configuration.
#[derive(Clone, Debug)]
pub struct MonitorOptions {
    pub mechanism: Mechanism,
    /// Which signals to intercept (signal mechanism only; the port mechanism
    /// has its own fixed exception mask).
    pub signals: Vec<Signal>,
    /// After the pipeline runs, restore the *previously* installed handlers
    /// instead of the OS defaults, so an earlier crash reporter sees the
    /// re-raised signal. Off by default: the monitor is the terminal handler.
    pub chain_previous: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            mechanism: Mechanism::Signal,
            signals: ALL_SIGNALS.to_vec(),
            chain_previous: false,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))] {
        mod posix;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;
    }
}

enum Inner {
    Signal,
    #[cfg(target_os = "macos")]
    Port,
}

/// An attached fault monitor.
///
/// Detaches (restoring the previous handlers or ports) when dropped or via
/// [`Monitor::detach`]. At most one monitor can hold a given [`Registry`]
/// claim at a time.
pub struct Monitor {
    registry: &'static Registry,
    inner: Inner,
}

impl Monitor {
    /// Installs fault interception per `options`, routing staged crashes to
    /// `sink`.
    ///
    /// The claim on `registry` is what makes the monitor process-unique;
    /// callers that don't need several isolated registries (i.e. everyone)
    /// pass [`Registry::process()`].
    pub fn attach(
        options: MonitorOptions,
        sink: FaultSink,
        registry: &'static Registry,
    ) -> Result<Self, Error> {
        if !registry.claim() {
            return Err(Error::AlreadyAttached);
        }

        let attached = match options.mechanism {
            Mechanism::Signal => posix::attach(&options, sink).map(|()| Inner::Signal),
            #[cfg(target_os = "macos")]
            Mechanism::ExceptionPort => mac::attach(&options, sink).map(|()| Inner::Port),
            #[cfg(not(target_os = "macos"))]
            Mechanism::ExceptionPort => Err(Error::UnsupportedMechanism),
        };

        match attached {
            Ok(inner) => Ok(Self { registry, inner }),
            Err(err) => {
                registry.release();
                Err(err)
            }
        }
    }

    /// Detaches the monitor, restoring whatever was installed before it.
    ///
    /// This is done automatically when the [`Monitor`] is dropped.
    #[inline]
    pub fn detach(self) {
        drop(self);
    }

    /// Runs the full capture pipeline for a synthesized, non-fatal fault on
    /// the calling thread: same sink, same context buffer, but no handler
    /// restore and no re-raise, and the in-flight guard is released
    /// afterwards so a real fault can still be handled.
    pub fn simulate_fault(&self, signal: Signal) -> bool {
        match self.inner {
            Inner::Signal => posix::simulate(signal),
            #[cfg(target_os = "macos")]
            Inner::Port => mac::simulate(signal),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        match self.inner {
            Inner::Signal => posix::detach(),
            #[cfg(target_os = "macos")]
            Inner::Port => mac::detach(false),
        }
        self.registry.release();
    }
}
