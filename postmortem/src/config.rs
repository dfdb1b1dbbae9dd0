use postmortem_monitor::{Mechanism, Signal, ALL_SIGNALS};
use std::path::PathBuf;

/// Immutable reporter configuration, supplied at construction and owned by
/// the [`crate::Reporter`] for its lifetime.
#[derive(Clone, Debug)]
pub struct Config {
    /// How faults are intercepted.
    pub mechanism: Mechanism,
    /// Which signals to intercept (signal mechanism; the port mechanism's
    /// exception mask is fixed, this only controls its `SIGABRT` hook).
    pub signals: Vec<Signal>,
    /// Capture every live thread, or only the faulting one.
    pub capture_all_threads: bool,
    /// Where the pending report lives. The enclosing directory must exist;
    /// the file need not.
    pub report_path: PathBuf,
    /// Forward re-raised signals to whatever handler was installed before
    /// `enable`, instead of resetting to the OS default. For coexisting with
    /// another crash reporter that was installed first.
    pub chain_previous: bool,
}

impl Config {
    /// A configuration with the default mechanism and full capture.
    pub fn new(report_path: impl Into<PathBuf>) -> Self {
        Self {
            mechanism: Mechanism::Signal,
            signals: ALL_SIGNALS.to_vec(),
            capture_all_threads: true,
            report_path: report_path.into(),
            chain_previous: false,
        }
    }
}
