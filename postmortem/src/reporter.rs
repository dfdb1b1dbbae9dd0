use crate::{
    callbacks::{self, Callbacks},
    config::Config,
    errors::Error,
    fatal::{self, FatalState},
    format::Report,
    live::{self, AppliedException, LiveTarget},
    store::PendingStore,
};
use postmortem_monitor::{Monitor, MonitorOptions, Registry, Signal};
use std::path::Path;

/// The crash reporter.
///
/// One instance owns one [`Config`] and the pending slot it points at.
/// Enabling installs fault interception; from then until `disable` (or
/// process death), the first fatal fault produces exactly one pending report
/// at [`Reporter::crash_report_path`], which the next launch inspects with
/// [`Reporter::has_pending_crash_report`] /
/// [`Reporter::load_pending_crash_report_data`] and acknowledges with
/// [`Reporter::purge_pending_crash_report`].
pub struct Reporter {
    config: Config,
    store: PendingStore,
    monitor: parking_lot::Mutex<Option<Monitor>>,
}

impl Reporter {
    pub fn new(config: Config) -> Self {
        let store = PendingStore::new(config.report_path.clone());
        Self {
            config,
            store,
            monitor: parking_lot::Mutex::new(None),
        }
    }

    /// Installs fault interception per the configuration.
    ///
    /// Fails with [`Error::AlreadyActive`] if this reporter (or any other
    /// monitor in the process) is already enabled; the first handler chain is
    /// left untouched in that case. A failed enable leaves the prior OS
    /// crash behavior in effect.
    pub fn enable(&self) -> Result<(), Error> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Err(Error::AlreadyActive);
        }

        // Resolve everything the fatal path will need while failure is still
        // an option
        let raw_paths = self.store.raw_paths()?;
        fatal::set_fatal_state(FatalState {
            raw_paths,
            capture_all_threads: self.config.capture_all_threads,
        });

        let options = MonitorOptions {
            mechanism: self.config.mechanism,
            signals: self.config.signals.clone(),
            chain_previous: self.config.chain_previous,
        };

        match Monitor::attach(options, fatal::fatal_sink, Registry::process()) {
            Ok(attached) => {
                log::info!(
                    "crash reporter enabled ({:?}), report path {}",
                    self.config.mechanism,
                    self.store.path().display()
                );
                *monitor = Some(attached);
                Ok(())
            }
            Err(err) => {
                fatal::clear_fatal_state();
                log::warn!("failed to enable crash reporter: {err}");
                Err(err.into())
            }
        }
    }

    /// Uninstalls fault interception, restoring the previous handlers.
    /// No-op if not enabled.
    pub fn disable(&self) {
        let mut monitor = self.monitor.lock();
        if let Some(attached) = monitor.take() {
            attached.detach();
            fatal::clear_fatal_state();
            log::info!("crash reporter disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// True if a crash report from a previous (or this) run is waiting at
    /// the report path.
    pub fn has_pending_crash_report(&self) -> bool {
        self.store.has_pending()
    }

    /// Loads the pending report's raw bytes.
    pub fn load_pending_crash_report_data(&self) -> Result<Vec<u8>, Error> {
        self.store.load()
    }

    /// Loads and parses the pending report.
    pub fn load_pending_crash_report(&self) -> Result<Report, Error> {
        Ok(crate::parse_report(&self.store.load()?)?)
    }

    /// Removes the pending report; subsequent loads fail with
    /// [`Error::NotFound`] until the next crash.
    pub fn purge_pending_crash_report(&self) -> Result<(), Error> {
        self.store.purge()
    }

    /// Snapshots current state into report bytes without any fault, on the
    /// caller's thread (or `target`'s). See [`LiveTarget`]; the pending
    /// store is not written.
    pub fn generate_live_report(
        &self,
        target: LiveTarget,
        exception: Option<AppliedException<'_>>,
    ) -> Result<Vec<u8>, Error> {
        live::generate(target, exception, self.config.capture_all_threads)
    }

    /// Registers the post-crash [`Callbacks`]; replaces any previous set.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        callbacks::set(callbacks);
    }

    /// The path the next crash report will be written to. The file may not
    /// yet, or ever, exist.
    pub fn crash_report_path(&self) -> &Path {
        self.store.path()
    }

    /// Stages an opaque blob to be embedded verbatim in every subsequently
    /// generated report, fatal or live. Bounded by
    /// [`postmortem_context::MAX_CUSTOM_DATA`]; an empty slice clears it.
    pub fn set_custom_data(&self, bytes: &[u8]) {
        fatal::set_custom_data(bytes);
    }

    /// Runs the full fatal pipeline for a synthesized fault without dying:
    /// the report is captured, written and published, and the post-crash
    /// callback dispatched, but no handlers are restored and nothing is
    /// re-raised. Returns false if not enabled.
    pub fn simulate_crash(&self, signal: Signal) -> bool {
        let monitor = self.monitor.lock();
        monitor
            .as_ref()
            .map_or(false, |attached| attached.simulate_fault(signal))
    }

    /// Captures uncaught panics as crash reports: on panic, a live-format
    /// report carrying the panic message and location is written and
    /// published to the pending slot, then the previous panic hook runs.
    ///
    /// Panics unwind on a healthy runtime, so this path may allocate; it
    /// does not require the reporter to be enabled.
    pub fn install_panic_hook(&self) {
        let store = self.store_clone();
        let capture_all = self.config.capture_all_threads;
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info);
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "unknown".to_owned());

            let reason = format!("{message} at {location}");
            let exception = AppliedException {
                name: "panic",
                reason: &reason,
            };

            match live::generate(LiveTarget::CurrentThread, Some(exception), capture_all) {
                Ok(bytes) => {
                    if let Err(err) = std::fs::write(store.tmp_path(), &bytes)
                        .map_err(Error::from)
                        .and_then(|()| store.publish())
                    {
                        log::error!("failed to persist panic report: {err}");
                    }
                }
                Err(err) => log::error!("failed to capture panic report: {err}"),
            }

            previous(info);
        }));
    }

    fn store_clone(&self) -> PendingStore {
        self.store.clone()
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.disable();
    }
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
