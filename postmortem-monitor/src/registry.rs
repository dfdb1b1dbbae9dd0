use std::sync::atomic::{AtomicBool, Ordering};

/// A process-scoped claim on the "active fault monitor" slot.
///
/// Fault interception is inherently process-global state (there is one signal
/// table, one set of task exception ports); the registry makes that global an
/// explicit object with atomic claim semantics instead of an implied ambient
/// one. [`crate::Monitor::attach`] takes the claim with a compare-and-swap
/// and releases it on detach, so a second attach can never silently overwrite
/// the first handler chain.
pub struct Registry {
    active: AtomicBool,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// The default, process-wide instance.
    pub fn process() -> &'static Registry {
        static PROCESS: Registry = Registry::new();
        &PROCESS
    }

    /// True if a monitor currently holds the claim.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::Registry;

    #[test]
    fn claim_is_exclusive() {
        let registry = Registry::new();
        assert!(!registry.is_active());
        assert!(registry.claim());
        assert!(registry.is_active());
        assert!(!registry.claim());

        registry.release();
        assert!(!registry.is_active());
        assert!(registry.claim());
    }
}
