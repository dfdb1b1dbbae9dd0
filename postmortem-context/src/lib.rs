//! Fixed-capacity crash snapshot types, and the capture primitives used to
//! fill them while the process is in a faulted state.
//!
//! Everything in this crate that is reachable from a fault handler obeys the
//! same rules: no heap allocation, no locks, no buffered I/O, fixed-size
//! buffers with explicit lengths. Enumerations that would exceed a buffer
//! truncate and record a flag instead of growing.
//!
//! The [`CrashContext`] defined here is deliberately large (tens of KiB); it
//! is intended to live in static storage claimed by whoever is handling the
//! crash, never on a signal stack.

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

mod snapshot;

pub use snapshot::*;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        pub use linux::*;
    } else if #[cfg(target_os = "macos")] {
        mod mac;
        pub use mac::*;
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
pub mod capture;
