//! The fatal pipeline: what actually runs, inside the fault-handling
//! context, between "the monitor staged the machine state" and "the process
//! dies".
//!
//! Everything the pipeline needs beyond the [`CrashContext`] itself — the
//! resolved report paths, the capture policy, the custom data blob — is
//! staged in leaked heap cells behind atomic pointers at enable time, so the
//! handler only ever does atomic loads and raw syscalls. The swap-and-drop
//! idiom keeps updates from normal threads race-free without a lock.

use crate::{callbacks, store::RawPaths};
use postmortem_context::{capture, CrashContext, MAX_CUSTOM_DATA};
use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

pub(crate) struct FatalState {
    pub raw_paths: RawPaths,
    pub capture_all_threads: bool,
}

static FATAL_STATE: AtomicPtr<FatalState> = AtomicPtr::new(ptr::null_mut());

struct CustomBlob {
    len: usize,
    bytes: [u8; MAX_CUSTOM_DATA],
}

static CUSTOM_DATA: AtomicPtr<CustomBlob> = AtomicPtr::new(ptr::null_mut());

fn swap_in<T>(slot: &AtomicPtr<T>, value: Option<Box<T>>) {
    let fresh = value.map_or(ptr::null_mut(), Box::into_raw);
    let old = slot.swap(fresh, Ordering::AcqRel);
    // The old value is deliberately leaked, not dropped: a fault handler on
    // another thread may have loaded the pointer and still be reading
    // through it. The cells are small and replaced rarely.
    let _ = old;
}

pub(crate) fn set_fatal_state(state: FatalState) {
    swap_in(&FATAL_STATE, Some(Box::new(state)));
}

pub(crate) fn clear_fatal_state() {
    swap_in(&FATAL_STATE, None);
}

/// Stages a bounded copy of `bytes` to be embedded in every subsequent
/// report. An empty slice clears it.
pub(crate) fn set_custom_data(bytes: &[u8]) {
    if bytes.is_empty() {
        swap_in(&CUSTOM_DATA, None);
        return;
    }

    if bytes.len() > MAX_CUSTOM_DATA {
        log::warn!(
            "custom data of {} bytes exceeds the {MAX_CUSTOM_DATA} byte capacity and will be cut",
            bytes.len()
        );
    }

    let mut blob = Box::new(CustomBlob {
        len: 0,
        bytes: [0; MAX_CUSTOM_DATA],
    });
    blob.len = postmortem_context::copy_bounded(&mut blob.bytes, bytes) as usize;
    swap_in(&CUSTOM_DATA, Some(blob));
}

/// Copies the staged custom data into `ctx`. Async-signal-safe.
pub(crate) fn stage_custom_data(ctx: &mut CrashContext) {
    let blob = CUSTOM_DATA.load(Ordering::Acquire);
    if !blob.is_null() {
        // SAFETY: blobs are leaked boxes, never freed while readable
        let blob = unsafe { &*blob };
        ctx.set_custom_data(&blob.bytes[..blob.len.min(MAX_CUSTOM_DATA)]);
    }
}

/// The monitor's [`postmortem_monitor::FaultSink`]: completes the snapshot
/// the monitor started, persists it, and dispatches the post-crash callback.
///
/// Runs in the fault-handling context. Failures are swallowed — there is no
/// caller to surface them to, and the monitor will terminate the process
/// either way — but the callback is dispatched even when the write failed.
pub(crate) fn fatal_sink(ctx: &mut CrashContext) {
    let state = FATAL_STATE.load(Ordering::Acquire);
    if state.is_null() {
        return;
    }
    // SAFETY: the state is a leaked box, never freed while a fault can land
    let state = unsafe { &*state };

    if state.capture_all_threads {
        capture::fill_sibling_threads(ctx);
    }
    capture::scan_process_maps(ctx);
    stage_custom_data(ctx);

    let published = state.raw_paths.write_and_publish(ctx);
    if !published {
        postmortem_monitor::debug_print!("failed to persist the crash report");
    }

    callbacks::dispatch(ctx);
}
