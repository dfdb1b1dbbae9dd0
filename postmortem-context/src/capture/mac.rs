//! macOS capture primitives: thread enumeration via `task_threads`, image
//! enumeration via the dyld APIs.

use crate::{copy_bounded, CrashContext, THREAD_STATE_VALID};
use mach2::{kern_return::KERN_SUCCESS, traps::mach_task_self};

/// Fills `out` with the Mach thread ports of every thread in the task.
pub fn thread_ids(out: &mut [u32]) -> (usize, bool) {
    let mut list: mach2::mach_types::thread_act_array_t = std::ptr::null_mut();
    let mut count = 0u32;

    // SAFETY: syscall; the kernel allocates the list in our address space
    unsafe {
        if mach2::task::task_threads(mach_task_self(), &mut list, &mut count) != KERN_SUCCESS {
            return (0, false);
        }

        let threads = std::slice::from_raw_parts(list, count as usize);
        let n = threads.len().min(out.len());
        for (dst, src) in out[..n].iter_mut().zip(threads) {
            *dst = *src;
        }

        // The kernel vm_allocates the array; hand it back
        mach2::vm::mach_vm_deallocate(
            mach_task_self(),
            list as mach2::vm_types::mach_vm_address_t,
            (count as usize * std::mem::size_of::<u32>()) as u64,
        );

        (n, threads.len() > out.len())
    }
}

/// Records every sibling of the faulting thread, reading each one's register
/// state directly. The caller (the exception-port watcher) has already
/// suspended the task's other threads, so the reads don't race the owners.
pub fn fill_sibling_threads(ctx: &mut CrashContext) {
    let mut ports = [0u32; crate::MAX_THREADS + 8];
    let (count, truncated) = thread_ids(&mut ports);
    if truncated {
        ctx.flags |= crate::SNAPSHOT_THREADS_TRUNCATED;
    }

    let fault_tid = ctx.fault_tid;
    for &port in &ports[..count] {
        if port == fault_tid {
            continue;
        }
        let Some(record) = ctx.push_thread() else {
            break;
        };
        record.tid = port;
        if crate::fill_state_for_thread(port, &mut record.state) {
            record.flags |= THREAD_STATE_VALID;
        }
    }
}

// dyld image enumeration, `<mach-o/dyld.h>`
extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const u8;
    fn _dyld_get_image_name(index: u32) -> *const std::os::raw::c_char;
}

/// Records the loaded images reported by dyld.
///
/// The mapped span of an image is not cheaply available without walking its
/// load commands, so `size` is left 0 here; the identifying header bytes and
/// path are what offline tooling keys on.
pub fn scan_process_maps(ctx: &mut CrashContext) {
    // SAFETY: dyld bookkeeping reads; indices are re-checked against the
    // count on every call as images can in principle load concurrently
    unsafe {
        let count = _dyld_image_count();
        for idx in 0..count {
            let header = _dyld_get_image_header(idx);
            let name = _dyld_get_image_name(idx);
            if header.is_null() || name.is_null() {
                continue;
            }

            let img_count = (ctx.image_count as usize).min(ctx.images.len());
            if img_count == ctx.images.len() {
                ctx.flags |= crate::SNAPSHOT_IMAGES_TRUNCATED;
                return;
            }

            let img = &mut ctx.images[img_count];
            img.base = header as u64;
            img.size = 0;

            let mut len = 0;
            while len < crate::MAX_IMAGE_PATH && *name.add(len) != 0 {
                len += 1;
            }
            img.path_len = copy_bounded(
                &mut img.path,
                std::slice::from_raw_parts(name.cast::<u8>(), len),
            );

            img.ident
                .copy_from_slice(std::slice::from_raw_parts(header, 16));
            img.ident_len = 16;

            ctx.image_count += 1;
        }
    }
}
