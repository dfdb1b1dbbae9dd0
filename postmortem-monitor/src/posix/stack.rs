//! Alternate signal stack management.
//!
//! The fatal signals include `SIGSEGV` caused by stack overflow, which can
//! only be handled reliably from an alternate stack.

use crate::Error;
use std::{mem, ptr};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack that is mapped for the installing thread.
///
/// This has a minimum size of 16k; the memory is only ever committed if a
/// stack overflow actually occurs.
const SIG_STACK_SIZE: usize = get_stack_size();

struct StackSave {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
}

unsafe impl Send for StackSave {}

static STACK_SAVE: parking_lot::Mutex<Option<StackSave>> = parking_lot::const_mutex(None);

/// Creates an alternate stack to run the signal handlers on, unless one of
/// sufficient size is already registered.
pub(crate) unsafe fn install_sigaltstack() -> Result<(), Error> {
    // Check the existing sigaltstack, and if it exists and is big enough,
    // keep it
    let mut old_stack = mem::zeroed();
    if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
        return Ok(());
    }

    // Map our own, with a guard page below it so that a handler overflowing
    // the alternate stack faults cleanly instead of scribbling
    let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let alloc_size = guard_size + SIG_STACK_SIZE;

    let mapping = libc::mmap(
        ptr::null_mut(),
        alloc_size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if mapping == libc::MAP_FAILED {
        return Err(Error::OutOfMemory);
    }

    let stack_ptr = (mapping as usize + guard_size) as *mut libc::c_void;
    if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        let err = std::io::Error::last_os_error();
        libc::munmap(mapping, alloc_size);
        return Err(err.into());
    }

    let new_stack = libc::stack_t {
        ss_sp: stack_ptr,
        ss_flags: 0,
        ss_size: SIG_STACK_SIZE,
    };
    if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
        let err = std::io::Error::last_os_error();
        libc::munmap(mapping, alloc_size);
        return Err(err.into());
    }

    *STACK_SAVE.lock() = Some(StackSave {
        old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
        new: new_stack,
    });

    Ok(())
}

/// Puts back whatever alternate stack was in effect before
/// [`install_sigaltstack`], if ours is still the current one.
pub(crate) unsafe fn restore_sigaltstack() {
    let mut save = STACK_SAVE.lock();

    if let Some(ss) = &mut *save {
        let mut current_stack = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current_stack) == -1 {
            return;
        }

        // Only restore if no one else has swapped the stack since
        if current_stack.ss_sp == ss.new.ss_sp {
            if let Some(old) = ss.old {
                if libc::sigaltstack(&old, ptr::null_mut()) == -1 {
                    return;
                }
            } else {
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                if libc::sigaltstack(&disable, ptr::null_mut()) == -1 {
                    return;
                }
            }
        }

        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let mapping = (ss.new.ss_sp as usize - guard_size) as *mut libc::c_void;
        libc::munmap(mapping, guard_size + ss.new.ss_size);
        *save = None;
    }
}
