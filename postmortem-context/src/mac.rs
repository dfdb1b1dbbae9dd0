use crate::{ThreadState, MAX_REGS};
use mach2::{exception_types as et, kern_return::KERN_SUCCESS, mach_types as mt};

/// Information on the Mach exception that caused the crash
#[derive(Copy, Clone)]
pub struct ExceptionInfo {
    /// The exception kind
    pub kind: et::exception_type_t,
    /// The exception code
    pub code: et::mach_exception_data_type_t,
    /// Optional subcode, typically only present for `EXC_BAD_ACCESS`
    /// exceptions
    pub subcode: Option<et::mach_exception_data_type_t>,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `<mach/i386/thread_status.h>`
        const THREAD_STATE_FLAVOR: i32 = 4; // x86_THREAD_STATE64

        #[repr(C)]
        #[derive(Clone, Copy)]
        struct NativeThreadState {
            rax: u64, rbx: u64, rcx: u64, rdx: u64,
            rdi: u64, rsi: u64, rbp: u64, rsp: u64,
            r8: u64, r9: u64, r10: u64, r11: u64,
            r12: u64, r13: u64, r14: u64, r15: u64,
            rip: u64, rflags: u64, cs: u64, fs: u64, gs: u64,
        }

        fn convert(native: &NativeThreadState, out: &mut ThreadState) {
            let words = [
                native.rax, native.rbx, native.rcx, native.rdx,
                native.rdi, native.rsi, native.rbp, native.rsp,
                native.r8, native.r9, native.r10, native.r11,
                native.r12, native.r13, native.r14, native.r15,
                native.rip, native.rflags, native.cs, native.fs, native.gs,
            ];
            out.regs[..words.len()].copy_from_slice(&words);
            out.nregs = words.len() as u32;
            out.ip = native.rip;
            out.sp = native.rsp;
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// `<mach/arm/thread_status.h>`
        const THREAD_STATE_FLAVOR: i32 = 6; // ARM_THREAD_STATE64

        #[repr(C)]
        #[derive(Clone, Copy)]
        struct NativeThreadState {
            x: [u64; 29],
            fp: u64,
            lr: u64,
            sp: u64,
            pc: u64,
            cpsr: u32,
            flags: u32,
        }

        fn convert(native: &NativeThreadState, out: &mut ThreadState) {
            out.regs[..29].copy_from_slice(&native.x);
            out.regs[29] = native.fp;
            out.regs[30] = native.lr;
            out.regs[31] = native.sp;
            out.regs[32] = native.pc;
            out.regs[33] = u64::from(native.cpsr);
            out.nregs = MAX_REGS as u32;
            out.ip = native.pc;
            out.sp = native.sp;
        }
    }
}

/// Reads the register state of the given thread via `thread_get_state`.
///
/// The caller is responsible for the thread being suspended (or being the
/// calling thread itself, for a live snapshot of the current position).
pub fn fill_state_for_thread(thread: mt::thread_t, out: &mut ThreadState) -> bool {
    let mut native: NativeThreadState = // SAFETY: plain data
        unsafe { std::mem::zeroed() };
    let mut count =
        (std::mem::size_of::<NativeThreadState>() / std::mem::size_of::<u32>()) as u32;

    // SAFETY: syscall writing at most `count` words into `native`
    let kret = unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            THREAD_STATE_FLAVOR,
            (&mut native as *mut NativeThreadState).cast(),
            &mut count,
        )
    };
    if kret != KERN_SUCCESS {
        return false;
    }

    convert(&native, out);
    true
}

/// Captures the calling thread's own register state, for the live path.
pub fn capture_current_state(out: &mut ThreadState) -> bool {
    // SAFETY: syscall
    let me = unsafe { mach2::mach_init::mach_thread_self() };
    fill_state_for_thread(me, out)
}
