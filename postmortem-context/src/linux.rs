use crate::{ThreadState, MAX_REGS};

#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    #[cfg(target_pointer_width = "32")]
    __val: [u32; 32],
    #[cfg(target_pointer_width = "64")]
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut std::ffi::c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The user context delivered with a signal.
        ///
        /// We define our own layout instead of using [`libc::ucontext_t`] as
        /// libc's differs between glibc and musl even though the context the
        /// kernel delivers is arch specific, not libc specific.
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
            pub uc_sigmask: sigset_t,
            __private: [u8; 512],
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub gregs: [i64; 23],
            pub fpregs: *mut std::ffi::c_void,
            __reserved: [u64; 8],
        }

        // Indices into `mcontext_t::gregs`, from <sys/ucontext.h>. Spelled
        // out here as musl does not export the REG_* constants.
        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;

        /// Copies the register state out of a signal-delivered user context.
        ///
        /// Safe to call from a compromised context; only reads the fixed-size
        /// `gregs` array.
        pub fn fill_state(uc: &ucontext_t, out: &mut ThreadState) {
            let gregs = &uc.uc_mcontext.gregs;
            for (dst, src) in out.regs.iter_mut().zip(gregs.iter()) {
                *dst = *src as u64;
            }
            out.nregs = gregs.len() as u32;
            out.ip = gregs[REG_RIP] as u64;
            out.sp = gregs[REG_RSP] as u64;
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// The user context delivered with a signal.
        ///
        /// We define our own layout instead of using [`libc::ucontext_t`] as
        /// libc's differs between glibc and musl even though the context the
        /// kernel delivers is arch specific, not libc specific.
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: sigset_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C, align(16))]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
            // Holds the fpsimd/sve context chain, which we don't capture
            __reserved: [u8; 4096],
        }

        /// Copies the register state out of a signal-delivered user context.
        ///
        /// Safe to call from a compromised context; only reads the fixed-size
        /// register block.
        pub fn fill_state(uc: &ucontext_t, out: &mut ThreadState) {
            let mc = &uc.uc_mcontext;
            out.regs[..31].copy_from_slice(&mc.regs);
            out.regs[31] = mc.sp;
            out.regs[32] = mc.pc;
            out.regs[33] = mc.pstate;
            out.nregs = MAX_REGS as u32;
            out.ip = mc.pc;
            out.sp = mc.sp;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_env = "gnu")] {
        /// Captures the calling thread's own register state.
        ///
        /// This is for the live (non-fault) path: `getcontext` is not
        /// async-signal-safe and must not be used from a handler. The state
        /// observed is the state at the point of the call, which is exactly
        /// what a live report wants.
        pub fn capture_current_state(out: &mut ThreadState) -> bool {
            // SAFETY: getcontext fills the buffer it is handed; glibc's
            // ucontext_t layout matches the kernel layout we define above
            unsafe {
                let mut uc: libc::ucontext_t = std::mem::zeroed();
                if libc::getcontext(&mut uc) != 0 {
                    return false;
                }
                fill_state(&*(&uc as *const libc::ucontext_t).cast::<ucontext_t>(), out);
            }
            true
        }
    } else {
        /// Captures the calling thread's instruction and stack pointers.
        ///
        /// Non-glibc targets have no `getcontext`; record a degraded state
        /// (`nregs` stays 0) rather than reaching for unportable tricks.
        pub fn capture_current_state(out: &mut ThreadState) -> bool {
            let ip: u64;
            let sp: u64;
            // SAFETY: reads two registers, no memory or flags touched
            unsafe {
                cfg_if::cfg_if! {
                    if #[cfg(target_arch = "x86_64")] {
                        std::arch::asm!(
                            "lea {ip}, [rip]",
                            "mov {sp}, rsp",
                            ip = out(reg) ip,
                            sp = out(reg) sp,
                            options(nomem, nostack)
                        );
                    } else if #[cfg(target_arch = "aarch64")] {
                        std::arch::asm!(
                            "adr {ip}, .",
                            "mov {sp}, sp",
                            ip = out(reg) ip,
                            sp = out(reg) sp,
                            options(nomem, nostack)
                        );
                    }
                }
            }
            out.nregs = 0;
            out.ip = ip;
            out.sp = sp;
            true
        }
    }
}
