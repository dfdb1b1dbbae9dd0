//! Ways to make a process die on purpose.
//!
//! Each function raises one of the fault kinds the crash reporter
//! intercepts. They are for tests: call one in a forked child and assert on
//! what the parent finds. None of them return (except on architectures where
//! a particular fault cannot be synthesized, noted per function).

use std::hint::black_box;

/// Raises `SIGABRT`.
pub fn raise_abort() -> ! {
    std::process::abort();
}

/// Raises `SIGSEGV` by reading through a null reference.
pub fn raise_segfault() {
    let null: *const u32 = black_box(std::ptr::null());
    // SAFETY: deliberately not safe, that is the point
    let boom = unsafe { *null };
    black_box(boom);
}

/// Raises `SIGFPE` via an integer division overflow. Only x86_64 traps for
/// this; aarch64 defines division results for every input.
#[cfg(target_arch = "x86_64")]
pub fn raise_floating_point_exception() {
    // SAFETY: the fault is the purpose
    unsafe {
        let mut divisor: u32;
        std::arch::asm!(
            "mov eax, 1",
            "cdq",
            "mov {div:e}, 0",
            "idiv {div:e}",
            div = out(reg) divisor,
        );
        black_box(divisor);
    }
}

/// Raises `SIGILL` with an architecturally-undefined instruction.
pub fn raise_illegal_instruction() {
    // SAFETY: the fault is the purpose
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("udf #0");
    }
}

/// Raises `SIGBUS` by touching a mapping past the end of its backing file.
/// `path` is used as the file to map and truncate.
pub fn raise_bus(path: &str) {
    let path = std::ffi::CString::new(path).unwrap();

    // SAFETY: the fault is the purpose; everything before the final read is
    // ordinary file mapping
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666);
        assert!(fd >= 0, "failed to create backing file");

        // Intentionally left empty: any access through the mapping has no
        // backing page
        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        assert_ne!(mapping, libc::MAP_FAILED, "failed to map backing file");

        let boom = *mapping.cast::<u8>();
        black_box(boom);
    }
}

/// Raises `SIGTRAP` with a breakpoint instruction.
pub fn raise_trap() {
    // SAFETY: the fault is the purpose
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("int3");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("brk #0");
    }
}

/// Raises `SIGSEGV` by blowing straight past the thread's stack, relying on
/// the compiler's stack probes to touch the guard page.
pub fn raise_stack_overflow() {
    let mut big_boi = [0u8; 9 * 1024 * 1024];
    big_boi[big_boi.len() - 1] = 1;
    black_box(&big_boi[big_boi.len() - 16..]);
}
