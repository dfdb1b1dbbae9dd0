/// Maximum number of thread records in a single snapshot, the faulting thread
/// included. Enumeration past this count sets [`SNAPSHOT_THREADS_TRUNCATED`].
pub const MAX_THREADS: usize = 64;
/// Maximum number of loaded-image records in a single snapshot.
pub const MAX_IMAGES: usize = 128;
/// Fixed capacity of an image path buffer. Longer paths are cut, never grown.
pub const MAX_IMAGE_PATH: usize = 256;
/// Fixed capacity of the caller-supplied custom data staged in the snapshot.
pub const MAX_CUSTOM_DATA: usize = 4096;
/// Fixed capacity of an applied exception's name.
pub const MAX_EXCEPTION_NAME: usize = 64;
/// Fixed capacity of an applied exception's reason string.
pub const MAX_EXCEPTION_REASON: usize = 128;
/// Capacity of the general purpose register array, sized for the largest
/// supported architecture (aarch64: x0-x30, sp, pc, pstate).
pub const MAX_REGS: usize = 34;

/// More threads were alive than [`MAX_THREADS`]; the list is a prefix.
pub const SNAPSHOT_THREADS_TRUNCATED: u32 = 1 << 0;
/// More images were mapped than [`MAX_IMAGES`]; the list is a prefix.
pub const SNAPSHOT_IMAGES_TRUNCATED: u32 = 1 << 1;
/// The snapshot was produced by the live path, not by a fault.
pub const SNAPSHOT_LIVE: u32 = 1 << 2;
/// Register state could not be mapped onto the portable representation and
/// only partial fields (if any) are valid, e.g. exception-port captures.
pub const SNAPSHOT_DEGRADED_STATE: u32 = 1 << 3;

/// The record's register state was actually captured.
pub const THREAD_STATE_VALID: u32 = 1 << 0;
/// The record describes the thread that raised the fault.
pub const THREAD_FAULTING: u32 = 1 << 1;

/// Architecture-independent register dump.
///
/// Registers are stored in a fixed per-architecture order (x86_64: the kernel
/// `gregs` order; aarch64: x0-x30, sp, pc, pstate) so that a report written
/// on one machine can be decoded on another. The instruction and stack
/// pointers are duplicated out of the array so consumers don't need to know
/// the ordering.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThreadState {
    pub regs: [u64; MAX_REGS],
    pub ip: u64,
    pub sp: u64,
    /// Number of valid entries in `regs`. Zero means only `ip`/`sp` are
    /// meaningful (degraded capture).
    pub nregs: u32,
    pub _reserved: u32,
}

impl ThreadState {
    #[inline]
    pub fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    #[inline]
    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }
}

/// A single thread observed during capture.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThreadRecord {
    pub tid: u32,
    pub flags: u32,
    /// Highest address of the thread's stack mapping, 0 if unresolved.
    pub stack_base: u64,
    /// Lowest address of the thread's stack mapping, 0 if unresolved.
    pub stack_limit: u64,
    pub state: ThreadState,
}

/// A loaded code image (executable or shared object).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageRecord {
    /// Lowest mapped address of the image.
    pub base: u64,
    /// Total span of the image's mappings.
    pub size: u64,
    /// Valid prefix of `ident`.
    pub ident_len: u16,
    /// Valid prefix of `path`.
    pub path_len: u16,
    pub _reserved: u32,
    /// Identifying bytes copied from the image's mapped header, when the
    /// header page was readable. Matching these against the on-disk file is
    /// an offline concern.
    pub ident: [u8; 16],
    pub path: [u8; MAX_IMAGE_PATH],
}

impl ImageRecord {
    #[inline]
    pub fn path_bytes(&self) -> &[u8] {
        &self.path[..usize::from(self.path_len).min(MAX_IMAGE_PATH)]
    }
}

/// Why the snapshot was taken.
///
/// For signal-based captures `signo`/`code`/`addr` are filled from the
/// delivered `siginfo`. For exception-port captures the Mach triple is
/// recorded and `signo` holds the best-effort signal equivalent. Live
/// snapshots leave `signo` at 0 and may carry an applied exception
/// (name + reason) supplied by the caller.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FaultInfo {
    pub signo: i32,
    pub code: i32,
    pub addr: u64,
    pub has_exception: u32,
    pub exc_kind: u32,
    pub exc_code: u64,
    pub exc_subcode: u64,
    pub name_len: u16,
    pub reason_len: u16,
    pub _reserved: u32,
    pub name: [u8; MAX_EXCEPTION_NAME],
    pub reason: [u8; MAX_EXCEPTION_REASON],
}

/// A complete snapshot of the process at the moment of a fault (or of a live
/// capture), staged entirely in fixed-size storage.
///
/// The faulting (or requesting) thread is always `threads[0]`, so partially
/// captured snapshots still lead with the most useful record.
#[repr(C)]
#[derive(Clone)]
pub struct CrashContext {
    pub fault: FaultInfo,
    pub pid: u32,
    /// The id of the faulting thread, `threads[0]`.
    pub fault_tid: u32,
    /// Seconds since the Unix epoch at capture time.
    pub timestamp: u64,
    pub flags: u32,
    pub thread_count: u32,
    pub image_count: u32,
    pub custom_len: u32,
    pub threads: [ThreadRecord; MAX_THREADS],
    pub images: [ImageRecord; MAX_IMAGES],
    pub custom: [u8; MAX_CUSTOM_DATA],
}

impl CrashContext {
    /// An all-zero context. Every field of every record type is plain data,
    /// so zeroed storage is a valid (empty) snapshot.
    pub fn zeroed() -> Self {
        // SAFETY: the struct is entirely integers and byte arrays
        unsafe { std::mem::zeroed() }
    }

    /// Resets the context in place without constructing a temporary.
    pub fn reset(&mut self) {
        // SAFETY: see `zeroed`
        unsafe {
            std::ptr::write_bytes(self, 0, 1);
        }
    }

    /// Appends a thread record, setting the truncation flag instead of
    /// growing when full. Returns the claimed record.
    pub fn push_thread(&mut self) -> Option<&mut ThreadRecord> {
        let idx = self.thread_count as usize;
        if idx >= MAX_THREADS {
            self.flags |= SNAPSHOT_THREADS_TRUNCATED;
            return None;
        }
        self.thread_count += 1;
        Some(&mut self.threads[idx])
    }

    #[inline]
    pub fn faulting_thread(&self) -> Option<&ThreadRecord> {
        (self.thread_count > 0).then(|| &self.threads[0])
    }

    /// Stages a bounded copy of `bytes` as the snapshot's custom data.
    pub fn set_custom_data(&mut self, bytes: &[u8]) {
        self.custom_len = u32::from(copy_bounded(&mut self.custom, bytes));
    }

    #[inline]
    pub fn custom_data(&self) -> &[u8] {
        &self.custom[..(self.custom_len as usize).min(MAX_CUSTOM_DATA)]
    }

    /// Records an applied (caller-supplied) exception on the fault info.
    pub fn set_applied_exception(&mut self, name: &[u8], reason: &[u8]) {
        self.fault.name_len = copy_bounded(&mut self.fault.name, name);
        self.fault.reason_len = copy_bounded(&mut self.fault.reason, reason);
    }
}

/// Copies as much of `src` as fits into `dst`, returning the copied length.
/// Never assumes NUL termination on either side.
pub fn copy_bounded(dst: &mut [u8], src: &[u8]) -> u16 {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thread_list_is_bounded() {
        let mut ctx = Box::new(CrashContext::zeroed());
        for _ in 0..MAX_THREADS {
            assert!(ctx.push_thread().is_some());
        }
        assert!(ctx.push_thread().is_none());
        assert_eq!(ctx.thread_count as usize, MAX_THREADS);
        assert_ne!(ctx.flags & SNAPSHOT_THREADS_TRUNCATED, 0);
    }

    #[test]
    fn custom_data_is_bounded() {
        let mut ctx = Box::new(CrashContext::zeroed());
        let blob = vec![0xa5u8; MAX_CUSTOM_DATA * 2];
        ctx.set_custom_data(&blob);
        assert_eq!(ctx.custom_data().len(), MAX_CUSTOM_DATA);
        assert!(ctx.custom_data().iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn applied_exception_copies_are_bounded() {
        let mut ctx = Box::new(CrashContext::zeroed());
        ctx.set_applied_exception(b"OutOfCheese", &[b'r'; 4096]);
        assert_eq!(&ctx.fault.name[..ctx.fault.name_len as usize], b"OutOfCheese");
        assert_eq!(ctx.fault.reason_len as usize, MAX_EXCEPTION_REASON);
    }
}
