//! The on-disk report layout.
//!
//! A report is a single self-describing binary blob:
//!
//! ```text
//! header | fault record | thread records... | image records... | custom data
//! ```
//!
//! Records are packed (no padding) in the field order the `write_*` functions
//! in [`crate::encode`] emit, using the byte order the process was running
//! with; the header's endian marker tells the parser which that was. The
//! faulting thread is always the first thread record, so a report truncated
//! by a mid-write crash still leads with the most useful data.
//!
//! The version field gates all parsing: a reader that does not know a
//! version must report it as unknown rather than misparse.

pub const MAGIC: [u8; 4] = *b"PMRT";
pub const FORMAT_VERSION: u16 = 1;
/// Written native; reads back as 0x0201 when the writer's byte order differs
/// from the reader's assumption.
pub const ENDIAN_MARKER: u16 = 0x0102;
pub const ENDIAN_MARKER_SWAPPED: u16 = 0x0201;

pub const HEADER_SIZE: usize = 44;
pub const FAULT_SIZE: usize = 236;
pub const THREAD_SIZE: usize = 316;
pub const IMAGE_SIZE: usize = 292;

/// Architecture tag in the header; decides how `ThreadRecord::regs` is to be
/// interpreted offline.
pub mod arch {
    pub const OTHER: u16 = 0;
    pub const X86_64: u16 = 1;
    pub const AARCH64: u16 = 2;

    pub fn current() -> u16 {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                X86_64
            } else if #[cfg(target_arch = "aarch64")] {
                AARCH64
            } else {
                OTHER
            }
        }
    }
}

/// Rejection reasons from the load-path parser. None of these are ever
/// produced by the writer side; a report that fails here was corrupted,
/// truncated, or written by a future version.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("not a crash report (bad magic)")]
    BadMagic,
    #[error("unrecognized endian marker {marker:#06x}")]
    BadEndianMarker { marker: u16 },
    #[error("unknown report format version {version}")]
    UnknownVersion { version: u16 },
    #[error("report data ends mid-record")]
    Truncated,
    #[error("record counts exceed the report's own size")]
    Inconsistent,
}

/// A parsed report; the owned mirror of
/// [`postmortem_context::CrashContext`], produced by [`crate::parse_report`].
#[derive(Debug, Clone)]
pub struct Report {
    pub arch: u16,
    pub flags: u32,
    /// Seconds since the Unix epoch at capture time.
    pub timestamp: u64,
    pub pid: u32,
    pub fault_tid: u32,
    pub fault: Fault,
    /// Faulting thread first.
    pub threads: Vec<Thread>,
    pub images: Vec<Image>,
    pub custom: Vec<u8>,
}

impl Report {
    #[inline]
    pub fn is_live(&self) -> bool {
        self.flags & postmortem_context::SNAPSHOT_LIVE != 0
    }

    #[inline]
    pub fn threads_truncated(&self) -> bool {
        self.flags & postmortem_context::SNAPSHOT_THREADS_TRUNCATED != 0
    }

    #[inline]
    pub fn images_truncated(&self) -> bool {
        self.flags & postmortem_context::SNAPSHOT_IMAGES_TRUNCATED != 0
    }

    #[inline]
    pub fn faulting_thread(&self) -> Option<&Thread> {
        self.threads.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub signo: i32,
    pub code: i32,
    pub addr: u64,
    /// Present when the capture originated from the exception-port
    /// mechanism.
    pub exception: Option<MachException>,
    /// Present when the report carries a caller-supplied exception (live
    /// reports, panic capture).
    pub applied: Option<AppliedExceptionInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachException {
    pub kind: u32,
    pub code: u64,
    pub subcode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedExceptionInfo {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: u32,
    pub flags: u32,
    pub stack_base: u64,
    pub stack_limit: u64,
    pub ip: u64,
    pub sp: u64,
    /// The valid prefix of the captured register array.
    pub regs: Vec<u64>,
}

impl Thread {
    #[inline]
    pub fn is_faulting(&self) -> bool {
        self.flags & postmortem_context::THREAD_FAULTING != 0
    }

    #[inline]
    pub fn state_valid(&self) -> bool {
        self.flags & postmortem_context::THREAD_STATE_VALID != 0
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub base: u64,
    pub size: u64,
    /// Identifying bytes from the image's mapped header; empty when the
    /// header was unreadable at capture time.
    pub ident: Vec<u8>,
    pub path: Vec<u8>,
}

impl Image {
    pub fn path_lossy(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }
}
