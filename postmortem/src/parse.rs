//! The load-path parser.
//!
//! Runs on normal threads only (loading a pending report after relaunch), so
//! it allocates freely. Reads are endian-explicit via `scroll`, driven by the
//! endian marker the writer stamped into the header, and everything is gated
//! behind the magic/version check: a report from an unknown future version is
//! reported as exactly that, never guess-parsed.

use crate::format::{
    AppliedExceptionInfo, Fault, FormatError, Image, MachException, Report, Thread,
    ENDIAN_MARKER, ENDIAN_MARKER_SWAPPED, FAULT_SIZE, FORMAT_VERSION, HEADER_SIZE, IMAGE_SIZE,
    MAGIC, THREAD_SIZE,
};
use postmortem_context::{MAX_EXCEPTION_NAME, MAX_EXCEPTION_REASON, MAX_IMAGE_PATH, MAX_REGS};
use scroll::{Endian, Pread};

impl From<scroll::Error> for FormatError {
    fn from(_err: scroll::Error) -> Self {
        FormatError::Truncated
    }
}

/// Parses a report produced by either the fatal or the live path.
pub fn parse_report(bytes: &[u8]) -> Result<Report, FormatError> {
    if bytes.get(..4) != Some(&MAGIC[..]) {
        return Err(FormatError::BadMagic);
    }
    if bytes.len() < HEADER_SIZE {
        return Err(FormatError::Truncated);
    }

    let marker = u16::from_le_bytes([bytes[4], bytes[5]]);
    let endian = match marker {
        ENDIAN_MARKER => Endian::Little,
        ENDIAN_MARKER_SWAPPED => Endian::Big,
        marker => return Err(FormatError::BadEndianMarker { marker }),
    };

    let offset = &mut 6usize;
    let version: u16 = bytes.gread_with(offset, endian)?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnknownVersion { version });
    }

    let arch: u16 = bytes.gread_with(offset, endian)?;
    let _reserved: u16 = bytes.gread_with(offset, endian)?;
    let flags: u32 = bytes.gread_with(offset, endian)?;
    let timestamp: u64 = bytes.gread_with(offset, endian)?;
    let pid: u32 = bytes.gread_with(offset, endian)?;
    let fault_tid: u32 = bytes.gread_with(offset, endian)?;
    let thread_count: u32 = bytes.gread_with(offset, endian)?;
    let image_count: u32 = bytes.gread_with(offset, endian)?;
    let custom_len: u32 = bytes.gread_with(offset, endian)?;

    debug_assert_eq!(*offset, HEADER_SIZE);

    let expected = HEADER_SIZE
        + FAULT_SIZE
        + thread_count as usize * THREAD_SIZE
        + image_count as usize * IMAGE_SIZE
        + custom_len as usize;
    match bytes.len() {
        len if len < expected => return Err(FormatError::Truncated),
        len if len > expected => return Err(FormatError::Inconsistent),
        _ => {}
    }

    let fault = parse_fault(bytes, offset, endian)?;

    let threads = (0..thread_count)
        .map(|_| parse_thread(bytes, offset, endian))
        .collect::<Result<Vec<_>, _>>()?;

    let images = (0..image_count)
        .map(|_| parse_image(bytes, offset, endian))
        .collect::<Result<Vec<_>, _>>()?;

    let custom = bytes[*offset..*offset + custom_len as usize].to_vec();

    Ok(Report {
        arch,
        flags,
        timestamp,
        pid,
        fault_tid,
        fault,
        threads,
        images,
        custom,
    })
}

fn parse_fault(bytes: &[u8], offset: &mut usize, endian: Endian) -> Result<Fault, FormatError> {
    let signo: i32 = bytes.gread_with(offset, endian)?;
    let code: i32 = bytes.gread_with(offset, endian)?;
    let addr: u64 = bytes.gread_with(offset, endian)?;
    let has_exception: u32 = bytes.gread_with(offset, endian)?;
    let exc_kind: u32 = bytes.gread_with(offset, endian)?;
    let exc_code: u64 = bytes.gread_with(offset, endian)?;
    let exc_subcode: u64 = bytes.gread_with(offset, endian)?;
    let name_len: u16 = bytes.gread_with(offset, endian)?;
    let reason_len: u16 = bytes.gread_with(offset, endian)?;

    let name = take_bytes(bytes, offset, MAX_EXCEPTION_NAME)?;
    let reason = take_bytes(bytes, offset, MAX_EXCEPTION_REASON)?;

    let exception = (has_exception != 0).then_some(MachException {
        kind: exc_kind,
        code: exc_code,
        subcode: exc_subcode,
    });

    let applied = (name_len > 0 || reason_len > 0).then(|| AppliedExceptionInfo {
        name: lossy_prefix(name, name_len as usize),
        reason: lossy_prefix(reason, reason_len as usize),
    });

    Ok(Fault {
        signo,
        code,
        addr,
        exception,
        applied,
    })
}

fn parse_thread(bytes: &[u8], offset: &mut usize, endian: Endian) -> Result<Thread, FormatError> {
    let tid: u32 = bytes.gread_with(offset, endian)?;
    let flags: u32 = bytes.gread_with(offset, endian)?;
    let stack_base: u64 = bytes.gread_with(offset, endian)?;
    let stack_limit: u64 = bytes.gread_with(offset, endian)?;
    let nregs: u32 = bytes.gread_with(offset, endian)?;
    let ip: u64 = bytes.gread_with(offset, endian)?;
    let sp: u64 = bytes.gread_with(offset, endian)?;

    let mut regs = vec![0u64; MAX_REGS];
    for reg in regs.iter_mut() {
        *reg = bytes.gread_with(offset, endian)?;
    }
    regs.truncate((nregs as usize).min(MAX_REGS));

    Ok(Thread {
        tid,
        flags,
        stack_base,
        stack_limit,
        ip,
        sp,
        regs,
    })
}

fn parse_image(bytes: &[u8], offset: &mut usize, endian: Endian) -> Result<Image, FormatError> {
    let base: u64 = bytes.gread_with(offset, endian)?;
    let size: u64 = bytes.gread_with(offset, endian)?;
    let ident_len: u16 = bytes.gread_with(offset, endian)?;
    let path_len: u16 = bytes.gread_with(offset, endian)?;

    let ident = take_bytes(bytes, offset, 16)?;
    let path = take_bytes(bytes, offset, MAX_IMAGE_PATH)?;

    Ok(Image {
        base,
        size,
        ident: ident[..(ident_len as usize).min(16)].to_vec(),
        path: path[..(path_len as usize).min(MAX_IMAGE_PATH)].to_vec(),
    })
}

fn take_bytes<'a>(
    bytes: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8], FormatError> {
    let taken = bytes
        .get(*offset..*offset + len)
        .ok_or(FormatError::Truncated)?;
    *offset += len;
    Ok(taken)
}

fn lossy_prefix(bytes: &[u8], len: usize) -> String {
    String::from_utf8_lossy(&bytes[..len.min(bytes.len())]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::encode_report;
    use postmortem_context::{CrashContext, THREAD_FAULTING, THREAD_STATE_VALID};

    fn sample_context() -> Box<CrashContext> {
        let mut ctx = Box::new(CrashContext::zeroed());
        ctx.fault.signo = libc::SIGSEGV;
        ctx.fault.code = 1; // SEGV_MAPERR
        ctx.fault.addr = 0xdead_beef;
        ctx.pid = 4242;
        ctx.fault_tid = 4243;
        ctx.timestamp = 1_700_000_000;

        let rec = ctx.push_thread().unwrap();
        rec.tid = 4243;
        rec.flags = THREAD_FAULTING | THREAD_STATE_VALID;
        rec.state.nregs = 4;
        rec.state.regs[..4].copy_from_slice(&[1, 2, 3, 4]);
        rec.state.ip = 0x1000;
        rec.state.sp = 0x7fff_0000;

        let rec = ctx.push_thread().unwrap();
        rec.tid = 4250;

        ctx.image_count = 1;
        ctx.images[0].base = 0x4000_0000;
        ctx.images[0].size = 0x2000;
        ctx.images[0].ident[..4].copy_from_slice(b"\x7fELF");
        ctx.images[0].ident_len = 4;
        ctx.images[0].path[..12].copy_from_slice(b"/bin/crashy!");
        ctx.images[0].path_len = 12;

        ctx.set_custom_data(b"session=abc123");
        ctx
    }

    #[test]
    fn round_trips() {
        let ctx = sample_context();
        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        let report = parse_report(&bytes).unwrap();
        assert_eq!(report.pid, 4242);
        assert_eq!(report.fault_tid, 4243);
        assert_eq!(report.timestamp, 1_700_000_000);
        assert_eq!(report.fault.signo, libc::SIGSEGV);
        assert_eq!(report.fault.addr, 0xdead_beef);
        assert!(report.fault.exception.is_none());
        assert!(report.fault.applied.is_none());

        assert_eq!(report.threads.len(), 2);
        let faulting = report.faulting_thread().unwrap();
        assert!(faulting.is_faulting());
        assert!(faulting.state_valid());
        assert_eq!(faulting.regs, vec![1, 2, 3, 4]);
        assert_eq!(faulting.ip, 0x1000);
        assert!(!report.threads[1].state_valid());

        assert_eq!(report.images.len(), 1);
        assert_eq!(report.images[0].ident, b"\x7fELF");
        assert_eq!(report.images[0].path, b"/bin/crashy!");

        assert_eq!(report.custom, b"session=abc123");
    }

    #[test]
    fn applied_exception_round_trips() {
        let mut ctx = sample_context();
        ctx.set_applied_exception(b"panic", b"index out of bounds");

        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        let report = parse_report(&bytes).unwrap();
        let applied = report.fault.applied.unwrap();
        assert_eq!(applied.name, "panic");
        assert_eq!(applied.reason, "index out of bounds");
    }

    #[test]
    fn unknown_version_is_rejected() {
        let ctx = sample_context();
        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        // Flip the version field (offset 6, past magic + endian marker)
        bytes[6] = 0x7f;
        match parse_report(&bytes) {
            Err(FormatError::UnknownVersion { .. }) => {}
            other => panic!("expected UnknownVersion, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let ctx = sample_context();
        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        bytes[0] = b'X';
        assert!(matches!(parse_report(&bytes), Err(FormatError::BadMagic)));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let ctx = sample_context();
        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        bytes.truncate(bytes.len() - 10);
        match parse_report(&bytes) {
            Err(FormatError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }

        assert!(matches!(parse_report(&[]), Err(FormatError::BadMagic)));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let ctx = sample_context();
        let mut bytes = Vec::new();
        encode_report(&ctx, &mut bytes).unwrap();

        bytes.extend_from_slice(b"junk");
        match parse_report(&bytes) {
            Err(FormatError::Inconsistent) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
    }

    #[test]
    fn reads_the_opposite_byte_order() {
        // A minimal big-endian report: header + zeroed fault record, no
        // threads, images or custom data
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&[0x01, 0x02]); // marker as a BE writer lays it down
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes()); // arch: other
        bytes.extend_from_slice(&0u16.to_be_bytes()); // reserved
        bytes.extend_from_slice(&0u32.to_be_bytes()); // flags
        bytes.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        bytes.extend_from_slice(&77u32.to_be_bytes()); // pid
        bytes.extend_from_slice(&78u32.to_be_bytes()); // fault_tid
        bytes.extend_from_slice(&0u32.to_be_bytes()); // threads
        bytes.extend_from_slice(&0u32.to_be_bytes()); // images
        bytes.extend_from_slice(&0u32.to_be_bytes()); // custom
        bytes.resize(HEADER_SIZE + FAULT_SIZE, 0);

        let report = parse_report(&bytes).unwrap();
        assert_eq!(report.pid, 77);
        assert_eq!(report.fault_tid, 78);
        assert_eq!(report.timestamp, 1_700_000_000);
    }
}
