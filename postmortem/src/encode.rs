//! The report encoder.
//!
//! Usable from a compromised context: every record is staged in a fixed
//! stack buffer and pushed to the sink with plain writes. The sink is a
//! generic parameter, not a trait object, so the fatal path monomorphizes to
//! a flat chain of calls ending in `write(2)`.
//!
//! If any write fails the encode aborts where it stands; the caller must
//! treat the output as invalid and must not publish it.

use crate::{
    errors::EncodeError,
    format::{arch, ENDIAN_MARKER, FAULT_SIZE, FORMAT_VERSION, HEADER_SIZE, IMAGE_SIZE, MAGIC, THREAD_SIZE},
};
use postmortem_context::{CrashContext, FaultInfo, ImageRecord, ThreadRecord};

/// A destination for encoded report bytes.
pub trait ReportSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), EncodeError>;
}

/// Streams to a raw file descriptor with bare `write(2)`, retrying on
/// `EINTR`. No buffering, no allocation.
pub struct FdSink {
    fd: i32,
}

impl FdSink {
    #[inline]
    pub fn new(fd: i32) -> Self {
        Self { fd }
    }
}

impl ReportSink for FdSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            // SAFETY: writes from a live slice to an fd the caller owns
            let written = unsafe {
                libc::write(self.fd, remaining.as_ptr().cast(), remaining.len())
            };
            if written < 0 {
                let errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                if errno == libc::EINTR {
                    continue;
                }
                return Err(EncodeError::Write { errno });
            }
            if written == 0 {
                return Err(EncodeError::Write { errno: libc::EIO });
            }
            remaining = &remaining[written as usize..];
        }
        Ok(())
    }
}

/// The live path encodes into memory; ordinary allocation rules apply there.
impl ReportSink for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Fixed staging buffer one record is packed into before hitting the sink.
struct RecordBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    overflow: bool,
}

impl<const N: usize> RecordBuf<N> {
    fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            overflow: false,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end > N {
            self.overflow = true;
            return;
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    #[inline]
    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_ne_bytes());
    }

    #[inline]
    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_ne_bytes());
    }

    #[inline]
    fn put_i32(&mut self, v: i32) {
        self.put(&v.to_ne_bytes());
    }

    #[inline]
    fn put_u64(&mut self, v: u64) {
        self.put(&v.to_ne_bytes());
    }

    /// Flushes the staged record, checking it came out at the size the
    /// format promises.
    fn flush(&self, expected: usize, sink: &mut impl ReportSink) -> Result<usize, EncodeError> {
        if self.overflow || self.len != expected {
            return Err(EncodeError::RecordOverflow);
        }
        sink.write_all(&self.buf[..self.len])?;
        Ok(self.len)
    }
}

/// Encodes `ctx` into `sink`, returning the total bytes written.
pub fn encode_report(ctx: &CrashContext, sink: &mut impl ReportSink) -> Result<usize, EncodeError> {
    let thread_count = (ctx.thread_count as usize).min(ctx.threads.len());
    let image_count = (ctx.image_count as usize).min(ctx.images.len());
    let custom = ctx.custom_data();

    let mut total = write_header(ctx, thread_count, image_count, custom.len(), sink)?;
    total += write_fault(&ctx.fault, sink)?;

    for thread in &ctx.threads[..thread_count] {
        total += write_thread(thread, sink)?;
    }
    for image in &ctx.images[..image_count] {
        total += write_image(image, sink)?;
    }

    sink.write_all(custom)?;
    total += custom.len();

    Ok(total)
}

fn write_header(
    ctx: &CrashContext,
    thread_count: usize,
    image_count: usize,
    custom_len: usize,
    sink: &mut impl ReportSink,
) -> Result<usize, EncodeError> {
    let mut rec = RecordBuf::<HEADER_SIZE>::new();
    rec.put(&MAGIC);
    rec.put_u16(ENDIAN_MARKER);
    rec.put_u16(FORMAT_VERSION);
    rec.put_u16(arch::current());
    rec.put_u16(0); // reserved
    rec.put_u32(ctx.flags);
    rec.put_u64(ctx.timestamp);
    rec.put_u32(ctx.pid);
    rec.put_u32(ctx.fault_tid);
    rec.put_u32(thread_count as u32);
    rec.put_u32(image_count as u32);
    rec.put_u32(custom_len as u32);
    rec.flush(HEADER_SIZE, sink)
}

fn write_fault(fault: &FaultInfo, sink: &mut impl ReportSink) -> Result<usize, EncodeError> {
    let mut rec = RecordBuf::<FAULT_SIZE>::new();
    rec.put_i32(fault.signo);
    rec.put_i32(fault.code);
    rec.put_u64(fault.addr);
    rec.put_u32(fault.has_exception);
    rec.put_u32(fault.exc_kind);
    rec.put_u64(fault.exc_code);
    rec.put_u64(fault.exc_subcode);
    rec.put_u16(fault.name_len);
    rec.put_u16(fault.reason_len);
    rec.put(&fault.name);
    rec.put(&fault.reason);
    rec.flush(FAULT_SIZE, sink)
}

fn write_thread(thread: &ThreadRecord, sink: &mut impl ReportSink) -> Result<usize, EncodeError> {
    let mut rec = RecordBuf::<THREAD_SIZE>::new();
    rec.put_u32(thread.tid);
    rec.put_u32(thread.flags);
    rec.put_u64(thread.stack_base);
    rec.put_u64(thread.stack_limit);
    rec.put_u32(thread.state.nregs);
    rec.put_u64(thread.state.ip);
    rec.put_u64(thread.state.sp);
    for reg in &thread.state.regs {
        rec.put_u64(*reg);
    }
    rec.flush(THREAD_SIZE, sink)
}

fn write_image(image: &ImageRecord, sink: &mut impl ReportSink) -> Result<usize, EncodeError> {
    let mut rec = RecordBuf::<IMAGE_SIZE>::new();
    rec.put_u64(image.base);
    rec.put_u64(image.size);
    rec.put_u16(image.ident_len);
    rec.put_u16(image.path_len);
    rec.put(&image.ident);
    rec.put(&image.path);
    rec.flush(IMAGE_SIZE, sink)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encoded_sizes_match_the_format() {
        let mut ctx = Box::new(CrashContext::zeroed());
        ctx.thread_count = 2;
        ctx.image_count = 3;
        ctx.set_custom_data(b"hello");

        let mut out = Vec::new();
        let written = encode_report(&ctx, &mut out).unwrap();
        assert_eq!(written, out.len());
        assert_eq!(
            written,
            HEADER_SIZE + FAULT_SIZE + 2 * THREAD_SIZE + 3 * IMAGE_SIZE + 5
        );
    }

    #[test]
    fn failing_sink_aborts_the_encode() {
        struct Failing;
        impl ReportSink for Failing {
            fn write_all(&mut self, _bytes: &[u8]) -> Result<(), EncodeError> {
                Err(EncodeError::Write { errno: libc::ENOSPC })
            }
        }

        let ctx = Box::new(CrashContext::zeroed());
        assert!(matches!(
            encode_report(&ctx, &mut Failing),
            Err(EncodeError::Write { errno: libc::ENOSPC })
        ));
    }
}
