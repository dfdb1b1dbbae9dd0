//! Loaded-image and stack-bounds discovery from `/proc/self/maps`.
//!
//! The file is streamed through a fixed line buffer; nothing is allocated and
//! overly long lines are cut rather than grown. File-backed mappings merge
//! into one image record per file so the record count stays proportional to
//! the number of loaded objects, not the number of segments.

use crate::{
    copy_bounded, CrashContext, ImageRecord, SNAPSHOT_IMAGES_TRUNCATED, THREAD_STATE_VALID,
};

const MAPS_PATH: &[u8] = b"/proc/self/maps\0";
const MAX_LINE: usize = 512;

struct LineReader {
    fd: i32,
    buf: [u8; 4096],
    len: usize,
    pos: usize,
    eof: bool,
}

impl LineReader {
    fn open(path: &[u8]) -> Option<Self> {
        // SAFETY: open of a static NUL-terminated path
        let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_RDONLY | libc::O_CLOEXEC) };
        (fd >= 0).then(|| Self {
            fd,
            buf: [0; 4096],
            len: 0,
            pos: 0,
            eof: false,
        })
    }

    fn refill(&mut self) {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.len, 0);
            self.len -= self.pos;
            self.pos = 0;
        }
        while !self.eof && self.len < self.buf.len() {
            // SAFETY: reads into the unfilled tail of the fixed buffer
            let n = unsafe {
                libc::read(
                    self.fd,
                    self.buf.as_mut_ptr().add(self.len).cast(),
                    self.buf.len() - self.len,
                )
            };
            if n <= 0 {
                if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                self.eof = true;
            } else {
                self.len += n as usize;
            }
        }
    }

    /// Copies the next line (without the newline) into `line`, returning its
    /// length. Lines longer than `line` are truncated and the excess dropped.
    fn next_line(&mut self, line: &mut [u8; MAX_LINE]) -> Option<usize> {
        loop {
            if let Some(nl) = self.buf[self.pos..self.len].iter().position(|&b| b == b'\n') {
                let src = &self.buf[self.pos..self.pos + nl];
                let n = copy_bounded(line, src) as usize;
                self.pos += nl + 1;
                return Some(n);
            }
            if self.eof {
                if self.pos == self.len {
                    return None;
                }
                // trailing line without a newline
                let n = copy_bounded(line, &self.buf[self.pos..self.len]) as usize;
                self.pos = self.len;
                return Some(n);
            }
            if self.pos == 0 && self.len == self.buf.len() {
                // Line longer than the whole buffer: keep the head, drop the
                // rest of the line
                let n = copy_bounded(line, &self.buf[..self.len]) as usize;
                self.pos = 0;
                self.len = 0;
                self.skip_to_newline();
                return Some(n);
            }
            self.refill();
        }
    }

    fn skip_to_newline(&mut self) {
        loop {
            self.refill();
            if let Some(nl) = self.buf[..self.len].iter().position(|&b| b == b'\n') {
                self.pos = nl + 1;
                return;
            }
            self.pos = 0;
            self.len = 0;
            if self.eof {
                return;
            }
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this reader
        unsafe {
            libc::close(self.fd);
        }
    }
}

struct MapsEntry<'a> {
    start: u64,
    end: u64,
    readable: bool,
    offset: u64,
    path: &'a [u8],
}

/// Parses one `maps` line:
/// `start-end perms offset dev inode   path`
fn parse_line(line: &[u8]) -> Option<MapsEntry<'_>> {
    let mut pos = 0;

    let start = parse_hex(line, &mut pos)?;
    expect(line, &mut pos, b'-')?;
    let end = parse_hex(line, &mut pos)?;
    expect(line, &mut pos, b' ')?;

    let perms = line.get(pos..pos + 4)?;
    let readable = perms[0] == b'r';
    pos += 4;
    expect(line, &mut pos, b' ')?;

    let offset = parse_hex(line, &mut pos)?;
    expect(line, &mut pos, b' ')?;

    // dev and inode
    skip_field(line, &mut pos);
    skip_field(line, &mut pos);

    while line.get(pos) == Some(&b' ') {
        pos += 1;
    }

    Some(MapsEntry {
        start,
        end,
        readable,
        offset,
        path: &line[pos.min(line.len())..],
    })
}

fn parse_hex(line: &[u8], pos: &mut usize) -> Option<u64> {
    let mut val: u64 = 0;
    let mut any = false;
    while let Some(&b) = line.get(*pos) {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => break,
        };
        val = (val << 4) | u64::from(digit);
        any = true;
        *pos += 1;
    }
    any.then_some(val)
}

fn expect(line: &[u8], pos: &mut usize, b: u8) -> Option<()> {
    if line.get(*pos) == Some(&b) {
        *pos += 1;
        Some(())
    } else {
        None
    }
}

fn skip_field(line: &[u8], pos: &mut usize) {
    while line.get(*pos).is_some_and(|&b| b != b' ') {
        *pos += 1;
    }
    while line.get(*pos) == Some(&b' ') {
        *pos += 1;
    }
}

/// Scans the process memory map, recording loaded images into `ctx` and
/// resolving stack bounds for every thread already captured in `ctx` whose
/// stack pointer falls inside a mapping.
pub fn scan_process_maps(ctx: &mut CrashContext) {
    let Some(mut reader) = LineReader::open(MAPS_PATH) else {
        return;
    };

    let mut line = [0u8; MAX_LINE];
    while let Some(len) = reader.next_line(&mut line) {
        let Some(entry) = parse_line(&line[..len]) else {
            continue;
        };

        let thread_count = (ctx.thread_count as usize).min(ctx.threads.len());
        for thread in ctx.threads[..thread_count].iter_mut() {
            if thread.flags & THREAD_STATE_VALID != 0
                && thread.state.sp >= entry.start
                && thread.state.sp < entry.end
            {
                thread.stack_limit = entry.start;
                thread.stack_base = entry.end;
            }
        }

        if entry.path.first() == Some(&b'/') {
            record_image(
                &mut ctx.images,
                &mut ctx.image_count,
                &mut ctx.flags,
                &entry,
            );
        }
    }
}

fn record_image(
    images: &mut [ImageRecord],
    image_count: &mut u32,
    flags: &mut u32,
    entry: &MapsEntry<'_>,
) {
    let count = (*image_count as usize).min(images.len());

    // Segments of the same file merge into the record created by the file's
    // lowest mapping; maps lines are sorted by address
    for img in images[..count].iter_mut() {
        if img.path_bytes() == entry.path {
            let top = (img.base + img.size).max(entry.end);
            img.size = top - img.base;
            return;
        }
    }

    if count == images.len() {
        *flags |= SNAPSHOT_IMAGES_TRUNCATED;
        return;
    }

    let img = &mut images[count];
    img.base = entry.start;
    img.size = entry.end - entry.start;
    img.path_len = copy_bounded(&mut img.path, entry.path);

    // The identifying bytes are the mapped object's header (for ELF, the
    // e_ident block). Only the mapping of file offset 0 holds it, and only a
    // readable mapping may be touched at all.
    if entry.offset == 0 && entry.readable && entry.end - entry.start >= 16 {
        // SAFETY: the kernel just reported [start, end) as a readable mapping
        // of this process; no other thread is running to unmap it mid-copy
        let header = unsafe { std::slice::from_raw_parts(entry.start as *const u8, 16) };
        img.ident.copy_from_slice(header);
        img.ident_len = 16;
    }

    *image_count += 1;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_file_backed_line() {
        let line = b"7f2b4c000000-7f2b4c021000 r-xp 00000000 08:01 3811 /usr/lib/libfoo.so.1";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.start, 0x7f2b_4c00_0000);
        assert_eq!(entry.end, 0x7f2b_4c02_1000);
        assert!(entry.readable);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.path, b"/usr/lib/libfoo.so.1");
    }

    #[test]
    fn parses_anonymous_line() {
        let line = b"7ffd8bc00000-7ffd8bc21000 rw-p 00000000 00:00 0";
        let entry = parse_line(line).unwrap();
        assert!(entry.path.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line(b"not a maps line").is_none());
        assert!(parse_line(b"").is_none());
    }

    #[test]
    fn scan_finds_own_executable() {
        let mut ctx = Box::new(CrashContext::zeroed());
        scan_process_maps(&mut ctx);
        assert!(ctx.image_count > 0);

        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let exe = exe.to_str().unwrap().as_bytes();
        let found = ctx.images[..ctx.image_count as usize]
            .iter()
            .any(|img| img.path_bytes() == exe);
        assert!(found, "own executable missing from image list");
    }

    #[test]
    fn scan_resolves_stack_bounds() {
        let mut ctx = Box::new(CrashContext::zeroed());
        let local = 0u8;

        let rec = ctx.push_thread().unwrap();
        rec.flags |= THREAD_STATE_VALID;
        rec.state.sp = (&local as *const u8) as u64;

        scan_process_maps(&mut ctx);

        let rec = &ctx.threads[0];
        assert!(rec.stack_limit < rec.stack_base);
        assert!(rec.state.sp >= rec.stack_limit && rec.state.sp < rec.stack_base);
    }

    #[test]
    fn elf_ident_captured_for_own_executable() {
        let mut ctx = Box::new(CrashContext::zeroed());
        scan_process_maps(&mut ctx);

        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let exe = exe.to_str().unwrap().as_bytes();
        let img = ctx.images[..ctx.image_count as usize]
            .iter()
            .find(|img| img.path_bytes() == exe)
            .unwrap();
        if img.ident_len == 16 {
            assert_eq!(&img.ident[..4], b"\x7fELF");
        }
    }
}
