//! Thread enumeration by raw-reading `/proc/self/task`.
//!
//! `readdir(3)` allocates, so the directory stream is consumed with the
//! `getdents64` syscall into a fixed buffer.

const TASK_DIR: &[u8] = b"/proc/self/task\0";

/// Offsets into `struct linux_dirent64`
const DIRENT_RECLEN: usize = 16;
const DIRENT_NAME: usize = 19;

/// Fills `out` with the id of every live thread of the current process.
///
/// Returns the number of ids written and whether the enumeration hit the end
/// of `out` with entries remaining.
pub fn thread_ids(out: &mut [u32]) -> (usize, bool) {
    // SAFETY: raw directory read with a fixed buffer, all bounds checked
    unsafe {
        let fd = libc::open(
            TASK_DIR.as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return (0, false);
        }

        let mut count = 0;
        let mut truncated = false;
        let mut buf = [0u8; 1024];

        'read: loop {
            let nread = libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr(),
                buf.len(),
            );
            if nread <= 0 {
                break;
            }
            let nread = nread as usize;

            let mut pos = 0;
            while pos + DIRENT_NAME < nread {
                let reclen =
                    u16::from_ne_bytes([buf[pos + DIRENT_RECLEN], buf[pos + DIRENT_RECLEN + 1]])
                        as usize;
                if reclen == 0 || pos + reclen > nread {
                    break 'read;
                }

                if let Some(tid) = parse_decimal(&buf[pos + DIRENT_NAME..pos + reclen]) {
                    if count == out.len() {
                        truncated = true;
                        break 'read;
                    }
                    out[count] = tid;
                    count += 1;
                }

                pos += reclen;
            }
        }

        libc::close(fd);
        (count, truncated)
    }
}

/// Parses a NUL-terminated decimal name; `.` and `..` fall out naturally.
fn parse_decimal(name: &[u8]) -> Option<u32> {
    let mut val: u32 = 0;
    let mut any = false;
    for &b in name {
        match b {
            0 => break,
            b'0'..=b'9' => {
                val = val.wrapping_mul(10).wrapping_add(u32::from(b - b'0'));
                any = true;
            }
            _ => return None,
        }
    }
    any.then_some(val)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_own_thread() {
        let mut tids = [0u32; 128];
        let (count, truncated) = thread_ids(&mut tids);
        assert!(count >= 1);
        assert!(!truncated);

        // SAFETY: gettid has no preconditions
        let me = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        assert!(tids[..count].contains(&me));
    }

    #[test]
    fn finds_spawned_threads() {
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(5));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = barrier.clone();
                std::thread::spawn(move || {
                    b.wait();
                })
            })
            .collect();

        let mut tids = [0u32; 128];
        let (count, _) = thread_ids(&mut tids);
        assert!(count >= 5, "expected at least 5 threads, saw {count}");

        barrier.wait();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn truncates_at_capacity() {
        let mut tids = [0u32; 0];
        let (count, truncated) = thread_ids(&mut tids);
        assert_eq!(count, 0);
        assert!(truncated);
    }
}
