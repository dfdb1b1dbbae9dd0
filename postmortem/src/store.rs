//! The pending report store.
//!
//! One canonical path holds at most one report. Writers always go through a
//! sibling temp file and `rename(2)`, so a partially written report is never
//! visible as pending; last publish wins and no history is kept.
//!
//! The store has two faces: the normal-path methods on [`PendingStore`]
//! (std I/O, logging, may allocate), and [`RawPaths`] — the paths pre-resolved
//! to NUL-terminated bytes at enable time so the fatal path performs nothing
//! but `open`/`write`/`fsync`/`rename` on ready-made strings.

use crate::{encode::FdSink, errors::Error};
use postmortem_context::CrashContext;
use std::path::{Path, PathBuf};

/// Longest report path the fatal path supports, NUL included.
pub const MAX_PATH_BYTES: usize = 512;

#[derive(Clone, Debug)]
pub struct PendingStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl PendingStore {
    pub fn new(path: PathBuf) -> Self {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: tmp.into(),
        }
    }

    /// The canonical path. The file may not (yet, or ever) exist.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn has_pending(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Vec<u8>, Error> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the pending report. Idempotent: purging nothing is success.
    pub fn purge(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("purged pending report at {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically moves the temp file into the pending slot. Only call after
    /// a confirmed complete write of the temp file.
    pub fn publish(&self) -> Result<(), Error> {
        std::fs::rename(&self.tmp_path, &self.path)?;
        log::info!("published crash report to {}", self.path.display());
        Ok(())
    }

    /// Pre-resolves both paths for the fatal path. Fails if a path is longer
    /// than [`MAX_PATH_BYTES`] or contains an interior NUL.
    pub fn raw_paths(&self) -> Result<RawPaths, Error> {
        Ok(RawPaths {
            tmp: pack_path(&self.tmp_path)?,
            path: pack_path(&self.path)?,
        })
    }
}

fn pack_path(path: &Path) -> Result<[u8; MAX_PATH_BYTES], Error> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= MAX_PATH_BYTES || bytes.contains(&0) {
        return Err(std::io::Error::from_raw_os_error(libc::ENAMETOOLONG).into());
    }

    let mut packed = [0u8; MAX_PATH_BYTES];
    packed[..bytes.len()].copy_from_slice(bytes);
    Ok(packed)
}

/// NUL-terminated path bytes, ready for raw syscalls in a compromised
/// context.
pub struct RawPaths {
    tmp: [u8; MAX_PATH_BYTES],
    path: [u8; MAX_PATH_BYTES],
}

impl RawPaths {
    /// Encodes `ctx` to the temp file and renames it into the pending slot.
    ///
    /// Async-signal-safe. Returns false on any failure, in which case the
    /// temp file is unlinked (best effort) and the pending slot keeps
    /// whatever it held before; a broken report is never published.
    pub fn write_and_publish(&self, ctx: &CrashContext) -> bool {
        // SAFETY: raw syscalls on pre-validated NUL-terminated paths
        unsafe {
            let fd = libc::open(
                self.tmp.as_ptr().cast(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o600,
            );
            if fd < 0 {
                return false;
            }

            let encoded = crate::encode::encode_report(ctx, &mut FdSink::new(fd)).is_ok();
            let synced = encoded && libc::fsync(fd) == 0;
            libc::close(fd);

            if !synced {
                libc::unlink(self.tmp.as_ptr().cast());
                return false;
            }

            libc::rename(self.tmp.as_ptr().cast(), self.path.as_ptr().cast()) == 0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_store(name: &str) -> PendingStore {
        let path = std::env::temp_dir().join(format!(
            "postmortem-store-{}-{name}.bin",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        PendingStore::new(path)
    }

    #[test]
    fn publish_load_purge_cycle() {
        let store = scratch_store("cycle");
        assert!(!store.has_pending());
        assert!(matches!(store.load(), Err(Error::NotFound)));

        std::fs::write(store.tmp_path(), b"report bytes").unwrap();
        store.publish().unwrap();
        assert!(store.has_pending());
        assert!(!store.tmp_path().exists());
        assert_eq!(store.load().unwrap(), b"report bytes");

        store.purge().unwrap();
        assert!(!store.has_pending());
        assert!(matches!(store.load(), Err(Error::NotFound)));

        // purging again stays success
        store.purge().unwrap();
    }

    #[test]
    fn publish_overwrites_previous_pending() {
        let store = scratch_store("overwrite");

        std::fs::write(store.tmp_path(), b"first").unwrap();
        store.publish().unwrap();
        std::fs::write(store.tmp_path(), b"second").unwrap();
        store.publish().unwrap();

        assert_eq!(store.load().unwrap(), b"second");
        store.purge().unwrap();
    }

    #[test]
    fn fatal_path_writer_produces_a_parseable_report() {
        let store = scratch_store("raw");
        let raw = store.raw_paths().unwrap();

        let mut ctx = Box::new(postmortem_context::CrashContext::zeroed());
        ctx.fault.signo = libc::SIGILL;
        ctx.pid = std::process::id();
        assert!(raw.write_and_publish(&ctx));

        let report = crate::parse_report(&store.load().unwrap()).unwrap();
        assert_eq!(report.fault.signo, libc::SIGILL);
        assert_eq!(report.pid, std::process::id());
        store.purge().unwrap();
    }

    #[test]
    fn oversized_path_is_rejected_up_front() {
        let long = "x".repeat(MAX_PATH_BYTES);
        let store = PendingStore::new(std::env::temp_dir().join(long));
        assert!(store.raw_paths().is_err());
    }
}
