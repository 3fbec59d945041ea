//! Descriptor allocation
//!
//! Database files must never land on descriptors 0, 1 or 2: a stray write to
//! "stderr" would then corrupt the database. [`robust_open`] retries until the
//! kernel hands out a descriptor at or above [`MIN_FILE_DESCRIPTOR`], parking
//! `/dev/null` on any low slot it frees along the way.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorCode, Result};
use crate::os::unix::{fstat_fd, get_errno, MIN_FILE_DESCRIPTOR};

/// Where descriptors come from
///
/// Split out of [`robust_open`] so the allocation loop can run against a
/// scripted source.
pub(crate) trait DescriptorSource {
    /// Attempt one open, returning errno on failure
    fn open(&mut self) -> std::result::Result<RawFd, i32>;

    /// Give back a descriptor that was too low to keep
    fn discard(&mut self, fd: RawFd);

    /// Fill the lowest free slot with a placeholder; false if that failed
    fn occupy_low_slot(&mut self) -> bool;
}

struct PathSource {
    path: CString,
    oflags: libc::c_int,
    mode: libc::mode_t,
}

impl DescriptorSource for PathSource {
    fn open(&mut self) -> std::result::Result<RawFd, i32> {
        let fd = unsafe {
            libc::open(
                self.path.as_ptr(),
                self.oflags | libc::O_CLOEXEC,
                self.mode as libc::c_uint,
            )
        };
        if fd < 0 {
            Err(get_errno())
        } else {
            Ok(fd)
        }
    }

    fn discard(&mut self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn occupy_low_slot(&mut self) -> bool {
        // The placeholder stays open for the life of the process.
        let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY, 0) };
        fd >= 0
    }
}

/// Run the allocation loop against a source
pub(crate) fn allocate<S: DescriptorSource>(source: &mut S) -> std::result::Result<RawFd, i32> {
    loop {
        match source.open() {
            Err(libc::EINTR) => continue,
            Err(errno) => return Err(errno),
            Ok(fd) if fd >= MIN_FILE_DESCRIPTOR => return Ok(fd),
            Ok(fd) => {
                log::debug!("descriptor {} is reserved, reopening", fd);
                source.discard(fd);
                if !source.occupy_low_slot() {
                    return Err(libc::EMFILE);
                }
            }
        }
    }
}

/// Open `path` with raw `open(2)` flags
///
/// When `mode` is given and the file is empty after opening (it was just
/// created), its permission bits are set to `mode` regardless of the umask.
/// That step is best effort.
pub fn robust_open(path: &str, oflags: libc::c_int, mode: Option<u32>) -> Result<RawFd> {
    let c_path = CString::new(path).map_err(|_| Error::with_message(ErrorCode::CantOpen, path))?;
    let mut source = PathSource {
        path: c_path,
        oflags,
        mode: mode.unwrap_or(0o644) as libc::mode_t,
    };

    let fd = allocate(&mut source).map_err(|errno| {
        Error::with_message(
            ErrorCode::CantOpen,
            format!("{}: {}", path, std::io::Error::from_raw_os_error(errno)),
        )
    })?;

    if let Some(mode) = mode {
        apply_creation_mode(fd, mode as libc::mode_t);
    }

    Ok(fd)
}

fn apply_creation_mode(fd: RawFd, mode: libc::mode_t) {
    let Ok(stat) = fstat_fd(fd) else {
        return;
    };
    if stat.st_size != 0 || (stat.st_mode & 0o7777) == mode {
        return;
    }
    if unsafe { libc::fchmod(fd, mode) } != 0 {
        log::warn!("fchmod({:o}) on fd {} failed: errno {}", mode, fd, get_errno());
    }
}

/// Close a descriptor, logging (not reporting) failures
pub fn robust_close(fd: RawFd) {
    if unsafe { libc::close(fd) } != 0 {
        log::warn!("close({}) failed: errno {}", fd, get_errno());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::os::unix::fs::PermissionsExt;

    struct Scripted {
        results: VecDeque<std::result::Result<RawFd, i32>>,
        discarded: Vec<RawFd>,
        placeholders: usize,
        placeholder_ok: bool,
    }

    impl Scripted {
        fn new(results: Vec<std::result::Result<RawFd, i32>>) -> Self {
            Self {
                results: results.into(),
                discarded: Vec::new(),
                placeholders: 0,
                placeholder_ok: true,
            }
        }
    }

    impl DescriptorSource for Scripted {
        fn open(&mut self) -> std::result::Result<RawFd, i32> {
            self.results.pop_front().expect("script exhausted")
        }
        fn discard(&mut self, fd: RawFd) {
            self.discarded.push(fd);
        }
        fn occupy_low_slot(&mut self) -> bool {
            self.placeholders += 1;
            self.placeholder_ok
        }
    }

    #[test]
    fn test_interrupt_is_retried() {
        let mut src = Scripted::new(vec![Err(libc::EINTR), Err(libc::EINTR), Ok(7)]);
        assert_eq!(allocate(&mut src), Ok(7));
        assert!(src.results.is_empty());
    }

    #[test]
    fn test_error_is_returned() {
        let mut src = Scripted::new(vec![Err(libc::ENOENT)]);
        assert_eq!(allocate(&mut src), Err(libc::ENOENT));
    }

    #[test]
    fn test_low_descriptors_are_skipped() {
        let mut src = Scripted::new(vec![Ok(0), Ok(2), Ok(3)]);
        assert_eq!(allocate(&mut src), Ok(3));
        assert_eq!(src.discarded, vec![0, 2]);
        assert_eq!(src.placeholders, 2);
    }

    #[test]
    fn test_placeholder_failure_fails_allocation() {
        let mut src = Scripted::new(vec![Ok(1), Ok(9)]);
        src.placeholder_ok = false;
        assert_eq!(allocate(&mut src), Err(libc::EMFILE));
        assert_eq!(src.discarded, vec![1]);
        assert_eq!(src.results.len(), 1);
    }

    #[test]
    fn test_robust_open_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fd.db");
        let fd = robust_open(
            path.to_str().unwrap(),
            libc::O_RDWR | libc::O_CREAT,
            Some(0o600),
        )
        .unwrap();
        assert!(fd >= MIN_FILE_DESCRIPTOR);
        robust_close(fd);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_robust_open_missing_file() {
        let err = robust_open("/nonexistent/dir/fd.db", libc::O_RDWR, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CantOpen);
    }
}
