//! Unix backend facade
//!
//! [`UnixVfs`] turns open requests into [`UnixFile`] handles and provides the
//! path-level helpers (delete, access, full pathname) plus the randomness,
//! sleep and clock probes the engine expects from a backend.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::config::VfsConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::os::unix::fd::{robust_close, robust_open};
use crate::os::unix::file::UnixFile;
use crate::os::unix::get_errno;
use crate::os::unix::inode::InodeRegistry;
use crate::os::vfs::{AccessMode, OpenFlags, Vfs, VfsFile};
use crate::random;

/// Julian day number of the Unix epoch
const UNIX_EPOCH_JD: f64 = 2440587.5;

/// Milliseconds from the Julian epoch to the Unix epoch
const UNIX_EPOCH_JD_MS: i64 = 210866760000000;

/// Unix VFS implementation
#[derive(Debug)]
pub struct UnixVfs {
    config: Arc<VfsConfig>,
    registry: Arc<InodeRegistry>,
}

impl UnixVfs {
    /// Create a new Unix VFS with the default configuration
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    /// Create a Unix VFS that uses the process-wide inode registry
    pub fn with_config(config: VfsConfig) -> Self {
        Self::with_registry(config, InodeRegistry::global())
    }

    /// Create a Unix VFS with its own inode registry
    ///
    /// Handles opened through different registries do not see each other's
    /// locks; only use this when the files involved are disjoint.
    pub fn with_registry(config: VfsConfig, registry: Arc<InodeRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Backend configuration
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// Inode registry handles are attached to
    pub fn registry(&self) -> &Arc<InodeRegistry> {
        &self.registry
    }

    /// Open a file and return the concrete handle
    pub fn open_file(&self, path: Option<&str>, flags: OpenFlags) -> Result<UnixFile> {
        let (path, flags) = match path {
            Some(path) => (path.to_string(), flags),
            None => {
                let dir = self.config.resolve_temp_dir()?;
                let name = random::temp_filename("tinyvfs_", ".tmp");
                let path = dir.join(name).to_string_lossy().into_owned();
                let flags = flags
                    | OpenFlags::CREATE
                    | OpenFlags::EXCLUSIVE
                    | OpenFlags::DELETE
                    | OpenFlags::READWRITE;
                (path, flags.difference(OpenFlags::READONLY))
            }
        };

        let mut oflags: libc::c_int = 0;
        if flags.contains(OpenFlags::READWRITE) {
            oflags |= libc::O_RDWR;
        } else {
            oflags |= libc::O_RDONLY;
        }
        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }

        let mode = flags
            .contains(OpenFlags::CREATE)
            .then_some(self.config.default_permission);
        let fd = robust_open(&path, oflags, mode)?;

        if flags.is_new_journal() {
            log::debug!("opened new journal {} as fd {}", path, fd);
        }

        UnixFile::new(fd, path, flags, self.config.clone(), self.registry.clone())
    }

    fn sync_directory(path: &str) {
        let dir = match Path::new(path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let Some(dir) = dir.to_str() else {
            return;
        };
        let Ok(fd) = robust_open(dir, libc::O_RDONLY, None) else {
            return;
        };
        if unsafe { libc::fsync(fd) } != 0 {
            log::warn!("fsync of directory {} failed: errno {}", dir, get_errno());
        }
        robust_close(fd);
    }

    fn urandom(buf: &mut [u8]) -> Option<usize> {
        let fd: RawFd = robust_open("/dev/urandom", libc::O_RDONLY, None).ok()?;
        let mut got = 0usize;
        while got < buf.len() {
            let rest = &mut buf[got..];
            let n = unsafe { libc::read(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len()) };
            if n < 0 && get_errno() == libc::EINTR {
                continue;
            }
            if n <= 0 {
                break;
            }
            got += n as usize;
        }
        robust_close(fd);
        (got == buf.len()).then_some(got)
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn max_pathname(&self) -> usize {
        self.config.max_pathname
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        Ok(Box::new(self.open_file(path, flags)?))
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::IoErrDelete))?;
        if unsafe { libc::unlink(c_path.as_ptr()) } != 0 {
            let errno = get_errno();
            let code = if errno == libc::ENOENT {
                ErrorCode::IoErrDeleteNoEntry
            } else {
                ErrorCode::IoErrDelete
            };
            return Err(Error::from_errno(code, errno));
        }

        if sync_dir {
            Self::sync_directory(path);
        }
        Ok(())
    }

    fn access(&self, path: &str, mode: AccessMode) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let mode = match mode {
            AccessMode::Exists => libc::F_OK,
            AccessMode::Read => libc::R_OK,
            AccessMode::ReadWrite => libc::R_OK | libc::W_OK,
        };
        Ok(unsafe { libc::access(c_path.as_ptr(), mode) } == 0)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        let full = if path.starts_with('/') {
            path.to_string()
        } else {
            let cwd = std::env::current_dir()
                .map_err(|e| Error::with_message(ErrorCode::IoErr, e.to_string()))?;
            cwd.join(path).to_string_lossy().into_owned()
        };

        if full.len() > self.config.max_pathname {
            return Err(Error::with_message(ErrorCode::CantOpen, "path too long"));
        }
        Ok(full)
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        buf.fill(0);
        if let Some(n) = Self::urandom(buf) {
            return n;
        }

        // No /dev/urandom: fall back to the clock and the pid.
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let pid = std::process::id();
        let seed = now
            .to_le_bytes()
            .into_iter()
            .chain(pid.to_le_bytes())
            .collect::<Vec<u8>>();
        let n = seed.len().min(buf.len());
        buf[..n].copy_from_slice(&seed[..n]);
        n
    }

    fn sleep(&self, microseconds: u64) -> u64 {
        std::thread::sleep(std::time::Duration::from_micros(microseconds));
        microseconds
    }

    fn current_time(&self) -> f64 {
        let ms = chrono::Utc::now().timestamp_millis();
        UNIX_EPOCH_JD + (ms as f64 / 86_400_000.0)
    }

    fn current_time_i64(&self) -> i64 {
        UNIX_EPOCH_JD_MS + chrono::Utc::now().timestamp_millis()
    }

    fn get_last_error(&self) -> (i32, String) {
        let errno = get_errno();
        let msg = std::io::Error::from_raw_os_error(errno).to_string();
        (errno, msg)
    }
}
