//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tinyvfs::os::unix::inode::InodeRegistry;
use tinyvfs::os::unix::{PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
use tinyvfs::{OpenFlags, UnixFile, UnixVfs, VfsConfig};

/// A scratch directory plus a backend with its own inode registry
pub struct Scratch {
    pub dir: TempDir,
    pub vfs: UnixVfs,
}

impl Scratch {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = VfsConfig::default().with_temp_dir(dir.path());
        let vfs = UnixVfs::with_registry(config, Arc::new(InodeRegistry::new()));
        Self { dir, vfs }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn open(&self, name: &str) -> UnixFile {
        let path = self.path(name);
        self.vfs
            .open_file(
                Some(path.to_str().unwrap()),
                OpenFlags::CREATE | OpenFlags::READWRITE,
            )
            .unwrap()
    }
}

/// Which lock-zone range a foreign lock covers
#[derive(Debug, Clone, Copy)]
pub enum Zone {
    Pending,
    Reserved,
    Shared,
}

impl Zone {
    fn range(self) -> (i64, i64) {
        match self {
            Zone::Pending => (PENDING_BYTE, 1),
            Zone::Reserved => (RESERVED_BYTE, 1),
            Zone::Shared => (SHARED_FIRST, SHARED_SIZE),
        }
    }
}

/// Stand-in for another process
///
/// Open file description locks conflict with this process's POSIX record
/// locks even though they are taken from the same process, so they behave
/// like locks held by a different process.
#[cfg(target_os = "linux")]
pub struct ForeignLock {
    file: File,
}

#[cfg(target_os = "linux")]
impl ForeignLock {
    pub fn open(path: &Path) -> Self {
        let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        Self { file }
    }

    fn flock(kind: libc::c_short, zone: Zone) -> libc::flock {
        let (start, len) = zone.range();
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;
        lock.l_pid = 0;
        lock
    }

    fn set(&self, kind: libc::c_short, zone: Zone) -> bool {
        let lock = Self::flock(kind, zone);
        unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_OFD_SETLK, &lock) == 0 }
    }

    /// Take a read lock on `zone`; false if it conflicts
    pub fn read(&self, zone: Zone) -> bool {
        self.set(libc::F_RDLCK as libc::c_short, zone)
    }

    /// Take a write lock on `zone`; false if it conflicts
    pub fn write(&self, zone: Zone) -> bool {
        self.set(libc::F_WRLCK as libc::c_short, zone)
    }

    /// Drop whatever this stand-in holds on `zone`
    pub fn release(&self, zone: Zone) {
        assert!(self.set(libc::F_UNLCK as libc::c_short, zone));
    }

    /// True if a write lock on `zone` would conflict with someone else
    pub fn write_blocked(&self, zone: Zone) -> bool {
        let mut lock = Self::flock(libc::F_WRLCK as libc::c_short, zone);
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_OFD_GETLK, &mut lock) };
        assert_eq!(rc, 0);
        lock.l_type != libc::F_UNLCK as libc::c_short
    }

    /// True if a read lock on `zone` would conflict with someone else
    pub fn read_blocked(&self, zone: Zone) -> bool {
        let mut lock = Self::flock(libc::F_RDLCK as libc::c_short, zone);
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_OFD_GETLK, &mut lock) };
        assert_eq!(rc, 0);
        lock.l_type != libc::F_UNLCK as libc::c_short
    }
}
