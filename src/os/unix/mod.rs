//! Unix VFS implementation
//!
//! Descriptors are handed out by [`fd`], files are identified across handles
//! by the [`inode`] registry, and the five-level lock protocol in [`lock`] is
//! mapped onto POSIX advisory record locks over a few reserved bytes of the
//! database file:
//!
//! ```text
//! offset 4              reserved byte       write-locked by the RESERVED holder
//! offsets 5 .. 5+510    shared region       read-locked by readers,
//!                                           write-locked by the EXCLUSIVE holder
//! offset 0x40000000     pending byte        taken while climbing to SHARED
//!                                           or EXCLUSIVE
//! ```
//!
//! POSIX record locks belong to the (process, inode) pair, not to a
//! descriptor, so every handle in this process that refers to one inode
//! shares one set of OS locks. The inode record tracks how many handles rely
//! on them.

pub mod fd;
pub mod file;
pub mod inode;
pub mod lock;
pub mod vfs;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::os::vfs::LockType;

pub use file::UnixFile;
pub use inode::{InodeKey, InodeRecord, InodeRegistry, InodeSnapshot};
pub use vfs::UnixVfs;

// ============================================================================
// Lock zone layout
// ============================================================================

/// Byte taken while a handle climbs towards SHARED or EXCLUSIVE
pub const PENDING_BYTE: i64 = 0x4000_0000;

/// Byte write-locked by the RESERVED holder
pub const RESERVED_BYTE: i64 = LockType::Pending as i64 + 1;

/// First byte of the shared region
pub const SHARED_FIRST: i64 = LockType::Pending as i64 + 2;

/// Length of the shared region
pub const SHARED_SIZE: i64 = 510;

/// Lowest descriptor number a database file may occupy
pub const MIN_FILE_DESCRIPTOR: RawFd = 3;

// ============================================================================
// Platform-specific helpers
// ============================================================================

/// Get errno in a cross-platform way (Linux vs macOS/BSD)
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

/// fdatasync - use fsync on platforms without fdatasync (macOS)
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

/// fstat wrapper returning errno on failure
pub(crate) fn fstat_fd(fd: RawFd) -> std::result::Result<libc::stat, i32> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(get_errno());
    }
    Ok(stat)
}

// ============================================================================
// Registration
// ============================================================================

/// Register the Unix VFS with the global registry
pub fn register_unix_vfs() {
    let unix_vfs = Arc::new(UnixVfs::new());
    crate::os::vfs::vfs_register(unix_vfs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_zone_layout() {
        assert_eq!(PENDING_BYTE, 0x40000000);
        assert_eq!(RESERVED_BYTE, 4);
        assert_eq!(SHARED_FIRST, 5);
        assert_eq!(SHARED_SIZE, 510);
        assert!(SHARED_FIRST + SHARED_SIZE < PENDING_BYTE);
    }

    #[test]
    fn test_register_unix_vfs() {
        register_unix_vfs();
        let vfs = crate::os::vfs::vfs_find(Some("unix")).unwrap();
        assert_eq!(vfs.name(), "unix");
    }
}
