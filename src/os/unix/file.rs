//! Unix file handle
//!
//! A [`UnixFile`] owns one descriptor and shares an [`InodeRecord`] with any
//! sibling handle on the same file. Closing a handle while a sibling still
//! holds a lock must not close the descriptor: POSIX drops *all* of the
//! process's record locks on an inode as soon as any descriptor for it is
//! closed. Such descriptors are parked on the inode record and closed once
//! the last lock is gone.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::config::VfsConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::os::unix::fd::robust_close;
use crate::os::unix::inode::{InodeKey, InodeRecord, InodeRegistry};
use crate::os::unix::lock::{self, HandleLock};
use crate::os::unix::{fstat_fd, get_errno, platform_fdatasync};
use crate::os::vfs::{
    ControlValue, DeviceCharacteristics, FileControlOp, LockType, OpenFlags, SyncFlags, VfsFile,
};
use crate::random;

bitflags! {
    /// Per-handle mode bits that do not affect locking
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CtrlFlags: u16 {
        const PERSIST_WAL = 0x04;
        const PSOW        = 0x10;
    }
}

#[derive(Debug, Default)]
struct HandleState {
    lock: HandleLock,
    ctrl_flags: CtrlFlags,
    chunk_size: i32,
}

/// Unix file handle
pub struct UnixFile {
    /// File descriptor
    fd: RawFd,
    /// File path
    path: String,
    /// Open flags
    flags: OpenFlags,
    /// Backend configuration
    config: Arc<VfsConfig>,
    /// Registry the inode record came from
    registry: Arc<InodeRegistry>,
    /// Lock bookkeeping shared with sibling handles
    inode: Arc<InodeRecord>,
    /// Lock level, errno and mode bits of this handle
    state: Mutex<HandleState>,
    /// Preferred I/O size of the file (st_blksize)
    sector_size: i32,
    /// Unlink on close
    delete_on_close: bool,
    /// Close already ran
    closed: bool,
}

impl std::fmt::Debug for UnixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixFile")
            .field("fd", &self.fd)
            .field("path", &self.path)
            .field("inode", &self.inode.key())
            .finish()
    }
}

impl UnixFile {
    /// Wrap an open descriptor; registers with the inode record for it
    ///
    /// On failure the descriptor is closed.
    pub(crate) fn new(
        fd: RawFd,
        path: String,
        flags: OpenFlags,
        config: Arc<VfsConfig>,
        registry: Arc<InodeRegistry>,
    ) -> Result<Self> {
        let stat = match fstat_fd(fd) {
            Ok(stat) => stat,
            Err(errno) => {
                robust_close(fd);
                return Err(Error::from_errno(ErrorCode::CantOpen, errno));
            }
        };

        let inode = registry.acquire(InodeKey::from_stat(&stat));
        let sector_size = if stat.st_blksize > 0 {
            stat.st_blksize as i32
        } else {
            4096
        };

        Ok(Self {
            fd,
            path,
            flags,
            config,
            registry,
            inode,
            state: Mutex::new(HandleState::default()),
            sector_size,
            delete_on_close: flags.contains(OpenFlags::DELETE),
            closed: false,
        })
    }

    /// Path the handle was opened with
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flags the handle was opened with
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Underlying descriptor
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Inode record shared with sibling handles
    pub fn inode(&self) -> &Arc<InodeRecord> {
        &self.inode
    }

    /// Last OS error seen by this handle
    pub fn last_errno(&self) -> i32 {
        self.state.lock().lock.last_errno
    }

    fn set_last_errno(&self, errno: i32) {
        self.state.lock().lock.last_errno = errno;
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let unlocked = lock::release(
            self.fd,
            &mut self.state.get_mut().lock,
            &self.inode,
            LockType::None,
        );

        {
            let mut inode = self.inode.lock();
            if inode.level != LockType::None {
                log::debug!(
                    "deferring close of fd {} ({}): inode held at {:?}",
                    self.fd,
                    self.path,
                    inode.level
                );
                inode.defer_close(self.fd);
            } else {
                robust_close(self.fd);
            }
        }
        self.registry.release(&self.inode);

        if self.delete_on_close {
            if let Ok(c_path) = CString::new(self.path.as_str()) {
                if unsafe { libc::unlink(c_path.as_ptr()) } != 0 {
                    log::warn!(
                        "delete-on-close of {} failed: errno {}",
                        self.path,
                        get_errno()
                    );
                }
            }
        }

        unlocked
    }

    fn size_hint(&self, size: i64) -> Result<()> {
        let chunk_size = self.state.lock().chunk_size;
        if chunk_size <= 0 {
            return Ok(());
        }

        let stat = fstat_fd(self.fd).map_err(|errno| {
            self.set_last_errno(errno);
            Error::from_errno(ErrorCode::IoErrFstat, errno)
        })?;
        let chunk = chunk_size as i64;
        let want = size
            .checked_add(chunk - 1)
            .map(|rounded| rounded / chunk * chunk)
            .ok_or_else(|| {
                Error::with_message(ErrorCode::IoErrWrite, format!("size hint {} too large", size))
            })?;
        let have = stat.st_size as i64;
        if want <= have {
            return Ok(());
        }

        match extend_file(self.fd, have, want - have) {
            Ok(()) | Err(libc::EINVAL) => Ok(()),
            Err(errno) => {
                self.set_last_errno(errno);
                Err(Error::from_errno(ErrorCode::IoErrWrite, errno))
            }
        }
    }

    fn mode_bit(&self, mask: CtrlFlags, set: Option<bool>) -> ControlValue {
        let mut state = self.state.lock();
        if let Some(on) = set {
            state.ctrl_flags.set(mask, on);
        }
        ControlValue::Bool(state.ctrl_flags.contains(mask))
    }

    fn has_moved(&self) -> bool {
        let Ok(c_path) = CString::new(self.path.as_str()) else {
            return true;
        };
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::stat(c_path.as_ptr(), &mut stat) } != 0 {
            return true;
        }
        InodeKey::from_stat(&stat) != self.inode.key()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn extend_file(fd: RawFd, offset: i64, len: i64) -> std::result::Result<(), i32> {
    loop {
        if unsafe { libc::fallocate(fd, 0, offset as libc::off_t, len as libc::off_t) } == 0 {
            return Ok(());
        }
        match get_errno() {
            libc::EINTR => continue,
            libc::EOPNOTSUPP => return ftruncate_retry(fd, offset + len),
            errno => return Err(errno),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn extend_file(fd: RawFd, offset: i64, len: i64) -> std::result::Result<(), i32> {
    ftruncate_retry(fd, offset + len)
}

fn ftruncate_retry(fd: RawFd, size: i64) -> std::result::Result<(), i32> {
    loop {
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == 0 {
            return Ok(());
        }
        match get_errno() {
            libc::EINTR => continue,
            errno => return Err(errno),
        }
    }
}

/// Write all of `buf` at `offset` through `pwrite`, resuming after partial
/// writes and interrupts
///
/// On failure returns the errno that stopped the write, or 0 when the device
/// stopped accepting bytes without reporting an error.
pub(crate) fn write_fully<F>(mut buf: &[u8], mut offset: i64, mut pwrite: F) -> std::result::Result<(), i32>
where
    F: FnMut(&[u8], i64) -> std::result::Result<usize, i32>,
{
    while !buf.is_empty() {
        match pwrite(buf, offset) {
            Ok(0) => return Err(0),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as i64;
            }
            Err(libc::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
    Ok(())
}

fn pwrite_fd(fd: RawFd, buf: &[u8], offset: i64) -> std::result::Result<usize, i32> {
    let n = unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        Err(get_errno())
    } else {
        Ok(n as usize)
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            log::warn!("closing {} on drop: {}", self.path, err);
        }
    }
}

impl VfsFile for UnixFile {
    fn close(mut self: Box<Self>) -> Result<()> {
        self.close_inner()
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<()> {
        let mut got = 0usize;
        while got < buf.len() {
            let rest = &mut buf[got..];
            let n = unsafe {
                libc::pread(
                    self.fd,
                    rest.as_mut_ptr() as *mut libc::c_void,
                    rest.len(),
                    (offset + got as i64) as libc::off_t,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                self.set_last_errno(errno);
                let code = match errno {
                    libc::ERANGE | libc::EIO | libc::ENXIO => ErrorCode::IoErrCorruptFs,
                    _ => ErrorCode::IoErrRead,
                };
                return Err(Error::from_errno(code, errno));
            }
            if n == 0 {
                break;
            }
            got += n as usize;
        }

        if got < buf.len() {
            // Reads past end of file see zeros.
            buf[got..].fill(0);
            return Err(Error::new(ErrorCode::IoErrShortRead));
        }
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<()> {
        match write_fully(buf, offset, |chunk, at| pwrite_fd(self.fd, chunk, at)) {
            Ok(()) => Ok(()),
            Err(errno) if errno != 0 && errno != libc::ENOSPC => {
                self.set_last_errno(errno);
                Err(Error::from_errno(ErrorCode::IoErrWrite, errno))
            }
            Err(_) => {
                self.set_last_errno(0);
                Err(Error::new(ErrorCode::Full))
            }
        }
    }

    fn truncate(&self, size: i64) -> Result<()> {
        ftruncate_retry(self.fd, size).map_err(|errno| {
            self.set_last_errno(errno);
            Error::from_errno(ErrorCode::IoErrTruncate, errno)
        })
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };

        if rc != 0 {
            let errno = get_errno();
            self.set_last_errno(errno);
            return Err(Error::from_errno(ErrorCode::IoErrFsync, errno));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        match fstat_fd(self.fd) {
            Ok(stat) => Ok(stat.st_size as i64),
            Err(errno) => {
                self.set_last_errno(errno);
                Err(Error::from_errno(ErrorCode::IoErrFstat, errno))
            }
        }
    }

    fn lock(&self, lock_type: LockType) -> Result<()> {
        let mut state = self.state.lock();
        lock::acquire(self.fd, &mut state.lock, &self.inode, lock_type)
    }

    fn unlock(&self, lock_type: LockType) -> Result<()> {
        let mut state = self.state.lock();
        lock::release(self.fd, &mut state.lock, &self.inode, lock_type)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        lock::reserved_lock_held(self.fd, &self.inode)
    }

    fn file_control(&self, op: FileControlOp) -> Result<ControlValue> {
        match op {
            FileControlOp::LockState => Ok(ControlValue::Lock(self.lock_type())),
            FileControlOp::LastErrno => Ok(ControlValue::Int(self.last_errno() as i64)),
            FileControlOp::ChunkSize(Some(size)) => {
                self.state.lock().chunk_size = size.max(0);
                Ok(ControlValue::Unit)
            }
            FileControlOp::ChunkSize(None) => {
                Ok(ControlValue::Int(self.state.lock().chunk_size as i64))
            }
            FileControlOp::SizeHint(size) => {
                self.size_hint(size)?;
                Ok(ControlValue::Unit)
            }
            FileControlOp::PersistWal(set) => Ok(self.mode_bit(CtrlFlags::PERSIST_WAL, set)),
            FileControlOp::PowerSafeOverwrite(set) => Ok(self.mode_bit(CtrlFlags::PSOW, set)),
            FileControlOp::VfsName => Ok(ControlValue::Text(self.config.name.clone())),
            FileControlOp::TempFilename => {
                let dir = self.config.resolve_temp_dir()?;
                let path = dir.join(random::temp_filename("tinyvfs_", ""));
                Ok(ControlValue::Text(path.to_string_lossy().into_owned()))
            }
            FileControlOp::HasMoved => Ok(ControlValue::Bool(self.has_moved())),
            FileControlOp::ExternalReader => Err(Error::with_message(
                ErrorCode::Unsupported,
                "external reader detection",
            )),
        }
    }

    fn sector_size(&self) -> i32 {
        self.sector_size
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        if self.state.lock().ctrl_flags.contains(CtrlFlags::PSOW) {
            DeviceCharacteristics::POWERSAFE_OVERWRITE
        } else {
            DeviceCharacteristics::empty()
        }
    }

    fn lock_type(&self) -> LockType {
        self.state.lock().lock.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_fully_resumes_partial_writes() {
        let mut sink = vec![0u8; 10];
        let data = b"0123456789";
        let result = write_fully(data, 0, |chunk, at| {
            let n = chunk.len().min(3);
            sink[at as usize..at as usize + n].copy_from_slice(&chunk[..n]);
            Ok(n)
        });
        assert_eq!(result, Ok(()));
        assert_eq!(&sink, data);
    }

    #[test]
    fn test_write_fully_retries_interrupts() {
        let mut calls = 0;
        let result = write_fully(b"abc", 0, |chunk, _| {
            calls += 1;
            if calls < 3 {
                Err(libc::EINTR)
            } else {
                Ok(chunk.len())
            }
        });
        assert_eq!(result, Ok(()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_write_fully_reports_out_of_space_mid_write() {
        let mut written = 0;
        let result = write_fully(&[1u8; 100], 0, |chunk, _| {
            if written == 0 {
                written = 40;
                Ok(40.min(chunk.len()))
            } else {
                Err(libc::ENOSPC)
            }
        });
        assert_eq!(result, Err(libc::ENOSPC));
    }

    #[test]
    fn test_write_fully_zero_progress() {
        assert_eq!(write_fully(b"abc", 0, |_, _| Ok(0)), Err(0));
    }

    #[test]
    fn test_ctrl_flag_values() {
        assert_eq!(CtrlFlags::PERSIST_WAL.bits(), 0x04);
        assert_eq!(CtrlFlags::PSOW.bits(), 0x10);
    }
}
