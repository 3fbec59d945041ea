//! Five-level lock state machine
//!
//! A handle climbs `None -> Shared -> Reserved -> (Pending) -> Exclusive` and
//! falls back to `Shared` or `None`. Handles of one process that share an
//! inode coordinate through the [`InodeRecord`] counters; other processes are
//! kept out with non-blocking POSIX record locks (`F_SETLK`) over the lock
//! bytes described in [`crate::os::unix`]. Contention never blocks: it comes
//! back as [`ErrorCode::Busy`] and the caller decides whether to retry.
//!
//! Every transition runs with the record mutex held, so two handles on the
//! same file never interleave their steps.

use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorCode, Result};
use crate::os::unix::inode::{InodeRecord, InodeState};
use crate::os::unix::{get_errno, PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
use crate::os::vfs::LockType;

/// Lock state private to one handle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleLock {
    /// Level this handle believes it holds
    pub(crate) level: LockType,
    /// Last OS error observed by the handle
    pub(crate) last_errno: i32,
}

/// Kind of POSIX record lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeLock {
    Read,
    Write,
    Unlock,
}

impl RangeLock {
    fn l_type(self) -> libc::c_short {
        match self {
            RangeLock::Read => libc::F_RDLCK as libc::c_short,
            RangeLock::Write => libc::F_WRLCK as libc::c_short,
            RangeLock::Unlock => libc::F_UNLCK as libc::c_short,
        }
    }
}

fn flock_for(kind: RangeLock, start: i64, len: i64) -> libc::flock {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind.l_type();
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = start as libc::off_t;
    lock.l_len = len as libc::off_t;
    lock
}

/// Set or clear a record lock without waiting; returns errno on failure
pub(crate) fn set_range_lock(
    fd: RawFd,
    kind: RangeLock,
    start: i64,
    len: i64,
) -> std::result::Result<(), i32> {
    let lock = flock_for(kind, start, len);
    if unsafe { libc::fcntl(fd, libc::F_SETLK, &lock) } != 0 {
        return Err(get_errno());
    }
    Ok(())
}

/// Map a failed lock syscall's errno onto a status code
///
/// Contention (including an interrupted call) is `Busy`, `EPERM` is `Perm`,
/// anything else is the caller-supplied I/O code.
pub(crate) fn classify_lock_errno(errno: i32, io_error: ErrorCode) -> ErrorCode {
    match errno {
        libc::EACCES | libc::EAGAIN | libc::ETIMEDOUT | libc::EBUSY | libc::EINTR
        | libc::ENOLCK => ErrorCode::Busy,
        libc::EPERM => ErrorCode::Perm,
        _ => io_error,
    }
}

fn lock_error(errno: i32, io_error: ErrorCode) -> Error {
    Error::from_errno(classify_lock_errno(errno, io_error), errno)
}

fn check_transition(current: LockType, target: LockType) -> Result<()> {
    let allowed = match target {
        LockType::None | LockType::Pending => false,
        LockType::Shared => current == LockType::None,
        LockType::Reserved => current == LockType::Shared,
        LockType::Exclusive => current != LockType::None,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::with_message(
            ErrorCode::Misuse,
            format!("cannot lock {:?} from {:?}", target, current),
        ))
    }
}

/// Raise `handle` to `target`
pub(crate) fn acquire(
    fd: RawFd,
    handle: &mut HandleLock,
    inode: &InodeRecord,
    target: LockType,
) -> Result<()> {
    if handle.level >= target {
        return Ok(());
    }
    check_transition(handle.level, target)?;

    let from = handle.level;
    let mut state = inode.lock();
    let result = acquire_locked(fd, handle, &mut state, target);
    log::trace!(
        "fd {} lock {:?} -> {:?}: {:?} (inode {:?}, shared={}, locks={})",
        fd,
        from,
        target,
        result.as_ref().map_err(Error::code),
        state.level,
        state.shared_count,
        state.lock_count
    );
    result
}

fn acquire_locked(
    fd: RawFd,
    handle: &mut HandleLock,
    state: &mut InodeState,
    target: LockType,
) -> Result<()> {
    // Another handle of this process is already past SHARED, or asking for
    // more than SHARED while someone else sets the pace.
    if handle.level != state.level
        && (state.level >= LockType::Pending || target > LockType::Shared)
    {
        return Err(Error::new(ErrorCode::Busy));
    }

    // The process already holds the OS read lock on behalf of a sibling.
    if target == LockType::Shared
        && matches!(state.level, LockType::Shared | LockType::Reserved)
    {
        debug_assert_eq!(handle.level, LockType::None);
        debug_assert!(state.shared_count > 0);
        handle.level = LockType::Shared;
        state.shared_count += 1;
        state.lock_count += 1;
        return Ok(());
    }

    if target == LockType::Shared
        || (target == LockType::Exclusive && handle.level < LockType::Pending)
    {
        let kind = if target == LockType::Shared {
            RangeLock::Read
        } else {
            RangeLock::Write
        };
        if let Err(errno) = set_range_lock(fd, kind, PENDING_BYTE, 1) {
            handle.last_errno = errno;
            return Err(lock_error(errno, ErrorCode::IoErrLock));
        }
    }

    if target == LockType::Shared {
        return acquire_shared(fd, handle, state);
    }

    let result = if target == LockType::Exclusive && state.shared_count > 1 {
        // A sibling handle is still reading.
        Err(Error::new(ErrorCode::Busy))
    } else {
        debug_assert_ne!(handle.level, LockType::None);
        let (start, len) = if target == LockType::Reserved {
            (RESERVED_BYTE, 1)
        } else {
            (SHARED_FIRST, SHARED_SIZE)
        };
        set_range_lock(fd, RangeLock::Write, start, len).map_err(|errno| {
            handle.last_errno = errno;
            lock_error(errno, ErrorCode::IoErrLock)
        })
    };

    match result {
        Ok(()) => {
            handle.level = target;
            state.level = target;
            Ok(())
        }
        Err(err) => {
            // A failed EXCLUSIVE attempt stays visible as PENDING so that no
            // new readers are admitted while the writer retries.
            if target == LockType::Exclusive {
                handle.level = LockType::Pending;
                state.level = LockType::Pending;
            }
            Err(err)
        }
    }
}

/// First SHARED lock of the process: read-lock the shared region, then drop
/// the pending byte taken by the caller
fn acquire_shared(fd: RawFd, handle: &mut HandleLock, state: &mut InodeState) -> Result<()> {
    let mut result = set_range_lock(fd, RangeLock::Read, SHARED_FIRST, SHARED_SIZE).map_err(
        |errno| {
            handle.last_errno = errno;
            lock_error(errno, ErrorCode::IoErrLock)
        },
    );

    if let Err(errno) = set_range_lock(fd, RangeLock::Unlock, PENDING_BYTE, 1) {
        if result.is_ok() {
            handle.last_errno = errno;
            result = Err(Error::from_errno(ErrorCode::IoErrUnlock, errno));
        }
    }

    match &result {
        Ok(()) => {
            handle.level = LockType::Shared;
            state.level = LockType::Shared;
            state.shared_count += 1;
            state.lock_count += 1;
        }
        Err(err) if err.code() == ErrorCode::Busy => {
            // Degraded accounting: the handle is booked as a SHARED holder
            // even though the OS refused the read lock. It still reports
            // Busy and must be released with unlock(None).
            handle.level = LockType::Shared;
            state.shared_count = 1;
            state.lock_count += 1;
        }
        Err(_) => {}
    }
    result
}

/// Lower `handle` to `target` (`None` or `Shared`)
pub(crate) fn release(
    fd: RawFd,
    handle: &mut HandleLock,
    inode: &InodeRecord,
    target: LockType,
) -> Result<()> {
    if target >= handle.level {
        return Ok(());
    }
    if target > LockType::Shared {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("cannot unlock to {:?}", target),
        ));
    }

    let from = handle.level;
    let mut state = inode.lock();
    let result = release_locked(fd, handle, &mut state, target);
    log::trace!(
        "fd {} unlock {:?} -> {:?}: {:?} (inode {:?}, shared={}, locks={})",
        fd,
        from,
        target,
        result.as_ref().map_err(Error::code),
        state.level,
        state.shared_count,
        state.lock_count
    );
    result
}

fn release_locked(
    fd: RawFd,
    handle: &mut HandleLock,
    state: &mut InodeState,
    target: LockType,
) -> Result<()> {
    if handle.level > LockType::Shared {
        debug_assert_eq!(handle.level, state.level);
        if target == LockType::Shared {
            if let Err(errno) = set_range_lock(fd, RangeLock::Read, SHARED_FIRST, SHARED_SIZE) {
                handle.last_errno = errno;
                return Err(Error::from_errno(ErrorCode::IoErrReadLock, errno));
            }
        }
        let released = set_range_lock(fd, RangeLock::Unlock, RESERVED_BYTE, 1)
            .and_then(|()| set_range_lock(fd, RangeLock::Unlock, PENDING_BYTE, 1));
        if let Err(errno) = released {
            handle.last_errno = errno;
            return Err(Error::from_errno(ErrorCode::IoErrUnlock, errno));
        }
        state.level = LockType::Shared;
    }

    let mut result = Ok(());
    if target == LockType::None {
        // Degraded SHARED bookings reset the count to one, so a sibling may
        // already have taken it to zero.
        state.shared_count = state.shared_count.saturating_sub(1);
        if state.shared_count == 0 {
            if let Err(errno) = set_range_lock(fd, RangeLock::Unlock, 0, 0) {
                // The in-memory level still drops to NONE; leaving it up
                // would wedge every later acquirer.
                log::warn!("fd {} whole-file unlock failed: errno {}", fd, errno);
                handle.last_errno = errno;
                handle.level = LockType::None;
                result = Err(Error::from_errno(ErrorCode::IoErrUnlock, errno));
            }
            state.level = LockType::None;
        }

        debug_assert!(state.lock_count > 0);
        state.lock_count = state.lock_count.saturating_sub(1);
        if state.lock_count == 0 {
            state.close_pending_fds();
        }
    }

    if result.is_ok() {
        handle.level = target;
    }
    result
}

/// True if any process holds RESERVED or better on the file
pub(crate) fn reserved_lock_held(fd: RawFd, inode: &InodeRecord) -> Result<bool> {
    let state = inode.lock();
    if state.level > LockType::Shared {
        return Ok(true);
    }

    // F_GETLK only reports locks held by other processes.
    let mut probe = flock_for(RangeLock::Write, RESERVED_BYTE, 1);
    if unsafe { libc::fcntl(fd, libc::F_GETLK, &mut probe) } != 0 {
        let errno = get_errno();
        return Err(Error::from_errno(ErrorCode::IoErrLock, errno));
    }
    Ok(probe.l_type != libc::F_UNLCK as libc::c_short)
}
