mod common;

use std::os::unix::io::RawFd;

use common::Scratch;
use tinyvfs::{LockType, VfsFile};

fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[test]
fn test_close_under_sibling_lock_is_deferred() {
    let scratch = Scratch::new();
    let h1 = scratch.open("deferred.db");
    let h2 = scratch.open("deferred.db");
    let record = h1.inode().clone();
    let h2_fd = h2.raw_fd();

    h1.lock(LockType::Shared).unwrap();
    h1.lock(LockType::Reserved).unwrap();
    h1.lock(LockType::Exclusive).unwrap();

    Box::new(h2).close().unwrap();
    let snap = record.snapshot();
    assert_eq!(snap.pending_fds, 1);
    assert_eq!(snap.ref_count, 1);
    assert!(fd_is_open(h2_fd));

    h1.write(b"still exclusive", 0).unwrap();
    assert_eq!(h1.lock_type(), LockType::Exclusive);

    h1.unlock(LockType::None).unwrap();
    let snap = record.snapshot();
    assert_eq!(snap.pending_fds, 0);
    assert_eq!(snap.lock_count, 0);
}

#[test]
fn test_close_without_locks_is_immediate() {
    let scratch = Scratch::new();
    let h1 = scratch.open("immediate.db");
    let h2 = scratch.open("immediate.db");
    Box::new(h2).close().unwrap();
    let snap = h1.inode().snapshot();
    assert_eq!(snap.pending_fds, 0);
    assert_eq!(snap.ref_count, 1);
}

#[test]
fn test_close_of_locked_handle_releases_and_defers() {
    let scratch = Scratch::new();
    let h1 = scratch.open("both.db");
    let h2 = scratch.open("both.db");
    let record = h1.inode().clone();
    let h2_fd = h2.raw_fd();

    h1.lock(LockType::Shared).unwrap();
    h2.lock(LockType::Shared).unwrap();

    // h2 gives up its share, but h1 still reads through the process lock.
    Box::new(h2).close().unwrap();
    let snap = record.snapshot();
    assert_eq!(snap.shared_count, 1);
    assert_eq!(snap.lock_count, 1);
    assert_eq!(snap.pending_fds, 1);
    assert!(fd_is_open(h2_fd));

    Box::new(h1).close().unwrap();
    let snap = record.snapshot();
    assert_eq!(snap.pending_fds, 0);
    assert_eq!(snap.ref_count, 0);
}

#[test]
fn test_last_handle_close_flushes_pending() {
    let scratch = Scratch::new();
    let h1 = scratch.open("flush.db");
    let h2 = scratch.open("flush.db");
    let record = h1.inode().clone();
    let h2_fd = h2.raw_fd();

    h1.lock(LockType::Shared).unwrap();
    drop(h2);
    assert!(fd_is_open(h2_fd));
    assert_eq!(record.snapshot().pending_fds, 1);

    drop(h1);
    assert_eq!(record.snapshot().pending_fds, 0);
    assert!(scratch.vfs.registry().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn test_deferred_close_keeps_process_lock() {
    use crate::common::{ForeignLock, Zone};

    let scratch = Scratch::new();
    let h1 = scratch.open("kept.db");
    let h2 = scratch.open("kept.db");
    let other = ForeignLock::open(&scratch.path("kept.db"));

    h1.lock(LockType::Shared).unwrap();
    h1.lock(LockType::Reserved).unwrap();
    h1.lock(LockType::Exclusive).unwrap();
    assert!(other.write_blocked(Zone::Shared));

    // Closing h2's descriptor now would drop h1's exclusive lock.
    Box::new(h2).close().unwrap();
    assert!(other.write_blocked(Zone::Shared));
    assert!(other.read_blocked(Zone::Shared));

    h1.unlock(LockType::None).unwrap();
    assert!(!other.write_blocked(Zone::Shared));
}
