//! Per-inode lock bookkeeping shared by every handle in the process
//!
//! Two handles opened on the same file (through different paths, hard links,
//! or simply two opens) share one [`InodeRecord`], found through the
//! [`InodeRegistry`] by the `(st_dev, st_ino)` pair. The record counts how
//! many handles hold SHARED or better, remembers the strongest level this
//! process holds against other processes, and keeps descriptors whose close
//! had to be postponed.
//!
//! Lock order: the registry mutex may be held while taking a record mutex,
//! never the other way around.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::os::unix::fd::robust_close;
use crate::os::vfs::LockType;

/// OS identity of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    /// Device id (`st_dev`)
    pub dev: u64,
    /// File serial number (`st_ino`)
    pub ino: u64,
}

impl InodeKey {
    /// Key from a stat buffer
    pub fn from_stat(stat: &libc::stat) -> Self {
        Self {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        }
    }
}

/// Mutable part of an inode record, guarded by the record mutex
#[derive(Debug, Default)]
pub(crate) struct InodeState {
    /// Handles holding at least SHARED
    pub(crate) shared_count: u32,
    /// Handles holding any lock; pending closes wait for this to reach zero
    pub(crate) lock_count: u32,
    /// Level this process holds against other processes
    pub(crate) level: LockType,
    /// Live handles referring to this record
    pub(crate) ref_count: u32,
    /// Descriptors whose close was deferred
    pending_fds: Vec<RawFd>,
    /// Set once the record has left the registry
    retired: bool,
}

impl InodeState {
    /// Queue a descriptor to be closed once no lock depends on it
    pub(crate) fn defer_close(&mut self, fd: RawFd) {
        self.pending_fds.push(fd);
    }

    /// Close every queued descriptor
    pub(crate) fn close_pending_fds(&mut self) {
        close_all(self.take_pending_fds());
    }

    /// Move the queued descriptors out, leaving the queue empty
    fn take_pending_fds(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.pending_fds)
    }
}

fn close_all(fds: Vec<RawFd>) {
    if fds.is_empty() {
        return;
    }
    log::debug!("closing {} deferred descriptor(s)", fds.len());
    for fd in fds {
        robust_close(fd);
    }
}

/// Point-in-time copy of an inode record's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeSnapshot {
    /// Handles holding at least SHARED
    pub shared_count: u32,
    /// Handles holding any lock
    pub lock_count: u32,
    /// Level held against other processes
    pub level: LockType,
    /// Live handles
    pub ref_count: u32,
    /// Descriptors waiting to be closed
    pub pending_fds: usize,
}

/// Lock state shared by all handles on one file
#[derive(Debug)]
pub struct InodeRecord {
    key: InodeKey,
    state: Mutex<InodeState>,
}

impl InodeRecord {
    fn new(key: InodeKey) -> Self {
        Self {
            key,
            state: Mutex::new(InodeState::default()),
        }
    }

    /// The file identity this record stands for
    pub fn key(&self) -> InodeKey {
        self.key
    }

    /// Take the record mutex
    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> InodeSnapshot {
        let state = self.state.lock();
        InodeSnapshot {
            shared_count: state.shared_count,
            lock_count: state.lock_count,
            level: state.level,
            ref_count: state.ref_count,
            pending_fds: state.pending_fds.len(),
        }
    }
}

impl Drop for InodeRecord {
    fn drop(&mut self) {
        self.state.get_mut().close_pending_fds();
    }
}

/// Process-wide table of inode records
#[derive(Debug, Default)]
pub struct InodeRegistry {
    records: Mutex<Vec<Arc<InodeRecord>>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<InodeRegistry> = Arc::new(InodeRegistry::new());
}

impl InodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// The registry shared by every backend that does not bring its own
    ///
    /// Advisory locks are per process, so all handles in a process should
    /// normally go through this one.
    pub fn global() -> Arc<InodeRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Look up the record for `key`, inserting a fresh one if absent
    ///
    /// The reference count is left alone.
    pub fn find_or_create(&self, key: InodeKey) -> Arc<InodeRecord> {
        let mut records = self.records.lock();
        if let Some(record) = records.iter().find(|r| r.key == key) {
            return record.clone();
        }
        let record = Arc::new(InodeRecord::new(key));
        records.push(record.clone());
        record
    }

    /// Look up the record for `key` and count one more reference to it
    pub fn acquire(&self, key: InodeKey) -> Arc<InodeRecord> {
        loop {
            let record = self.find_or_create(key);
            let mut state = record.lock();
            // A concurrent release may have dropped the last reference
            // between the lookup and here.
            if state.retired {
                continue;
            }
            state.ref_count += 1;
            drop(state);
            return record;
        }
    }

    /// Drop one reference; the record leaves the table at zero
    pub fn release(&self, record: &Arc<InodeRecord>) {
        let mut records = self.records.lock();
        let mut state = record.lock();
        debug_assert!(state.ref_count > 0);
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            return;
        }

        state.retired = true;
        let pending = state.take_pending_fds();
        drop(state);
        records.retain(|r| !Arc::ptr_eq(r, record));
        drop(records);

        close_all(pending);
        log::debug!(
            "released inode record dev={} ino={}",
            record.key.dev,
            record.key.ino
        );
    }

    /// Find an existing record without creating one
    pub fn get(&self, key: InodeKey) -> Option<Arc<InodeRecord>> {
        self.records.lock().iter().find(|r| r.key == key).cloned()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when no file is open through this registry
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
