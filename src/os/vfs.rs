//! Virtual File System trait and types
//!
//! This module defines the two capability interfaces of the OS layer: [`Vfs`]
//! (a backend that opens, deletes and probes files) and [`VfsFile`] (one open
//! handle with I/O and the five-level lock protocol). Concrete backends live in
//! sibling modules; the unix one is selected by default.

use crate::error::{Error, ErrorCode, Result};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// Flags and Enums
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const EXCLUSIVE     = 0x00000001;
        const CREATE        = 0x00000002;
        const READONLY      = 0x00000004;
        const READWRITE     = 0x00000008;
        const DELETE        = 0x00000010;
        const SUPER_JOURNAL = 0x00000100;
        const MAIN_JOURNAL  = 0x00000200;
        const MAIN_WAL      = 0x00000400;
    }
}

impl OpenFlags {
    /// Mask of the file-role tags
    pub const ROLE_MASK: OpenFlags = OpenFlags::SUPER_JOURNAL
        .union(OpenFlags::MAIN_JOURNAL)
        .union(OpenFlags::MAIN_WAL);

    /// True when this open creates a fresh journal or WAL file
    pub fn is_new_journal(self) -> bool {
        self.contains(OpenFlags::CREATE) && self.intersects(Self::ROLE_MASK)
    }
}

/// What [`Vfs::access`] should check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AccessMode {
    /// The file exists
    Exists = 0,
    /// The file is readable
    Read = 1,
    /// The file is readable and writable
    ReadWrite = 2,
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }
}

bitflags! {
    /// Device characteristics flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                  = 0x00000001;
        const SAFE_APPEND             = 0x00000200;
        const SEQUENTIAL              = 0x00000400;
        const UNDELETABLE_WHEN_OPEN   = 0x00000800;
        const POWERSAFE_OVERWRITE     = 0x00001000;
        const IMMUTABLE               = 0x00002000;
    }
}

/// File lock levels
///
/// The integer values are shared with every other implementation that locks
/// the same files; the lock byte offsets are derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum LockType {
    /// No lock held
    #[default]
    None = 0,
    /// Shared lock (multiple readers)
    Shared = 1,
    /// Reserved lock (intend to write, readers still allowed)
    Reserved = 2,
    /// Pending lock (exclusive requested, new readers refused)
    Pending = 3,
    /// Exclusive lock (single writer)
    Exclusive = 4,
}

impl LockType {
    /// Numeric lock code
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Look up a lock level by its numeric code
    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            0 => Some(LockType::None),
            1 => Some(LockType::Shared),
            2 => Some(LockType::Reserved),
            3 => Some(LockType::Pending),
            4 => Some(LockType::Exclusive),
            _ => None,
        }
    }
}

/// File control operations
///
/// `Option` arguments follow a query-or-set convention: `None` reads the
/// current value, `Some` changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileControlOp {
    /// Get the handle's current lock level
    LockState,
    /// Get the last OS error number seen by the handle
    LastErrno,
    /// Query or set the allocation chunk size
    ChunkSize(Option<i32>),
    /// Hint about expected file size
    SizeHint(i64),
    /// Query or set the persist-WAL bit
    PersistWal(Option<bool>),
    /// Query or set the power-safe-overwrite bit
    PowerSafeOverwrite(Option<bool>),
    /// Get the backend name
    VfsName,
    /// Get a fresh temporary file name
    TempFilename,
    /// Check whether the file has been renamed or unlinked under us
    HasMoved,
    /// Check for readers outside the lock protocol
    ExternalReader,
}

/// Value produced by a file control operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    /// The operation has no result
    Unit,
    /// Integer result
    Int(i64),
    /// Boolean result
    Bool(bool),
    /// Text result
    Text(String),
    /// Lock level result
    Lock(LockType),
}

// ============================================================================
// VFS File Trait
// ============================================================================

/// File handle abstraction
///
/// Each backend provides a concrete type implementing this trait. A handle
/// owns one descriptor; dropping it without calling [`VfsFile::close`] still
/// releases its locks.
pub trait VfsFile: Send + Sync {
    /// Release every lock and close the handle
    fn close(self: Box<Self>) -> Result<()>;

    /// Read `buf.len()` bytes at the given offset
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<()>;

    /// Write all of `buf` at the given offset
    fn write(&self, buf: &[u8], offset: i64) -> Result<()>;

    /// Truncate file to the given size
    fn truncate(&self, size: i64) -> Result<()>;

    /// Sync file to disk
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Get file size
    fn file_size(&self) -> Result<i64>;

    /// Raise the lock to at least `lock_type`
    fn lock(&self, lock_type: LockType) -> Result<()>;

    /// Lower the lock to at most `lock_type` (`None` or `Shared`)
    fn unlock(&self, lock_type: LockType) -> Result<()>;

    /// Check if a reserved lock is held by any connection
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Out-of-band control operations
    fn file_control(&self, op: FileControlOp) -> Result<ControlValue>;

    /// Get sector size for this file
    fn sector_size(&self) -> i32 {
        4096
    }

    /// Get device characteristics
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Current lock level of this handle
    fn lock_type(&self) -> LockType;
}

// ============================================================================
// VFS Trait
// ============================================================================

/// Virtual File System - platform abstraction
pub trait Vfs: Send + Sync {
    /// VFS name (e.g., "unix")
    fn name(&self) -> &str;

    /// Maximum pathname length supported
    fn max_pathname(&self) -> usize {
        512
    }

    /// Open a file; `None` opens an anonymous temporary file
    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    /// Delete a file
    fn delete(&self, path: &str, sync_dir: bool) -> Result<()>;

    /// Check if file exists/is accessible
    fn access(&self, path: &str, mode: AccessMode) -> Result<bool>;

    /// Get full pathname from relative path
    fn full_pathname(&self, path: &str) -> Result<String>;

    /// Open a dynamic library
    fn dlopen(&self, _path: &str) -> Result<usize> {
        Err(Error::with_message(
            ErrorCode::Unsupported,
            "dynamic loading not supported",
        ))
    }

    /// Get last dynamic library error
    fn dlerror(&self) -> Result<String> {
        Err(Error::new(ErrorCode::Unsupported))
    }

    /// Get symbol from dynamic library
    fn dlsym(&self, _handle: usize, _symbol: &str) -> Result<usize> {
        Err(Error::new(ErrorCode::Unsupported))
    }

    /// Close dynamic library
    fn dlclose(&self, _handle: usize) -> Result<()> {
        Err(Error::new(ErrorCode::Unsupported))
    }

    /// Fill buffer with random bytes, returns the number of bytes produced
    fn randomness(&self, buf: &mut [u8]) -> usize;

    /// Sleep for specified microseconds, returns actual sleep time
    fn sleep(&self, microseconds: u64) -> u64;

    /// Get current time as Julian day number
    fn current_time(&self) -> f64;

    /// Get current time as milliseconds since the Julian epoch
    fn current_time_i64(&self) -> i64;

    /// Get last OS error
    fn get_last_error(&self) -> (i32, String);
}

// ============================================================================
// VFS Registry
// ============================================================================

/// Registry of pluggable backends
pub struct VfsRegistry {
    /// List of registered VFS implementations
    vfs_list: Vec<Arc<dyn Vfs>>,
    /// Default VFS to use when none specified
    default_vfs: Option<Arc<dyn Vfs>>,
}

impl VfsRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            vfs_list: Vec::new(),
            default_vfs: None,
        }
    }

    /// Register a VFS implementation
    pub fn register(&mut self, vfs: Arc<dyn Vfs>, make_default: bool) {
        let name = vfs.name().to_string();

        // Replace any existing VFS with the same name
        self.vfs_list.retain(|v| v.name() != name);
        let was_default = self
            .default_vfs
            .as_ref()
            .is_some_and(|v| v.name() == name);

        if make_default || was_default || self.default_vfs.is_none() {
            self.default_vfs = Some(vfs.clone());
        }

        self.vfs_list.push(vfs);
    }

    /// Unregister a VFS by name
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let before = self.vfs_list.len();
        self.vfs_list.retain(|v| v.name() != name);
        if self.vfs_list.len() == before {
            return Err(Error::with_message(ErrorCode::NotFound, name));
        }

        let was_default = self
            .default_vfs
            .as_ref()
            .is_some_and(|v| v.name() == name);
        if was_default {
            self.default_vfs = self.vfs_list.first().cloned();
        }

        Ok(())
    }

    /// Find a VFS by name, or return default if name is None
    pub fn find(&self, name: Option<&str>) -> Option<Arc<dyn Vfs>> {
        match name {
            None => self.default_vfs.clone(),
            Some(name) => self.vfs_list.iter().find(|v| v.name() == name).cloned(),
        }
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.vfs_list.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.vfs_list.is_empty()
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref VFS_REGISTRY: Mutex<VfsRegistry> = Mutex::new(VfsRegistry::new());
}

// ============================================================================
// Public API Functions
// ============================================================================

/// Find a VFS by name (or return default)
pub fn vfs_find(name: Option<&str>) -> Option<Arc<dyn Vfs>> {
    VFS_REGISTRY.lock().find(name)
}

/// Register a VFS
pub fn vfs_register(vfs: Arc<dyn Vfs>, make_default: bool) {
    VFS_REGISTRY.lock().register(vfs, make_default)
}

/// Unregister a VFS by name
pub fn vfs_unregister(name: &str) -> Result<()> {
    VFS_REGISTRY.lock().unregister(name)
}

// ============================================================================
// OS Layer Functions
// ============================================================================

/// Initialize the OS layer: register the platform backend as default
pub fn os_init() -> Result<()> {
    #[cfg(unix)]
    {
        crate::os::unix::register_unix_vfs();
    }

    Ok(())
}

/// Open a file using a VFS
pub fn os_open(vfs: &dyn Vfs, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
    vfs.open(path, flags)
}

/// Delete a file using a VFS
pub fn os_delete(vfs: &dyn Vfs, path: &str, sync_dir: bool) -> Result<()> {
    vfs.delete(path, sync_dir)
}

/// Check file access using a VFS
pub fn os_access(vfs: &dyn Vfs, path: &str, mode: AccessMode) -> Result<bool> {
    vfs.access(path, mode)
}

/// Get full pathname using a VFS
pub fn os_full_pathname(vfs: &dyn Vfs, path: &str) -> Result<String> {
    vfs.full_pathname(path)
}

// ============================================================================
// Tests
// ============================================================================
