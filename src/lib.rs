//! tinyvfs - Unix OS layer for an embedded SQL engine
//!
//! File handles with a five-level advisory lock protocol built on POSIX
//! record locks, an in-process inode registry that makes those locks work
//! across handles on the same file, and a backend facade for opening,
//! deleting and probing files.

pub mod config;
pub mod error;
pub mod os;
pub mod random;

pub use config::VfsConfig;
pub use error::{Error, ErrorCode, Result};
pub use os::vfs::{
    os_init, vfs_find, vfs_register, vfs_unregister, AccessMode, ControlValue, FileControlOp,
    LockType, OpenFlags, Vfs, VfsFile,
};

#[cfg(unix)]
pub use os::unix::{UnixFile, UnixVfs};
