//! Error types and Result aliases for tinyvfs
//!
//! Every OS-layer operation reports a status code. Success is `Ok(..)`; any
//! other status travels as an [`Error`] carrying its [`ErrorCode`]. The
//! numeric values are part of the on-the-wire contract with the engine above
//! and must not be renumbered.

use std::fmt;

/// Status codes returned by the OS layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success
    Ok = 0,
    /// Generic I/O failure
    IoErr = 1,
    /// write(2) failed
    IoErrWrite = 2,
    /// read(2) failed
    IoErrRead = 3,
    /// Read returned fewer bytes than requested (tail zero-filled)
    IoErrShortRead = 4,
    /// ftruncate(2) failed
    IoErrTruncate = 5,
    /// fsync(2) failed
    IoErrFsync = 6,
    /// fstat(2) failed
    IoErrFstat = 7,
    /// Sector size could not be determined
    IoErrSectorSize = 8,
    /// unlink(2) failed
    IoErrDelete = 9,
    /// The underlying storage reported corruption
    IoErrCorruptFs = 10,
    /// No usable temporary directory
    IoErrGetTempPath = 11,
    /// unlink(2) on a file that does not exist
    IoErrDeleteNoEntry = 12,
    /// Advisory lock request failed for a non-contention reason
    IoErrLock = 13,
    /// Re-asserting the shared read lock during a downgrade failed
    IoErrReadLock = 14,
    /// Releasing an advisory lock failed
    IoErrUnlock = 15,
    /// Lookup of a named item (backend, opcode) failed
    NotFound = 0x10,
    /// The file could not be opened
    CantOpen = 0x11,
    /// The device is out of space
    Full = 0x12,
    /// The backend does not provide this capability
    Unsupported = 0x13,
    /// A lock transition was requested that the protocol never allows
    Misuse = 0x14,
    /// Lock contention; the caller may retry
    Busy = 100,
    /// The OS refused the operation outright (EPERM)
    Perm = 101,
}

impl ErrorCode {
    /// Numeric status value
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Look up a code by its numeric status value
    pub fn from_i32(code: i32) -> Option<Self> {
        let code = match code {
            0 => ErrorCode::Ok,
            1 => ErrorCode::IoErr,
            2 => ErrorCode::IoErrWrite,
            3 => ErrorCode::IoErrRead,
            4 => ErrorCode::IoErrShortRead,
            5 => ErrorCode::IoErrTruncate,
            6 => ErrorCode::IoErrFsync,
            7 => ErrorCode::IoErrFstat,
            8 => ErrorCode::IoErrSectorSize,
            9 => ErrorCode::IoErrDelete,
            10 => ErrorCode::IoErrCorruptFs,
            11 => ErrorCode::IoErrGetTempPath,
            12 => ErrorCode::IoErrDeleteNoEntry,
            13 => ErrorCode::IoErrLock,
            14 => ErrorCode::IoErrReadLock,
            15 => ErrorCode::IoErrUnlock,
            0x10 => ErrorCode::NotFound,
            0x11 => ErrorCode::CantOpen,
            0x12 => ErrorCode::Full,
            0x13 => ErrorCode::Unsupported,
            0x14 => ErrorCode::Misuse,
            100 => ErrorCode::Busy,
            101 => ErrorCode::Perm,
            _ => return None,
        };
        Some(code)
    }

    /// True for the transient contention status
    pub fn is_busy(self) -> bool {
        self == ErrorCode::Busy
    }

    /// Short English description of the code
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::IoErrWrite => "write failed",
            ErrorCode::IoErrRead => "read failed",
            ErrorCode::IoErrShortRead => "short read",
            ErrorCode::IoErrTruncate => "truncate failed",
            ErrorCode::IoErrFsync => "fsync failed",
            ErrorCode::IoErrFstat => "fstat failed",
            ErrorCode::IoErrSectorSize => "cannot determine sector size",
            ErrorCode::IoErrDelete => "delete failed",
            ErrorCode::IoErrCorruptFs => "filesystem reported corruption",
            ErrorCode::IoErrGetTempPath => "no usable temporary directory",
            ErrorCode::IoErrDeleteNoEntry => "no such file to delete",
            ErrorCode::IoErrLock => "advisory lock failed",
            ErrorCode::IoErrReadLock => "shared lock re-assert failed",
            ErrorCode::IoErrUnlock => "advisory unlock failed",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::CantOpen => "unable to open file",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::Unsupported => "operation not supported",
            ErrorCode::Misuse => "bad lock transition",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Perm => "access permission denied",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// OS-layer error: a status code plus optional detail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl Error {
    /// Create an error with just a code
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error with a code and a detail message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Create an error whose detail is the text of an OS errno
    pub fn from_errno(code: ErrorCode, errno: i32) -> Self {
        Self::with_message(code, std::io::Error::from_raw_os_error(errno).to_string())
    }

    /// The status code
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The detail message, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

/// Result type alias for OS-layer operations
pub type Result<T> = std::result::Result<T, Error>;
