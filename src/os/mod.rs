//! OS abstraction layer: backend traits and the Unix implementation

pub mod vfs;

#[cfg(unix)]
pub mod unix;
