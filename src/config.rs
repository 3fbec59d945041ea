//! Backend configuration
//!
//! A [`VfsConfig`] is handed to a backend when it is constructed. Defaults
//! match what the engine expects from the stock unix backend; a few knobs can
//! be overridden from the environment with [`VfsConfig::from_env`].

use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorCode, Result};

/// Environment variable naming the preferred temporary directory
pub const ENV_TMPDIR: &str = "TINYVFS_TMPDIR";

/// Environment variable overriding the maximum pathname length
pub const ENV_MAX_PATHNAME: &str = "TINYVFS_MAX_PATHNAME";

/// Fallback temporary directories, tried in order
const TEMP_DIR_CANDIDATES: &[&str] = &["/dev/shm", "/var/tmp", "/usr/tmp", "/tmp", "."];

/// Configuration for a backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsConfig {
    /// Name the backend registers under
    pub name: String,
    /// Maximum pathname length accepted by `full_pathname`
    pub max_pathname: usize,
    /// Permission bits applied to newly created files
    pub default_permission: u32,
    /// Directory for anonymous temporary files; searched for when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            name: "unix".to_string(),
            max_pathname: 512,
            default_permission: 0o644,
            temp_dir: None,
        }
    }
}

impl VfsConfig {
    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_TMPDIR) {
            config.temp_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = std::env::var(ENV_MAX_PATHNAME)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&v| v > 0)
        {
            config.max_pathname = max;
        }
        config
    }

    /// Set the backend name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the maximum pathname length
    pub fn with_max_pathname(mut self, max_pathname: usize) -> Self {
        self.max_pathname = max_pathname;
        self
    }

    /// Set the permission bits for newly created files
    pub fn with_default_permission(mut self, mode: u32) -> Self {
        self.default_permission = mode & 0o7777;
        self
    }

    /// Pin the temporary directory
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Resolve the directory used for temporary files
    ///
    /// An explicitly configured directory wins; otherwise `$TMPDIR` and a
    /// fixed list of well-known locations are tried. The first existing
    /// directory we can write to is used.
    pub fn resolve_temp_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.temp_dir {
            if usable_dir(dir) {
                return Ok(dir.clone());
            }
            return Err(Error::with_message(
                ErrorCode::IoErrGetTempPath,
                dir.display().to_string(),
            ));
        }

        let env_dirs = [ENV_TMPDIR, "TMPDIR"]
            .into_iter()
            .filter_map(std::env::var_os)
            .map(PathBuf::from);
        let fixed = TEMP_DIR_CANDIDATES.iter().map(PathBuf::from);

        env_dirs
            .chain(fixed)
            .find(|dir| usable_dir(dir))
            .ok_or_else(|| Error::new(ErrorCode::IoErrGetTempPath))
    }
}

fn usable_dir(dir: &Path) -> bool {
    let meta = match std::fs::metadata(dir) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    meta.is_dir() && !meta.permissions().readonly()
}
