use std::path::{Path, PathBuf};

/// Overrides the data directory, mostly for tests and side-by-side installs.
pub const DATA_DIR_ENV: &str = "SWITCHYARD_DATA_DIR";

/// OS-specific pieces the daemon and store need. `NativePlatform` is the
/// implementation for the current target.
pub trait Platform {
    /// Follow the daemon log, starting from its last 200 lines.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Owner-only access to the data and run directories (0o700 on Unix).
    fn restrict_dir_permissions(path: &Path);

    /// Owner-only access to the database file (0o600 on Unix).
    fn restrict_file_permissions(path: &Path);

    /// `~/.switchyard` on Unix, `%APPDATA%\switchyard` on Windows,
    /// unless `SWITCHYARD_DATA_DIR` is set.
    fn data_dir() -> PathBuf;
}

/// `SWITCHYARD_DATA_DIR` if set and non-empty, otherwise `default`.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
