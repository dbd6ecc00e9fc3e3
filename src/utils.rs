//! Utility functions for directory management and durable file writes
//!
//! Default locations follow the XDG Base Directory specification. They are
//! only defaults: every component receives its paths explicitly through
//! [`crate::config::AppConfig`].
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/hostwall/` - Configuration (`config.json`)
//! - State: `~/.local/state/hostwall/` - Snapshot, log file, audit log

use directories::ProjectDirs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "hostwall", "hostwall").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "hostwall", "hostwall")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` (and parents) with owner-only permissions on Unix.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Writes `contents` to `path` atomically.
///
/// 1. Writes to a temporary file in the same directory.
/// 2. Sets restrictive permissions (0o600) before any data is written.
/// 3. Flushes to disk and atomically renames onto the target.
///
/// A reader never observes a partially written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;

    Ok(())
}
