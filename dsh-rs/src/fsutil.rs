//! Filesystem primitives used by the path table, the document store and the
//! temp-root reset.

use std::fs;
use std::path::Path;

use crate::error::{Result, ShellError};

pub fn file_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_file()
}

pub fn dir_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_dir()
}

/// Create `path` and any missing parents.
pub fn create_path(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|e| ShellError::io(path, e))
}

/// Remove everything inside `path`, keeping the directory itself.
pub fn clear_path(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let entries = fs::read_dir(path).map_err(|e| ShellError::io(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ShellError::io(path, e))?;
        let child = entry.path();
        let removed = if child.is_dir() {
            fs::remove_dir_all(&child)
        } else {
            fs::remove_file(&child)
        };
        removed.map_err(|e| ShellError::io(&child, e))?;
    }
    Ok(())
}

/// Ensure `path` exists and is empty.
pub fn reset_path(path: impl AsRef<Path>) -> Result<()> {
    create_path(&path)?;
    clear_path(&path)
}

/// Remove `path` recursively.  Missing paths are not an error.
pub fn remove_path(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| ShellError::io(path, e))
}

/// Normalise a path string: forward slashes, no doubled or trailing slash.
///
/// A lone `/` is kept as the root.
pub fn slashed_path(path: impl AsRef<Path>) -> String {
    let raw = path.as_ref().to_string_lossy().replace('\\', "/");
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn load_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|e| ShellError::io(path, e))
}

/// Write `text` to `path`, creating parent directories as needed.
pub fn save_file(path: impl AsRef<Path>, text: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_path(parent)?;
    }
    fs::write(path, text).map_err(|e| ShellError::io(path, e))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
