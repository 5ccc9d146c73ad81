//! Path utilities for SFTP operations
//!
//! Remote SFTP paths always use `/` as separator (per SFTP protocol), even when
//! the server runs on Windows. User input may still arrive with `\`, so every
//! remote path goes through [`normalize_separators`] first.

use std::path::{Path, PathBuf};

/// Replace `\` separators with `/`.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if component.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Join local path components using the platform-native separator.
///
/// `component` is a `/`-separated relative path as produced by the tree walk.
pub fn join_local_path(base: &Path, component: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in component.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Lexically collapse `.` and `..` segments and duplicate separators.
///
/// `..` never climbs above the root of an absolute path.
pub fn normalize_remote_path(path: &str) -> String {
    let absolute = is_absolute_remote_path(path);
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Resolve `path` against the remote working directory `cwd`.
///
/// Absolute paths only get their separators normalized; anything else
/// (`.`, `..`, `./x`, `../x`, `x/y`) is joined onto `cwd` and collapsed.
pub fn resolve_remote_path(cwd: &str, path: &str) -> String {
    let path = normalize_separators(path);
    if is_absolute_remote_path(&path) {
        path
    } else {
        normalize_remote_path(&join_remote_path(cwd, &path))
    }
}

/// Parent of a remote path; `/` is its own parent.
pub fn parent_remote_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None if is_absolute_remote_path(path) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Last component of a remote path
pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}
