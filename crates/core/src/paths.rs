//! Relative-path safety: validation, lexical cleaning, containment.
//!
//! Every path that crosses the wire or lands in a tar is checked here.
//! The checks are purely lexical; nothing touches the filesystem except
//! [`remove_path`].

use std::path::{Component, Path, PathBuf};

use color_eyre::eyre::{bail, Result};

/// Reject any relative path that could name something outside its root.
///
/// Rules: non-empty, no NUL byte, not absolute, does not clean to `.`,
/// and does not resolve above the root. The "escapes" wording is relied
/// on by callers and tests.
///
/// # Errors
/// Returns a descriptive error for the first violated rule.
pub fn validate_rel_path(p: &str) -> Result<()> {
    if p.is_empty() {
        bail!("empty path");
    }
    if p.contains('\0') {
        bail!("path contains null byte");
    }
    if p.starts_with('/') {
        bail!("absolute path not allowed: {p}");
    }
    let cleaned = clean_rel_path(p);
    if cleaned == "." {
        bail!("path resolves to current directory");
    }
    if cleaned == ".." || cleaned.starts_with("../") {
        bail!("path escapes base directory: {p}");
    }
    Ok(())
}

/// Lexically clean a slash-separated path: collapse repeated slashes,
/// drop `.` segments, resolve `..` against earlier segments. A fully
/// consumed relative path becomes `.`.
#[must_use]
pub fn clean_rel_path(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|last| *last != "..") {
                    out.pop();
                } else if !rooted {
                    // Keep leading parents; above an absolute root there
                    // is nothing to climb into.
                    out.push("..");
                }
            }
            seg => out.push(seg),
        }
    }

    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Whether `full` stays at or under `dir` after lexical normalization.
#[must_use]
pub fn is_within_dir(dir: &Path, full: &Path) -> bool {
    let dir = normalize(dir);
    let full = normalize(full);
    full.starts_with(&dir)
}

fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Remove a file or directory tree, treating a missing path as success.
///
/// # Errors
/// Returns the underlying I/O error for anything but a missing path.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
    }
}
