//! Lexical path containment for library roots.
//!
//! Client-supplied paths are resolved against a library root without ever
//! touching the filesystem: containment is decided by the text of the path
//! alone. Symlinks are deliberately not resolved; administrators own the
//! library tree and the daemon refuses to create escaping links itself.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::{MAX_PATH_DEPTH, MAX_PATH_LENGTH};

/// Resolve a client-supplied relative path against a library root.
///
/// Rules, applied in order:
/// - total request length capped at [`MAX_PATH_LENGTH`]
/// - leading separators stripped (absolute requests become relative)
/// - the path is split on both `/` and `\`; empty segments collapse
/// - components equal to `.` or `..` are traversal attempts
/// - components containing NUL are malformed
/// - depth capped at [`MAX_PATH_DEPTH`], joined length at [`MAX_PATH_LENGTH`]
/// - the joined result must retain the root as a lexical prefix
///
/// An empty request resolves to the root itself, which is how directory
/// listings address the top of a library.
///
/// # Errors
///
/// Returns [`Error::PathTraversal`] for dot components or a prefix escape,
/// [`Error::InvalidPath`] for forbidden characters, depth, or length.
pub fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.len() > MAX_PATH_LENGTH {
        return Err(Error::InvalidPath(format!(
            "request length {} exceeds {MAX_PATH_LENGTH}",
            requested.len()
        )));
    }

    let trimmed = requested.trim_start_matches(['/', '\\']);

    let mut components: Vec<&str> = Vec::new();
    for part in trimmed.split(['/', '\\']) {
        if part.is_empty() {
            continue;
        }
        if part == "." || part == ".." {
            return Err(Error::PathTraversal(requested.to_string()));
        }
        if part.contains('\0') {
            return Err(Error::InvalidPath(
                "path component contains NUL".to_string(),
            ));
        }
        components.push(part);
    }

    if components.len() > MAX_PATH_DEPTH {
        return Err(Error::InvalidPath(format!(
            "path depth {} exceeds {MAX_PATH_DEPTH} levels",
            components.len()
        )));
    }

    let mut resolved = root.to_path_buf();
    for part in &components {
        resolved.push(part);
    }

    if resolved.as_os_str().len() > MAX_PATH_LENGTH {
        return Err(Error::InvalidPath(format!(
            "resolved path exceeds {MAX_PATH_LENGTH} characters"
        )));
    }

    // Lexical containment; cannot fail after the component filtering above,
    // but the invariant is cheap to restate.
    if !resolved.starts_with(root) {
        return Err(Error::PathTraversal(requested.to_string()));
    }

    Ok(resolved)
}

/// Relative path of `abs` under `root`, with forward-slash separators.
///
/// Used when reporting paths back to clients; falls back to the full path
/// when `abs` is not under `root`.
#[must_use]
pub fn relative_display(root: &Path, abs: &Path) -> String {
    let rel = abs.strip_prefix(root).unwrap_or(abs);
    let s = rel.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
