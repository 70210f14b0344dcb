//! Hierarchical node paths.
//!
//! A valid path is `/` or `/` followed by one or more non-empty segments separated by
//! `/`, without a trailing separator, without `.`/`..` segments and without NUL bytes.

use crate::constants::PATH_SEPARATOR;
use crate::constants::ROOT_PATH;
use crate::NodeError;

/// Checks path syntax, returning the reason on failure
pub fn validate_path(path: &str) -> std::result::Result<(), NodeError> {
    let invalid = |reason: &str| NodeError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if !path.starts_with(PATH_SEPARATOR) {
        return Err(invalid("path must start with '/'"));
    }
    if path == ROOT_PATH {
        return Ok(());
    }
    if path.ends_with(PATH_SEPARATOR) {
        return Err(invalid("path must not end with '/'"));
    }
    if path.contains('\0') {
        return Err(invalid("path must not contain NUL"));
    }
    for segment in path[1..].split(PATH_SEPARATOR) {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of a valid path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind(PATH_SEPARATOR) {
        Some(0) => Some(ROOT_PATH),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a valid path; empty for the root
pub fn name(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Appends a child segment to a valid path
pub fn join(
    parent: &str,
    child: &str,
) -> String {
    if parent == ROOT_PATH {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Number of segments; 0 for the root
pub fn depth(path: &str) -> usize {
    if path == ROOT_PATH {
        0
    } else {
        path.matches(PATH_SEPARATOR).count()
    }
}

/// True when `path` equals `ancestor` or lies below it
pub fn is_ancestor_or_self(
    ancestor: &str,
    path: &str,
) -> bool {
    if ancestor == ROOT_PATH || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == PATH_SEPARATOR as u8
}

/// Every proper ancestor of a valid path, nearest first, root last
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent(path), |p| parent(*p))
}
