//! Canonical path handling for the folder tree.
//!
//! Every folder is keyed by its cleaned absolute path: rooted at `/`, no
//! empty, `.` or `..` components, no trailing separator (except the root).

use crate::types::MetaError;

/// Path component separator.
pub const SEPARATOR: char = '/';

/// The root folder path.
pub const ROOT: &str = "/";

/// Cleans `path` into canonical absolute form.
///
/// `..` above the root stays at the root. Relative input is treated as
/// rooted. Empty paths and components containing NUL are rejected.
pub fn clean(path: &str) -> Result<String, MetaError> {
    if path.is_empty() {
        return Err(MetaError::Invalid("empty path".to_string()));
    }
    if path.contains('\0') {
        return Err(MetaError::Invalid(format!("path '{}' contains NUL", path.escape_debug())));
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(SEPARATOR) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    let mut out = String::with_capacity(path.len() + 1);
    for p in parts {
        out.push(SEPARATOR);
        out.push_str(p);
    }
    Ok(out)
}

/// Parent folder of a canonical path. The root is its own parent.
pub fn parent(full: &str) -> &str {
    match full.rfind(SEPARATOR) {
        Some(0) | None => ROOT,
        Some(i) => &full[..i],
    }
}

/// Last component of a canonical path ("" for the root).
pub fn name(full: &str) -> &str {
    match full.rfind(SEPARATOR) {
        Some(i) => &full[i + 1..],
        None => full,
    }
}

/// Joins a canonical folder path and a child name.
pub fn join(dir: &str, child: &str) -> String {
    if dir == ROOT {
        format!("{}{}", SEPARATOR, child)
    } else {
        format!("{}{}{}", dir, SEPARATOR, child)
    }
}

/// Every folder from the root down to `full`, inclusive.
pub fn ancestors(full: &str) -> Vec<String> {
    let mut chain = vec![ROOT.to_string()];
    if full == ROOT {
        return chain;
    }
    for (i, c) in full.char_indices().skip(1) {
        if c == SEPARATOR {
            chain.push(full[..i].to_string());
        }
    }
    chain.push(full.to_string());
    chain
}

/// Key prefix shared by every strict descendant of `full`.
pub fn descendant_prefix(full: &str) -> String {
    if full == ROOT {
        ROOT.to_string()
    } else {
        format!("{}{}", full, SEPARATOR)
    }
}

/// True if `path` lies strictly below `ancestor` on a separator boundary.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    path != ancestor && path.starts_with(&descendant_prefix(ancestor))
}

/// Rewrites the `from` prefix of `path` to `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let rest = &path[descendant_prefix(from).len()..];
    join(to, rest)
}
