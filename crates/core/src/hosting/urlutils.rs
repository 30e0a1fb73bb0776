//! URL helpers for branch locations.
//!
//! Branch locations are compared by exact string match, so every URL the
//! opener or a policy sees first goes through [`normalize`]. Relative
//! references and stacked-on locations are absolutised with [`join`]
//! against the base URL of the hop that named them.

use std::path::PathBuf;

/// Return the scheme of an absolute URL (`"https"` for `https://host/x`).
pub fn scheme(url: &str) -> Option<&str> {
    let (candidate, _) = url.split_once("://")?;
    let mut chars = candidate.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Some(candidate)
    } else {
        None
    }
}

/// `true` if `url` carries a scheme.
pub fn is_absolute(url: &str) -> bool {
    scheme(url).is_some()
}

/// Canonicalise a URL: lowercase scheme, resolve `.`/`..` path segments and
/// strip trailing slashes.
///
/// Scheme-less input is treated as a bare path and normalised the same way.
pub fn normalize(url: &str) -> String {
    let url = url.trim();
    let (prefix, path) = split_prefix(url);
    let path = remove_dot_segments(path);
    let absolute_path = path.is_empty() && prefix.is_empty() && url.starts_with('/');
    if absolute_path {
        return "/".to_string();
    }
    format!("{}{}", prefix, path)
}

/// Resolve `relative` against the directory-like location `base`.
///
/// - an absolute `relative` is returned normalised, ignoring `base`
/// - `/path` replaces the path of `base` but keeps its scheme and host
/// - anything else is appended below `base`
pub fn join(base: &str, relative: &str) -> String {
    let relative = relative.trim();
    if is_absolute(relative) {
        return normalize(relative);
    }
    let base = normalize(base);
    let (prefix, path) = split_prefix(&base);
    if relative.starts_with('/') {
        return normalize(&format!("{}{}", prefix, relative));
    }
    normalize(&format!("{}{}/{}", prefix, path, relative))
}

/// Map a `file://` URL to a local filesystem path.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if !scheme(url)?.eq_ignore_ascii_case("file") {
        return None;
    }
    let rest = &url["file://".len()..];
    // file://localhost/x and file:///x are both local.
    let path = match rest.find('/') {
        Some(0) => rest,
        Some(idx) if rest[..idx].eq_ignore_ascii_case("localhost") => &rest[idx..],
        _ => return None,
    };
    Some(PathBuf::from(path))
}

/// Split `scheme://authority` from the path. Scheme-less input has an empty
/// prefix.
fn split_prefix(url: &str) -> (String, &str) {
    match scheme(url) {
        Some(scheme) => {
            let after = &url[scheme.len() + 3..];
            let (authority, path) = match after.find('/') {
                Some(idx) => (&after[..idx], &after[idx..]),
                None => (after, ""),
            };
            (
                format!("{}://{}", scheme.to_ascii_lowercase(), authority),
                path,
            )
        }
        None => (String::new(), url),
    }
}

fn remove_dot_segments(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return String::new();
    }
    let joined = segments.join("/");
    if path.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}
