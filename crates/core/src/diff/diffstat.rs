//! Permissive unified-diff statistics.
//!
//! The parser walks file headers (`--- old` / `+++ new`) and their `@@`
//! hunks, counting added and removed lines per path. Hunk line counts are
//! respected, so anything after a hunk ends (trailers, merge-directive
//! bundles, stray text) is skipped rather than miscounted. Lines are split on
//! `\n` only; a bare `\r` is part of the line.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::debug;

use crate::errors::PatchParseError;

/// Path → (added, removed).
pub type Diffstat = BTreeMap<String, (u32, u32)>;

/// Prefixes of lines that may appear around patches without being part of
/// one.
const METADATA_PREFIXES: &[&str] = &[
    "=== ",
    "# ",
    "#",
    "*** ",
    "diff ",
    "index ",
    "Index: ",
    "Binary files ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "rename from",
    "rename to",
    "Only in ",
    "Property changes on:",
];

fn hunk_header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").ok())
        .as_ref()
}

/// Count added/removed lines per file in `diff`.
///
/// Empty input yields an empty map. Input with no file header but other
/// non-metadata content is [`PatchParseError::MalformedPatchHeader`].
pub fn generate_diffstat(diff: &[u8]) -> Result<Diffstat, PatchParseError> {
    let text = String::from_utf8_lossy(diff);
    let lines: Vec<&str> = text.split_terminator('\n').collect();
    let mut stats = Diffstat::new();
    let mut saw_patch = false;
    let mut first_junk: Option<&str> = None;

    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];
        let header = line
            .strip_prefix("--- ")
            .zip(lines.get(idx + 1).and_then(|next| next.strip_prefix("+++ ")));
        let Some((old, new)) = header else {
            if !saw_patch && first_junk.is_none() && !is_metadata(line) {
                first_junk = Some(line);
            }
            idx += 1;
            continue;
        };

        saw_patch = true;
        idx += 2;
        let counts = stats.entry(patch_path(old, new)).or_insert((0, 0));
        while let Some(header) = lines.get(idx).filter(|l| l.starts_with("@@")) {
            let (mut old_left, mut new_left) = parse_hunk_header(header)?;
            idx += 1;
            while old_left > 0 || new_left > 0 {
                let Some(hunk_line) = lines.get(idx) else {
                    break;
                };
                match hunk_line.as_bytes().first() {
                    Some(b'+') => {
                        counts.0 += 1;
                        new_left = new_left.saturating_sub(1);
                    }
                    Some(b'-') => {
                        counts.1 += 1;
                        old_left = old_left.saturating_sub(1);
                    }
                    Some(b' ') | None => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                    Some(b'\\') => {}
                    Some(_) => break,
                }
                idx += 1;
            }
            while lines.get(idx).is_some_and(|l| l.starts_with('\\')) {
                idx += 1;
            }
        }
    }

    match first_junk {
        Some(junk) if !saw_patch => Err(PatchParseError::MalformedPatchHeader(junk.to_string())),
        _ => {
            debug!(files = stats.len(), "diffstat generated");
            Ok(stats)
        }
    }
}

/// Sum of added and removed lines over every file.
pub fn totals(stats: &Diffstat) -> (u32, u32) {
    stats
        .values()
        .fold((0, 0), |(added, removed), (a, r)| (added + a, removed + r))
}

fn is_metadata(line: &str) -> bool {
    line.trim().is_empty() || METADATA_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Path named by a file header: the new name, or the old one for deletions.
/// Timestamps after a tab are dropped.
fn patch_path(old: &str, new: &str) -> String {
    let strip = |name: &str| name.split('\t').next().unwrap_or(name).trim_end().to_string();
    let new = strip(new);
    if new == "/dev/null" {
        strip(old)
    } else {
        new
    }
}

/// `(old_len, new_len)` of a `@@ -a,b +c,d @@` line.
fn parse_hunk_header(line: &str) -> Result<(u32, u32), PatchParseError> {
    let malformed = || PatchParseError::MalformedHunkHeader(line.to_string());
    let caps = hunk_header_re()
        .and_then(|re| re.captures(line))
        .ok_or_else(malformed)?;
    let len = |group: usize| -> Result<u32, PatchParseError> {
        match caps.get(group) {
            Some(m) => m.as_str().parse().map_err(|_| malformed()),
            None => Ok(1),
        }
    };
    Ok((len(2)?, len(4)?))
}
