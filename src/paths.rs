//! Path sanitization, ignore filtering, and object-key layout.
//!
//! Keys in the object store always use forward slashes. Local paths use
//! whatever the platform uses; conversion happens at the edges.

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Basename globs that are never synchronized in either direction.
///
/// `*.placeholder` is listed here so placeholders never move as file
/// content; the reconciler still handles placeholder keys specially for
/// folder creation.
const IGNORE_GLOBS: &[&str] = &[
    "*.placeholder",
    "~$*",
    "*.tmp",
    ".DS_Store",
    "Thumbs.db",
    ".last_sync_state.json",
    "*.part",
    "*.crdownload",
    "*.temp",
    "*.swp",
    "*.swx",
    "*.lnk",
];

fn ignore_patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        IGNORE_GLOBS
            .iter()
            .map(|g| Pattern::new(g).expect("static ignore glob"))
            .collect()
    })
}

/// Sanitize a project or folder name for filesystem use.
///
/// Strips `< > : " / \ | ? *` and control bytes, collapses whitespace runs
/// to a single space, trims trailing dots. An empty result becomes
/// `"Unnamed"`.
pub fn sanitize(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();

    let collapsed = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let trimmed = collapsed.trim().trim_end_matches('.').trim();
    if trimmed.is_empty() {
        "Unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether a basename matches the transient/editor-scratch ignore set.
pub fn is_ignored(basename: &str) -> bool {
    let opts = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::default()
    };
    if ignore_patterns()
        .iter()
        .any(|p| p.matches_with(basename, opts))
    {
        return true;
    }
    has_hex_scratch_suffix(basename)
}

/// Editor scratch names of the form `name.ext.1A2B3C4D` (eight hex digits
/// appended after the real extension).
fn has_hex_scratch_suffix(basename: &str) -> bool {
    let Some((stem, suffix)) = basename.rsplit_once('.') else {
        return false;
    };
    stem.contains('.') && suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether an object key represents a folder placeholder.
pub fn is_placeholder_key(rel_key: &str) -> bool {
    rel_key.ends_with(".placeholder")
}

/// Adorn a drive-letter path with the long-path prefix.
///
/// UNC paths and paths that already carry the prefix pass through
/// unchanged, as do relative paths.
pub fn adorn_long_path(p: &str) -> String {
    if p.starts_with(r"\\") {
        return p.to_string();
    }
    let bytes = p.as_bytes();
    let is_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    if is_drive {
        format!(r"\\?\{}", p)
    } else {
        p.to_string()
    }
}

/// Extend a local path past the platform short-path limit where one exists.
#[cfg(windows)]
pub fn long_path(p: &Path) -> PathBuf {
    PathBuf::from(adorn_long_path(&p.to_string_lossy()))
}

#[cfg(not(windows))]
pub fn long_path(p: &Path) -> PathBuf {
    p.to_path_buf()
}

/// Join key segments with forward slashes, trimming redundant separators.
pub fn to_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/').replace('\\', "/"))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand `A/B/C` into `["A", "A/B", "A/B/C"]` for per-level placeholder
/// creation.
pub fn path_levels(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc: Vec<&str> = Vec::new();
    for part in path.trim_matches('/').replace('\\', "/").split('/') {
        if part.is_empty() {
            continue;
        }
        acc.push(part);
        out.push(acc.join("/"));
    }
    out
}

/// Number of segments in a relative key.
pub fn key_depth(rel_key: &str) -> usize {
    rel_key.split('/').filter(|s| !s.is_empty()).count()
}

/// Object-key prefix for a project:
/// `<rootPrefix>/<sanitizedProject>/<orgSegment>/<sanitizedProject>`.
pub fn project_prefix(root_prefix: &str, project: &str, org_segment: &str) -> String {
    let project = sanitize(project);
    to_key(&[root_prefix, &project, org_segment, &project])
}

/// `s3://bucket/key` form used for logging and tool invocations.
pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key.trim_start_matches('/'))
}
