//! File-level rewriting: finding candidate files, telling text from binary,
//! and replacing paths in place.
//!
//! Bulk operations are best effort. A file that vanishes or cannot be read
//! mid-walk is skipped with a warning; failures while writing are collected
//! per file and returned to the caller instead of aborting the walk.

use crate::error::{PourError, Result};
use crate::relocation::{Matcher, Relocation};
use memchr::memmem;
use rayon::prelude::*;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// How much of a file is inspected for a NUL byte.
pub const BINARY_SNIFF_LEN: usize = 8192;

/// Extensions that are binary regardless of their first bytes.
const BINARY_EXTENSIONS: &[&str] = &[
    "a", "o", "so", "dylib", "bundle", "node", "gz", "bz2", "xz", "zst", "zip", "jar", "png",
    "jpg", "jpeg", "gif", "ico", "icns", "pdf", "pyc", "wasm",
];

/// Minimum run of printable bytes reported by [`text_matches_in_file`].
const MIN_STRING_LEN: usize = 4;

/// Every regular file under `root`, skipping symlinks and anything under an
/// ignored path. Each call walks afresh.
pub fn find_matching_files<'a>(
    root: &Path,
    ignores: &'a [PathBuf],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| !ignores.iter().any(|ignored| entry.path().starts_with(ignored)))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}

/// Regular files under `dir` containing `needle`, one path per inode.
pub fn each_unique_file_matching<'a>(dir: &Path, needle: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let finder = memmem::Finder::new(needle.as_bytes()).into_owned();
    let mut seen = HashSet::new();

    find_matching_files(dir, &[]).filter(move |path| {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                return false;
            }
        };
        if finder.find(&data).is_none() {
            return false;
        }
        match fs::symlink_metadata(path) {
            Ok(meta) => seen.insert((meta.dev(), meta.ino())),
            Err(_) => false,
        }
    })
}

/// NUL byte in the first [`BINARY_SNIFF_LEN`] bytes, or a binary extension.
pub fn is_binary_file(path: &Path) -> Result<bool> {
    if path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext))
    {
        return Ok(true);
    }

    let head = read_head(path, BINARY_SNIFF_LEN)?;
    Ok(memchr::memchr(0, &head).is_some())
}

/// Script with a `#!interpreter` line.
pub fn is_text_executable(path: &Path) -> bool {
    let Ok(head) = read_head(path, 256) else {
        return false;
    };
    head.strip_prefix(b"#!")
        .is_some_and(|rest| rest.iter().any(|b| !b.is_ascii_whitespace()))
}

fn read_head(path: &Path, len: usize) -> Result<Vec<u8>> {
    let file = fs::File::open(path).map_err(|e| PourError::io(path, e))?;
    let mut head = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut head)
        .map_err(|e| PourError::io(path, e))?;
    Ok(head)
}

/// Where a matcher hit inside a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMatch {
    /// 1-based line number and the line itself.
    Line { number: usize, line: String },
    /// Byte offset into a binary file.
    Offset(usize),
}

/// First match of `matcher` in `path`: by line for text files, by byte
/// offset for binaries.
pub fn detect_text_match(path: &Path, matcher: &Matcher) -> Result<Option<TextMatch>> {
    let data = fs::read(path).map_err(|e| PourError::io(path, e))?;
    if is_binary_file(path)? {
        return Ok(matcher.find(&data).map(|span| TextMatch::Offset(span.start)));
    }

    Ok(data
        .split(|b| *b == b'\n')
        .enumerate()
        .find(|(_, line)| matcher.is_match(line))
        .map(|(i, line)| TextMatch::Line {
            number: i + 1,
            line: String::from_utf8_lossy(line).into_owned(),
        }))
}

/// A printable string found in a binary, `strings -t x` style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMatch {
    pub offset: usize,
    pub text: String,
}

/// Printable strings in `path` that reference `path_matcher`.
///
/// Colon-separated lists are checked entry by entry. Strings matching one of
/// `ignores`, and entries already known as linked libraries, are not
/// reported. Each offset is reported once.
pub fn text_matches_in_file(
    path: &Path,
    path_matcher: &Matcher,
    ignores: &[Regex],
    linked_libraries: &[PathBuf],
) -> Result<Vec<StringMatch>> {
    let data = fs::read(path).map_err(|e| PourError::io(path, e))?;
    let mut matches: Vec<StringMatch> = Vec::new();

    for (offset, text) in printable_strings(&data) {
        if ignores.iter().any(|ignore| ignore.is_match(text)) {
            continue;
        }
        if !path_matcher.is_match(text.as_bytes()) {
            continue;
        }

        let reportable = text.split(':').any(|entry| {
            path_matcher.is_match(entry.as_bytes())
                && !linked_libraries.iter().any(|lib| lib.as_os_str() == entry)
        });
        if reportable && !matches.iter().any(|m| m.offset == offset) {
            matches.push(StringMatch {
                offset,
                text: text.to_string(),
            });
        }
    }

    Ok(matches)
}

fn printable_strings(data: &[u8]) -> impl Iterator<Item = (usize, &str)> {
    let mut start = 0;
    let mut strings = Vec::new();
    for (i, b) in data.iter().enumerate() {
        let printable = b.is_ascii_graphic() || *b == b' ' || *b == b'\t';
        if !printable {
            if i - start >= MIN_STRING_LEN {
                strings.push(start..i);
            }
            start = i + 1;
        }
    }
    if data.len() - start >= MIN_STRING_LEN {
        strings.push(start..data.len());
    }

    strings.into_iter().filter_map(move |range| {
        std::str::from_utf8(&data[range.clone()])
            .ok()
            .map(|s| (range.start, s))
    })
}

/// Replace `old` with `new` inside the NUL-separated strings of a binary,
/// padding each rewritten string with NULs back to its original length.
///
/// `Ok(None)` when `old` does not occur. Fails when `new` is longer than
/// `old` and a rewritten string would no longer fit.
pub fn replace_in_binary(path: &Path, data: &[u8], old: &str, new: &str) -> Result<Option<Vec<u8>>> {
    let finder = memmem::Finder::new(old.as_bytes());
    if finder.find(data).is_none() {
        return Ok(None);
    }

    let mut patched = Vec::with_capacity(data.len());
    for (i, segment) in data.split(|b| *b == 0).enumerate() {
        if i > 0 {
            patched.push(0);
        }
        if finder.find(segment).is_none() {
            patched.extend_from_slice(segment);
            continue;
        }

        let replaced = Matcher::literal(old)
            .replace_all(segment, new.as_bytes())
            .unwrap_or_else(|| segment.to_vec());
        patched.extend_from_slice(&replaced);
        patched.resize(patched.len() + segment.len().saturating_sub(replaced.len()), 0);
    }

    if patched.len() != data.len() {
        return Err(PourError::Patch {
            path: path.to_path_buf(),
            reason: format!(
                "original and patched binary sizes do not match ({} vs {})",
                data.len(),
                patched.len()
            ),
        });
    }
    Ok(Some(patched))
}

/// Apply `relocation` to one file. Only writes when the content changed.
///
/// Both text and binary files are rewritten byte-wise; a binary's embedded
/// strings change length, which is why [`replace_in_binary`] exists for
/// the cases that must keep offsets stable.
pub fn replace_text_in_file(path: &Path, relocation: &Relocation) -> Result<bool> {
    let data = fs::read(path).map_err(|e| PourError::io(path, e))?;
    match relocation.replace_bytes(&data) {
        Some(replaced) if replaced != data => {
            write_preserving_metadata(path, &replaced)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Atomically replace `path` with `contents`, keeping its mode and owner.
pub fn write_preserving_metadata(path: &Path, contents: &[u8]) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| PourError::io(path, e))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PourError::io(dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.flush())
        .map_err(|e| PourError::io(tmp.path(), e))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(metadata.mode()))
        .map_err(|e| PourError::io(tmp.path(), e))?;
    if let Err(e) = std::os::unix::fs::chown(tmp.path(), Some(metadata.uid()), Some(metadata.gid())) {
        tracing::debug!("Could not preserve owner of {}: {}", path.display(), e);
    }

    tmp.persist(path).map_err(|e| PourError::io(path, e.error))?;
    Ok(())
}

/// Outcome of a bulk rewrite.
#[derive(Debug, Default)]
pub struct RewriteReport {
    /// Every path whose content changed, hard links included.
    pub changed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, PourError)>,
}

impl RewriteReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Apply `relocation` to `files` in parallel.
///
/// Hard links are grouped by inode: the first path is rewritten and the
/// others are linked to the new file again afterwards.
pub fn replace_text_in_files(files: &[PathBuf], relocation: &Relocation) -> RewriteReport {
    let results: Vec<(Vec<PathBuf>, Result<bool>)> = hard_link_groups(files)
        .into_par_iter()
        .map(|group| {
            let result = rewrite_group(&group, relocation);
            (group, result)
        })
        .collect();

    let mut report = RewriteReport::default();
    for (group, result) in results {
        match result {
            Ok(true) => report.changed.extend(group),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Failed to relocate {}: {}", group[0].display(), e);
                report.failures.push((group[0].clone(), e));
            }
        }
    }
    report
}

fn rewrite_group(group: &[PathBuf], relocation: &Relocation) -> Result<bool> {
    let Some((first, rest)) = group.split_first() else {
        return Ok(false);
    };
    if !replace_text_in_file(first, relocation)? {
        return Ok(false);
    }
    relink_hard_links(first, rest)?;
    Ok(true)
}

/// `files` grouped by inode, in first-seen order. Anything that is not a
/// regular file is dropped; every group is non-empty.
pub fn hard_link_groups(files: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let mut groups: HashMap<(u64, u64), Vec<PathBuf>> = HashMap::new();
    let mut order = Vec::new();
    for file in files {
        match fs::symlink_metadata(file) {
            Ok(meta) if meta.file_type().is_file() => {
                let key = (meta.dev(), meta.ino());
                let group = groups.entry(key).or_default();
                if group.is_empty() {
                    order.push(key);
                }
                if !group.contains(file) {
                    group.push(file.clone());
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Skipping {}: {}", file.display(), e),
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Point `siblings` back at `file` once a rename has given `file` a new
/// inode.
pub fn relink_hard_links(file: &Path, siblings: &[PathBuf]) -> Result<()> {
    for other in siblings {
        fs::remove_file(other).map_err(|e| PourError::io(other, e))?;
        fs::hard_link(file, other).map_err(|e| PourError::io(other, e))?;
    }
    Ok(())
}
