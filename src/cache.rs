//! On-disk layout of the API cache.
//!
//! ```text
//! <cache>/api/
//!   formula.jws.json       signed manifest as downloaded
//!   formula_names.txt      one name per line, sorted
//!   formula_aliases.txt    alias|target
//!   formula_renames.txt    oldname|newname
//!   cask.jws.json
//!   cask_names.txt
//!   cask_renames.txt
//! ```
//!
//! Every write goes through [`write_atomic`] so a concurrent reader sees
//! either the old file or the new one.

use crate::error::{PourError, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Check if a cached file is still fresh (younger than `ttl`)
pub fn is_cache_fresh(path: &Path, ttl: Duration) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(_) => return false,
    };

    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < ttl,
        // mtime in the future: treat as just written
        Err(_) => true,
    }
}

/// A file that exists and has content.
pub fn is_present(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

/// Write `contents` to a temporary sibling and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| PourError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PourError::io(dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.flush())
        .map_err(|e| PourError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PourError::io(path, e.error))?;
    Ok(())
}

/// Persist a sorted name list for completion-style lookups.
///
/// Only writes when `regenerate` is set or the file is missing. Returns
/// whether the file was written.
pub fn write_names_file(api_dir: &Path, names: &[String], kind: &str, regenerate: bool) -> Result<bool> {
    let names_path = api_dir.join(format!("{kind}_names.txt"));
    if names_path.exists() && !regenerate {
        return Ok(false);
    }

    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    write_atomic(&names_path, sorted.join("\n").as_bytes())?;
    Ok(true)
}

/// Write a `key|value` file, one mapping per line.
pub fn write_pairs_file(path: &Path, pairs: &BTreeMap<String, String>) -> Result<()> {
    let mut contents = String::new();
    for (key, value) in pairs {
        contents.push_str(key);
        contents.push('|');
        contents.push_str(value);
        contents.push('\n');
    }
    write_atomic(path, contents.as_bytes())
}

/// Read a `key|value` file. Malformed lines are skipped.
pub fn read_pairs_file(path: &Path) -> Option<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    Some(
        contents
            .lines()
            .filter_map(|line| line.split_once('|'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

pub fn read_names_file(path: &Path) -> Option<Vec<String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    Some(
        contents
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Remove every cached manifest and derived file.
pub fn clear_caches(api_dir: &Path) -> Result<()> {
    if !api_dir.exists() {
        return Ok(());
    }

    for entry in std::fs::read_dir(api_dir).map_err(|e| PourError::io(api_dir, e))? {
        let path = entry.map_err(|e| PourError::io(api_dir, e))?.path();
        let is_cache_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("txt")
        );
        if path.is_file() && is_cache_file {
            std::fs::remove_file(&path).map_err(|e| PourError::io(&path, e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_file_only_written_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let names = vec!["wget".to_string(), "curl".to_string()];

        assert!(write_names_file(dir.path(), &names, "formula", false).unwrap());
        let path = dir.path().join("formula_names.txt");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "curl\nwget");

        let more = vec!["zsh".to_string()];
        assert!(!write_names_file(dir.path(), &more, "formula", false).unwrap());
        assert_eq!(read_names_file(&path).unwrap(), vec!["curl", "wget"]);

        assert!(write_names_file(dir.path(), &more, "formula", true).unwrap());
        assert_eq!(read_names_file(&path).unwrap(), vec!["zsh"]);
    }

    #[test]
    fn test_pairs_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formula_aliases.txt");
        let mut pairs = BTreeMap::new();
        pairs.insert("python3".to_string(), "python@3.12".to_string());
        pairs.insert("gcc@14".to_string(), "gcc".to_string());

        write_pairs_file(&path, &pairs).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "gcc@14|gcc\npython3|python@3.12\n"
        );
        assert_eq!(read_pairs_file(&path).unwrap(), pairs);
    }

    #[test]
    fn test_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formula.jws.json");
        assert!(!is_cache_fresh(&path, Duration::from_secs(60)));
        std::fs::write(&path, b"{}").unwrap();
        assert!(is_cache_fresh(&path, Duration::from_secs(60)));
        assert!(!is_cache_fresh(&path, Duration::ZERO));
    }

    #[test]
    fn test_clear_caches_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("formula.jws.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("formula_names.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("keep.lock"), b"").unwrap();

        clear_caches(dir.path()).unwrap();
        assert!(!dir.path().join("formula.jws.json").exists());
        assert!(!dir.path().join("formula_names.txt").exists());
        assert!(dir.path().join("keep.lock").exists());
    }
}
