use std::path::PathBuf;
use thiserror::Error;

use crate::keg::RelocationState;

#[derive(Error, Debug)]
pub enum PourError {
    /// Unrecognised or corrupt binary header. Bulk scans skip the file.
    #[error("Unrecognised binary format in {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// The dynamic section cannot hold the requested values.
    #[error("Failed to patch {path}: {reason}")]
    Patch { path: PathBuf, reason: String },

    #[error("Failed to verify integrity of {url}: {reason}")]
    Signature { url: String, reason: String },

    /// Network or transport failure. Callers may retry.
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {waited_secs}s waiting for lock {path}")]
    Lock { path: PathBuf, waited_secs: u64 },

    #[error("Relocation of {keg} failed after reaching {state:?} (file: {file}): {reason}")]
    Relocation {
        keg: PathBuf,
        state: RelocationState,
        file: PathBuf,
        reason: String,
    },

    #[error("{kind} not found: {name}{}", suggestion_suffix(.suggestions))]
    NotFound {
        kind: &'static str,
        name: String,
        suggestions: Vec<String>,
    },

    #[error("Invalid bottle tag: {0}")]
    InvalidTag(String),

    #[error("API request failed: {0}")]
    Api(#[from] reqwest::Error),
}

fn suggestion_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean {}?)", suggestions.join(", "))
    }
}

impl PourError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PourError::Io {
            path: path.into(),
            source,
        }
    }

    /// Only transport failures are worth retrying; everything else is
    /// deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PourError::Fetch { .. })
    }
}

pub type Result<T> = std::result::Result<T, PourError>;
