//! Bottle extraction into the cellar.
//!
//! Bottles are gzipped tarballs whose top-level entry is `<name>/<version>`:
//! ```text
//! Input:  ripgrep--14.1.0.arm64_sonoma.bottle.tar.gz
//! Extract to: /opt/homebrew/Cellar/ripgrep/14.1.0/
//!   bin/
//!   share/
//!   INSTALL_RECEIPT.json
//! ```
//!
//! A rebuilt bottle may carry a revision suffix (`14.1.0_1`); the extracted
//! directory is found either way.
//!
//! # Examples
//!
//! ```no_run
//! use pourover::extract;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let keg = extract::extract_bottle(
//!         Path::new("/tmp/ripgrep--14.1.0.arm64_sonoma.bottle.tar.gz"),
//!         Path::new("/opt/homebrew/Cellar"),
//!         "ripgrep",
//!         "14.1.0",
//!     )?;
//!     println!("Extracted to: {}", keg.display());
//!     Ok(())
//! }
//! ```

use crate::error::{PourError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Unpack `bottle` under `cellar` and return the keg directory.
pub fn extract_bottle(bottle: &Path, cellar: &Path, name: &str, version: &str) -> Result<PathBuf> {
    fs::create_dir_all(cellar).map_err(|e| PourError::io(cellar, e))?;

    let file = fs::File::open(bottle).map_err(|e| PourError::io(bottle, e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.unpack(cellar).map_err(|e| PourError::io(bottle, e))?;

    find_keg_dir(&cellar.join(name), version).ok_or_else(|| PourError::Format {
        path: bottle.to_path_buf(),
        reason: format!("no {name}/{version} directory in archive"),
    })
}

/// `<formula_dir>/<version>` or `<formula_dir>/<version>_<N>`.
pub fn find_keg_dir(formula_dir: &Path, version: &str) -> Option<PathBuf> {
    let exact = formula_dir.join(version);
    if exact.is_dir() {
        return Some(exact);
    }

    let revision_prefix = format!("{version}_");
    fs::read_dir(formula_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&revision_prefix))
                .is_some_and(|rev| !rev.is_empty() && rev.chars().all(|c| c.is_ascii_digit()))
        })
}
