//! Pouring bottles: download, unpack, relocate.

use crate::api::ApiClient;
use crate::bottle::{CellarPolicy, Collector, Tag};
use crate::config::Config;
use crate::download::DownloadRequest;
use crate::error::{PourError, Result};
use crate::extract;
use crate::keg::{Keg, RelocationOutcome};
use crate::lock::FileLock;
use std::path::Path;
use std::sync::Arc;

/// A keg on disk after pouring.
#[derive(Debug)]
pub struct Poured {
    pub keg: Keg,
    /// `None` when the bottle needed no relocation.
    pub relocation: Option<RelocationOutcome>,
}

pub struct Installer {
    api: ApiClient,
    tag: Tag,
}

impl Installer {
    pub fn new(api: ApiClient, tag: Tag) -> Self {
        Self { api, tag }
    }

    /// Resolve, download and pour the bottle of `name` for this installer's
    /// tag.
    pub async fn install(&self, name: &str) -> Result<Poured> {
        let formula = self.api.fetch_formula(name).await?;
        let version = formula.pkg_version().ok_or_else(|| PourError::NotFound {
            kind: "Stable version",
            name: name.to_string(),
            suggestions: Vec::new(),
        })?;
        let files = formula.bottle_files().ok_or_else(|| PourError::NotFound {
            kind: "Bottle",
            name: name.to_string(),
            suggestions: Vec::new(),
        })?;

        let collector = Collector::from_bottle_files(files);
        let spec = collector
            .specification_for(&self.tag, false)
            .ok_or_else(|| PourError::NotFound {
                kind: "Bottle",
                name: format!("{name} ({})", self.tag),
                suggestions: collector.tags().map(|t| t.to_string()).collect(),
            })?;
        let file = files
            .get(&spec.key)
            .ok_or_else(|| PourError::InvalidTag(spec.key.clone()))?;

        let target = self
            .api
            .config()
            .downloads()
            .join(format!("{}--{}.{}.bottle.tar.gz", formula.name, version, spec.tag));
        let request = DownloadRequest::new(&file.url, target).with_checksum(&spec.checksum);
        let bottle = self.api.downloader().fetch(&request).await?;

        let config = self.api.config_arc();
        let policy = spec.cellar.clone();
        let bottle_path = bottle.clone();
        tokio::task::spawn_blocking(move || pour(&bottle, &config, &formula.name, &version, &policy))
            .await
            .map_err(|e| PourError::io(bottle_path, std::io::Error::other(e)))?
    }
}

/// Unpack `bottle` into the cellar and relocate it unless the bottle says it
/// needs none.
pub fn pour(
    bottle: &Path,
    config: &Arc<Config>,
    name: &str,
    version: &str,
    policy: &CellarPolicy,
) -> Result<Poured> {
    if !policy.compatible_with(&config.cellar) {
        return Err(PourError::InvalidTag(format!(
            "bottle for {name} was built for cellar {policy:?}, not {}",
            config.cellar.display()
        )));
    }

    let keg_path = {
        let _lock = FileLock::acquire(&config.lock_dir(), &format!("formula-{name}"), config.lock_timeout)?;
        extract::extract_bottle(bottle, &config.cellar, name, version)?
    };
    let keg = Keg::new(keg_path, Arc::clone(config))?;

    if policy.skip_relocation() {
        tracing::debug!("{} needs no relocation", keg.name());
        return Ok(Poured { keg, relocation: None });
    }

    let outcome = keg.replace_placeholders_with_locations(None, false)?;
    keg.fix_dynamic_linkage()?;
    tracing::info!("Poured {} ({} files relocated)", keg.path().display(), outcome.changed.len());
    Ok(Poured {
        keg,
        relocation: Some(outcome),
    })
}
