//! Homebrew JSON API client.
//!
//! Two kinds of request go through [`ApiClient`]:
//!
//! - **Single-entity lookups** (`{api}/formula/<name>.json`,
//!   `{api}/cask/<token>.json`) fetched directly and memoised in-memory for the
//!   lifetime of the client.
//! - **Signed manifests** (`{api}/formula.jws.json`, `{api}/cask.jws.json`)
//!   mirrored under `<cache>/api/` through the [`Downloader`] collaborator. A
//!   manifest is only ever written to the cache after its signature checks out.
//!
//! # Examples
//!
//! ```no_run
//! use pourover::{ApiClient, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let api = ApiClient::new(Config::from_env())?;
//!
//!     let formula = api.fetch_formula("ripgrep").await?;
//!     println!("Latest version: {}", formula.versions.stable.unwrap_or_default());
//!
//!     let (manifest, updated) = api.fetch_json_api_file("formula.jws.json").await?;
//!     println!("{} entries (updated: {})", manifest.as_array().map_or(0, Vec::len), updated);
//!     Ok(())
//! }
//! ```

use crate::bottle::Tag;
use crate::cache;
use crate::config::{Config, HOMEBREW_API_DEFAULT_DOMAIN};
use crate::download::{DownloadRequest, Downloader, HttpDownloader};
use crate::error::{PourError, Result};
use crate::jws::{self, TRUSTED_KEY_ID, TrustedKey};
use crate::lock::FileLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times a corrupt manifest is thrown away and downloaded again.
const CORRUPT_MANIFEST_RETRIES: u32 = 3;

/// Keg-only reason metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KegOnlyReason {
    pub reason: String,
    #[serde(default)]
    pub explanation: String,
}

/// Homebrew formula metadata from JSON API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub versions: Versions,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub oldnames: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub bottle: Option<Bottle>,
    #[serde(default)]
    pub keg_only: bool,
    #[serde(default)]
    pub keg_only_reason: Option<KegOnlyReason>,
}

impl Formula {
    /// Version directory name inside the cellar, with `_N` for revisions.
    pub fn pkg_version(&self) -> Option<String> {
        let stable = self.versions.stable.as_ref()?;
        Some(if self.revision > 0 {
            format!("{}_{}", stable, self.revision)
        } else {
            stable.clone()
        })
    }

    pub fn bottle_files(&self) -> Option<&HashMap<String, BottleFile>> {
        self.bottle
            .as_ref()
            .and_then(|b| b.stable.as_ref())
            .map(|s| &s.files)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Versions {
    #[serde(default)]
    pub stable: Option<String>,
    #[serde(default)]
    pub head: Option<String>,
    #[serde(default)]
    pub bottle: bool,
}

/// Bottle file metadata for a specific platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleFile {
    pub cellar: String,
    pub url: String,
    pub sha256: String,
}

/// Bottle metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleData {
    pub rebuild: u32,
    #[serde(default)]
    pub root_url: Option<String>,
    pub files: HashMap<String, BottleFile>,
}

/// Bottle information from API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottle {
    #[serde(default)]
    pub stable: Option<BottleData>,
}

/// Cask metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cask {
    pub token: String,
    #[serde(default)]
    pub full_token: String,
    #[serde(default)]
    pub old_tokens: Vec<String>,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Homebrew API client with in-memory caching
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    downloader: Arc<dyn Downloader>,
    config: Arc<Config>,
    trusted_key: Option<Arc<TrustedKey>>,
    formula_cache: moka::future::Cache<String, Formula>,
    cask_cache: moka::future::Cache<String, Cask>,
}

impl ApiClient {
    /// Client using [`HttpDownloader`] for manifests and the configured
    /// public key for signature checks.
    pub fn new(config: Config) -> Result<Self> {
        let downloader = Arc::new(HttpDownloader::new()?);
        Self::with_downloader(config, downloader)
    }

    pub fn with_downloader(config: Config, downloader: Arc<dyn Downloader>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(format!("pourover/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        let trusted_key = match TrustedKey::from_pem_file(TRUSTED_KEY_ID, &config.api_public_key) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                tracing::debug!("No API signing key loaded: {}", e);
                None
            }
        };

        Ok(Self {
            client,
            downloader,
            config: Arc::new(config),
            trusted_key,
            formula_cache: moka::future::Cache::new(1000),
            cask_cache: moka::future::Cache::new(500),
        })
    }

    /// Replace the key manifests must be signed with.
    pub fn with_trusted_key(mut self, key: TrustedKey) -> Self {
        self.trusted_key = Some(Arc::new(key));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared configuration, for components that outlive a borrow.
    pub fn config_arc(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn downloader(&self) -> Arc<dyn Downloader> {
        Arc::clone(&self.downloader)
    }

    /// Fetch metadata for a specific formula by name (with in-memory caching).
    ///
    /// # Errors
    ///
    /// [`PourError::NotFound`] on a 404, [`PourError::Fetch`] when the request
    /// itself fails.
    pub async fn fetch_formula(&self, name: &str) -> Result<Formula> {
        if let Some(cached) = self.formula_cache.get(name).await {
            return Ok(cached);
        }

        let formula: Formula = self.get_json("formula", "Formula", name).await?;
        self.formula_cache
            .insert(name.to_string(), formula.clone())
            .await;
        Ok(formula)
    }

    /// Fetch specific cask by token (with in-memory caching)
    pub async fn fetch_cask(&self, token: &str) -> Result<Cask> {
        if let Some(cached) = self.cask_cache.get(token).await {
            return Ok(cached);
        }

        let cask: Cask = self.get_json("cask", "Cask", token).await?;
        self.cask_cache.insert(token.to_string(), cask.clone()).await;
        Ok(cask)
    }

    /// `GET {api}/{category}/{name}.json`, falling back to the default domain
    /// once when a custom domain fails.
    async fn get_json<T: DeserializeOwned>(
        &self,
        category: &str,
        kind: &'static str,
        name: &str,
    ) -> Result<T> {
        let endpoint = format!("{}/{}.json", category, name);
        let mut last_error = None;

        for domain in self.domains() {
            let url = format!("{}/{}", domain, endpoint);
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(PourError::Fetch {
                        url,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(PourError::NotFound {
                    kind,
                    name: name.to_string(),
                    suggestions: Vec::new(),
                });
            }
            if !response.status().is_success() {
                last_error = Some(PourError::Fetch {
                    url,
                    reason: format!("HTTP {}", response.status()),
                });
                continue;
            }

            let body = response.text().await.map_err(|e| PourError::Fetch {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            return Ok(serde_json::from_str(&body)?);
        }

        Err(last_error.unwrap_or_else(|| PourError::Fetch {
            url: endpoint,
            reason: "no API domain configured".into(),
        }))
    }

    /// The configured domain, then the default one if they differ.
    fn domains(&self) -> Vec<&str> {
        let mut domains = vec![self.config.api_domain.as_str()];
        if self.config.api_domain != HOMEBREW_API_DEFAULT_DOMAIN {
            domains.push(HOMEBREW_API_DEFAULT_DOMAIN);
        }
        domains
    }

    /// Mirror `endpoint` into the API cache and return its (verified) JSON.
    ///
    /// The second value is true when the content now cached differs from
    /// what was cached before the call.
    ///
    /// Download is skipped while the cached copy is non-empty and either
    /// younger than the auto-update interval or auto-update is disabled. A
    /// failed refresh falls back to a usable cached copy with a warning.
    /// Cached files that fail to parse or to verify are discarded and
    /// downloaded again. For `*.jws.json` endpoints a download must verify
    /// before its bytes are written to the cache; on failure the previous
    /// snapshot stays as it was.
    ///
    /// The whole refresh runs under the endpoint's inter-process lock, and
    /// every download is staged in its own directory.
    pub async fn fetch_json_api_file(&self, endpoint: &str) -> Result<(Value, bool)> {
        let api_dir = self.config.api_cache();
        let target = api_dir.join(endpoint);
        let _lock = self.lock_endpoint(endpoint).await?;

        let previous_digest = if cache::is_present(&target) {
            tokio::fs::read(&target).await.ok().map(|bytes| digest(&bytes))
        } else {
            None
        };

        let mut skip_download = cache::is_present(&target)
            && (self.config.no_auto_update
                || cache::is_cache_fresh(&target, self.config.api_auto_update));
        let mut corrupt_count = 0;

        loop {
            let mut staging = None;
            let source = if skip_download {
                target.clone()
            } else {
                tokio::fs::create_dir_all(&api_dir)
                    .await
                    .map_err(|e| PourError::io(&api_dir, e))?;
                let dir = tempfile::Builder::new()
                    .prefix(".download-")
                    .tempdir_in(&api_dir)
                    .map_err(|e| PourError::io(&api_dir, e))?;
                match self.download(endpoint, &dir.path().join(endpoint)).await {
                    Ok(path) => {
                        staging = Some(dir);
                        path
                    }
                    Err(e) if cache::is_present(&target) => {
                        tracing::warn!(
                            "{}: update failed, falling back to cached version: {}",
                            endpoint,
                            e
                        );
                        skip_download = true;
                        target.clone()
                    }
                    Err(e) => return Err(e),
                }
            };
            let from_cache = staging.is_none();

            let bytes = tokio::fs::read(&source)
                .await
                .map_err(|e| PourError::io(&source, e))?;
            let verified = serde_json::from_slice::<Value>(&bytes)
                .map_err(PourError::from)
                .and_then(|json| {
                    if endpoint.ends_with(".jws.json") {
                        self.verify(endpoint, &json)
                    } else {
                        Ok(json)
                    }
                });

            let data = match verified {
                Ok(data) => data,
                Err(e @ PourError::Signature { .. }) if !from_cache => return Err(e),
                Err(e) => {
                    tracing::warn!("Discarding unusable {}: {}", source.display(), e);
                    if from_cache {
                        let _ = tokio::fs::remove_file(&target).await;
                    }
                    corrupt_count += 1;
                    if corrupt_count > CORRUPT_MANIFEST_RETRIES {
                        return Err(e);
                    }
                    skip_download = false;
                    continue;
                }
            };

            if from_cache {
                return Ok((data, false));
            }

            cache::write_atomic(&target, &bytes)?;
            let updated = previous_digest.as_deref() != Some(digest(&bytes).as_str());
            tracing::debug!("Refreshed {} (changed: {})", endpoint, updated);
            return Ok((data, updated));
        }
    }

    /// Exclusive lock guarding one endpoint's cache file across processes.
    async fn lock_endpoint(&self, endpoint: &str) -> Result<FileLock> {
        let dir = self.config.lock_dir();
        let name = format!("api-{}", endpoint.split('.').next().unwrap_or(endpoint));
        let timeout = self.config.lock_timeout;
        tokio::task::spawn_blocking(move || FileLock::acquire(&dir, &name, timeout))
            .await
            .map_err(|e| PourError::io(PathBuf::from(endpoint), std::io::Error::other(e)))?
    }

    async fn download(&self, endpoint: &str, staging: &Path) -> Result<PathBuf> {
        let domains = self.domains();
        let url = format!("{}/{}", domains[0], endpoint);
        let mirrors = domains[1..]
            .iter()
            .map(|domain| format!("{}/{}", domain, endpoint))
            .collect();

        tracing::info!("Downloading {}", url);
        let request = DownloadRequest::new(url, staging).with_mirrors(mirrors);
        self.downloader.fetch(&request).await
    }

    fn verify(&self, endpoint: &str, envelope: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.config.api_domain, endpoint);
        let key = self.trusted_key.as_ref().ok_or_else(|| PourError::Signature {
            url: url.clone(),
            reason: format!("no public key at {}", self.config.api_public_key.display()),
        })?;

        jws::verify_and_parse(envelope, key).map_err(|e| PourError::Signature {
            url,
            reason: e.to_string(),
        })
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Overlay the `variations` entry for `tag` onto `entry`, dropping the
/// `variations` table itself.
pub fn merge_variations(entry: &Value, tag: &Tag) -> Value {
    let Some(object) = entry.as_object() else {
        return entry.clone();
    };

    let mut merged = object.clone();
    let variations = merged.remove("variations");
    if let Some(Value::Object(variation)) = variations
        .as_ref()
        .and_then(|v| v.get(tag.to_string()))
    {
        for (key, value) in variation {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_variations_overlays_matching_tag() {
        let entry = json!({
            "name": "foo",
            "dependencies": ["a"],
            "variations": {
                "x86_64_linux": { "dependencies": ["a", "glibc"] },
                "arm64_sonoma": { "dependencies": [] }
            }
        });

        let linux: Tag = "x86_64_linux".parse().unwrap();
        let merged = merge_variations(&entry, &linux);
        assert_eq!(merged["dependencies"], json!(["a", "glibc"]));
        assert!(merged.get("variations").is_none());

        let ventura: Tag = "ventura".parse().unwrap();
        let merged = merge_variations(&entry, &ventura);
        assert_eq!(merged["dependencies"], json!(["a"]));
        assert!(merged.get("variations").is_none());
    }

    #[test]
    fn test_pkg_version_includes_revision() {
        let formula: Formula = serde_json::from_value(json!({
            "name": "foo",
            "versions": { "stable": "1.2.3" },
            "revision": 2
        }))
        .unwrap();
        assert_eq!(formula.pkg_version().as_deref(), Some("1.2.3_2"));
        assert!(formula.bottle_files().is_none());
    }
}
