//! Downloader collaborator: fetch a URL (or one of its mirrors) to a local
//! path, verifying an optional SHA-256 checksum before the file appears at
//! its final location.

use crate::error::{PourError, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub mirrors: Vec<String>,
    pub checksum: Option<String>,
    pub target: PathBuf,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            mirrors: Vec::new(),
            checksum: None,
            target: target.into(),
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Transport used by the API layer and bottle installs.
///
/// Implementations must leave `request.target` untouched on failure and map
/// every transport problem (including timeouts and cancellation) to
/// [`PourError::Fetch`].
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, request: &DownloadRequest) -> Result<PathBuf>;
}

/// SHA256 of a file, as lowercase hex.
pub async fn sha256_file(file_path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = fs::File::open(file_path)
        .await
        .map_err(|e| PourError::io(file_path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| PourError::io(file_path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

const GHCR_PREFIX: &str = "https://ghcr.io/";

/// reqwest-backed [`Downloader`].
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    show_progress: bool,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("pourover/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, label: &str) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("⬇ {}", label));
        Some(pb)
    }

    /// Stream one URL into `partial`.
    async fn fetch_one(&self, url: &str, partial: &Path) -> Result<()> {
        let fetch_err = |reason: String| PourError::Fetch {
            url: url.to_string(),
            reason,
        };

        let mut request = self.client.get(url);
        // GitHub Packages serves public bottles to an anonymous token.
        if url.starts_with(GHCR_PREFIX) {
            request = request.bearer_auth("QQ==");
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }

        let label = url.rsplit('/').next().unwrap_or(url);
        let pb = self.progress_bar(label);
        if let (Some(pb), Some(total)) = (&pb, response.content_length()) {
            pb.set_length(total);
        }

        let mut file = fs::File::create(partial)
            .await
            .map_err(|e| PourError::io(partial, e))?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| PourError::io(partial, e))?;
            downloaded += chunk.len() as u64;
            if let Some(pb) = &pb {
                pb.set_position(downloaded);
            }
        }
        file.flush().await.map_err(|e| PourError::io(partial, e))?;

        if let Some(pb) = &pb {
            pb.finish_with_message(format!("✓ {}", label));
        }
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, request: &DownloadRequest) -> Result<PathBuf> {
        if let Some(parent) = request.target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PourError::io(parent, e))?;
        }
        let partial = request.target.with_extension("incomplete");

        let mut last_error = None;
        for url in std::iter::once(&request.url).chain(request.mirrors.iter()) {
            match self.fetch_one(url, &partial).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Download from {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        if let Some(expected) = &request.checksum {
            let actual = sha256_file(&partial).await?;
            if &actual != expected {
                let _ = fs::remove_file(&partial).await;
                return Err(PourError::Checksum {
                    path: request.target.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        fs::rename(&partial, &request.target)
            .await
            .map_err(|e| PourError::io(&request.target, e))?;
        Ok(request.target.clone())
    }
}
