//! Runtime configuration read from the `HOMEBREW_*` environment.
//!
//! Everything that varies between installations (where the prefix lives, where
//! the API is mirrored, how long a cached manifest stays fresh) is collected
//! into a single [`Config`] value. It is built once at startup and handed to
//! the components that need it by reference.
//!
//! # Examples
//!
//! ```no_run
//! use pourover::Config;
//!
//! let config = Config::from_env();
//! println!("Cellar: {}", config.cellar.display());
//! ```

use std::path::PathBuf;
use std::time::Duration;

pub const HOMEBREW_API_DEFAULT_DOMAIN: &str = "https://formulae.brew.sh/api";
pub const DEFAULT_API_AUTO_UPDATE_SECS: u64 = 450;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
pub const LINUX_DEFAULT_PREFIX: &str = "/home/linuxbrew/.linuxbrew";
pub const MACOS_ARM_DEFAULT_PREFIX: &str = "/opt/homebrew";
pub const MACOS_INTEL_DEFAULT_PREFIX: &str = "/usr/local";

/// Compiler flags that may legitimately glue themselves to the front of a path,
/// e.g. `-I/opt/homebrew/include`.
pub const DEFAULT_FLAG_PREFIXES: &[&str] = &["-F", "-I", "-L", "-isystem"];

#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: PathBuf,
    pub cellar: PathBuf,
    pub repository: PathBuf,
    pub library: PathBuf,
    pub cache: PathBuf,
    pub api_domain: String,
    pub api_auto_update: Duration,
    pub no_auto_update: bool,
    pub lock_timeout: Duration,
    pub api_public_key: PathBuf,
    pub flag_prefixes: Vec<String>,
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build a configuration from an arbitrary key lookup. Tests use this to
    /// avoid touching the real environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefix = lookup("HOMEBREW_PREFIX")
            .map(PathBuf::from)
            .unwrap_or_else(default_prefix);
        let cellar = lookup("HOMEBREW_CELLAR")
            .map(PathBuf::from)
            .unwrap_or_else(|| prefix.join("Cellar"));
        let repository = lookup("HOMEBREW_REPOSITORY")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_repository(&prefix));
        let library = lookup("HOMEBREW_LIBRARY")
            .map(PathBuf::from)
            .unwrap_or_else(|| repository.join("Library"));
        let cache = lookup("HOMEBREW_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_cache(&lookup));

        let api_domain = lookup("HOMEBREW_API_DOMAIN")
            .unwrap_or_else(|| HOMEBREW_API_DEFAULT_DOMAIN.to_string())
            .trim_end_matches('/')
            .to_string();
        let api_auto_update = Duration::from_secs(
            lookup("HOMEBREW_API_AUTO_UPDATE_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_API_AUTO_UPDATE_SECS),
        );
        let lock_timeout = Duration::from_secs(
            lookup("HOMEBREW_LOCK_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
        );
        let api_public_key = lookup("HOMEBREW_API_PUBLIC_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|| library.join("Homebrew/api/homebrew-1.pem"));

        let mut flag_prefixes: Vec<String> =
            DEFAULT_FLAG_PREFIXES.iter().map(|s| s.to_string()).collect();
        if let Some(extra) = lookup("HOMEBREW_RELOCATION_FLAG_PREFIXES") {
            for flag in extra.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                if !flag_prefixes.iter().any(|f| f == flag) {
                    flag_prefixes.push(flag.to_string());
                }
            }
        }

        Self {
            prefix,
            cellar,
            repository,
            library,
            cache,
            api_domain,
            api_auto_update,
            no_auto_update: lookup("HOMEBREW_NO_AUTO_UPDATE").is_some(),
            lock_timeout,
            api_public_key,
            flag_prefixes,
        }
    }

    /// Directory holding the downloaded API manifests and derived name files.
    pub fn api_cache(&self) -> PathBuf {
        self.cache.join("api")
    }

    /// Directory holding advisory lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.cache.join("locks")
    }

    pub fn downloads(&self) -> PathBuf {
        self.cache.join("downloads")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Detect the Homebrew prefix by platform and architecture.
fn default_prefix() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from(LINUX_DEFAULT_PREFIX)
    } else if cfg!(target_arch = "aarch64") {
        PathBuf::from(MACOS_ARM_DEFAULT_PREFIX)
    } else {
        PathBuf::from(MACOS_INTEL_DEFAULT_PREFIX)
    }
}

/// Intel macOS keeps the git checkout out of the way of `/usr/local`.
fn default_repository(prefix: &std::path::Path) -> PathBuf {
    if prefix == std::path::Path::new(MACOS_INTEL_DEFAULT_PREFIX) {
        prefix.join("Homebrew")
    } else {
        prefix.to_path_buf()
    }
}

fn default_cache(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(cache_home) = lookup("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("pourover")
    } else if let Some(home) = lookup("HOME") {
        PathBuf::from(home).join(".cache/pourover")
    } else {
        PathBuf::from(".cache/pourover")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_paths_derive_from_prefix() {
        let config = config_with(&[("HOMEBREW_PREFIX", "/opt/test"), ("HOME", "/home/me")]);
        assert_eq!(config.cellar, PathBuf::from("/opt/test/Cellar"));
        assert_eq!(config.repository, PathBuf::from("/opt/test"));
        assert_eq!(config.library, PathBuf::from("/opt/test/Library"));
        assert_eq!(config.cache, PathBuf::from("/home/me/.cache/pourover"));
        assert_eq!(config.api_cache(), PathBuf::from("/home/me/.cache/pourover/api"));
    }

    #[test]
    fn test_intel_repository_is_nested() {
        let config = config_with(&[("HOMEBREW_PREFIX", "/usr/local")]);
        assert_eq!(config.repository, PathBuf::from("/usr/local/Homebrew"));
        assert_eq!(config.library, PathBuf::from("/usr/local/Homebrew/Library"));
    }

    #[test]
    fn test_api_settings() {
        let config = config_with(&[
            ("HOMEBREW_API_DOMAIN", "https://mirror.example.com/api/"),
            ("HOMEBREW_API_AUTO_UPDATE_SECS", "60"),
            ("HOMEBREW_NO_AUTO_UPDATE", "1"),
        ]);
        assert_eq!(config.api_domain, "https://mirror.example.com/api");
        assert_eq!(config.api_auto_update, Duration::from_secs(60));
        assert!(config.no_auto_update);

        let defaults = config_with(&[]);
        assert_eq!(defaults.api_domain, HOMEBREW_API_DEFAULT_DOMAIN);
        assert_eq!(
            defaults.api_auto_update,
            Duration::from_secs(DEFAULT_API_AUTO_UPDATE_SECS)
        );
        assert!(!defaults.no_auto_update);
    }

    #[test]
    fn test_extra_flag_prefixes_are_appended_once() {
        let config = config_with(&[("HOMEBREW_RELOCATION_FLAG_PREFIXES", "-iquote, -I,-R")]);
        assert_eq!(
            config.flag_prefixes,
            vec!["-F", "-I", "-L", "-isystem", "-iquote", "-R"]
        );
    }
}
