//! Local index over the signed formula/cask manifests.
//!
//! [`RemoteIndex`] turns one fetched manifest into three maps (entries,
//! aliases, renames) and persists flat name files next to the manifest for
//! shell completion. The maps are built in a single pass over one manifest,
//! so an alias or rename always points at an entry of the same snapshot.
//!
//! The first query in a process fetches; later queries are pure reads until
//! [`RemoteIndex::clear`] is called.

use crate::api::ApiClient;
use crate::cache;
use crate::error::{PourError, Result};
use crate::lock::FileLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_SUGGESTIONS: usize = 3;
const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Formula,
    Cask,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Formula => "formula",
            IndexKind::Cask => "cask",
        }
    }

    pub fn endpoint(self) -> String {
        format!("{}.jws.json", self.as_str())
    }

    pub fn label(self) -> &'static str {
        match self {
            IndexKind::Formula => "Formula",
            IndexKind::Cask => "Cask",
        }
    }

    /// Field holding the canonical name of an entry.
    fn key_field(self) -> &'static str {
        match self {
            IndexKind::Formula => "name",
            IndexKind::Cask => "token",
        }
    }
}

impl std::str::FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "formula" | "formulae" => Ok(IndexKind::Formula),
            "cask" | "casks" => Ok(IndexKind::Cask),
            other => Err(format!("unknown index kind: {other}")),
        }
    }
}

/// The maps derived from one manifest.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub entries: HashMap<String, Value>,
    pub aliases: HashMap<String, String>,
    pub renames: HashMap<String, String>,
}

impl IndexSnapshot {
    /// Derive entries, aliases and renames from a manifest array.
    ///
    /// Entries without a name are skipped along with their aliases. The
    /// name field itself is removed from the stored entry.
    pub fn from_manifest(kind: IndexKind, manifest: &Value) -> Self {
        let mut snapshot = Self::default();
        let Some(items) = manifest.as_array() else {
            tracing::warn!("{} manifest is not an array", kind.as_str());
            return snapshot;
        };

        for item in items {
            let Some(object) = item.as_object() else {
                continue;
            };
            let Some(name) = object.get(kind.key_field()).and_then(Value::as_str) else {
                continue;
            };

            if kind == IndexKind::Formula {
                for alias in string_list(object.get("aliases")) {
                    snapshot.aliases.insert(alias, name.to_string());
                }
            }
            for old in old_names(kind, object) {
                snapshot.renames.insert(old, name.to_string());
            }

            let mut entry = object.clone();
            entry.remove(kind.key_field());
            snapshot.entries.insert(name.to_string(), Value::Object(entry));
        }

        snapshot
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `oldnames` (or the legacy single `oldname`) for formulae, `old_tokens`
/// for casks.
fn old_names(kind: IndexKind, object: &serde_json::Map<String, Value>) -> Vec<String> {
    match kind {
        IndexKind::Formula => match object.get("oldnames") {
            Some(list) if list.is_array() => string_list(Some(list)),
            _ => object
                .get("oldname")
                .and_then(Value::as_str)
                .map(|old| vec![old.to_string()])
                .unwrap_or_default(),
        },
        IndexKind::Cask => string_list(object.get("old_tokens")),
    }
}

/// Process-wide view of one manifest kind.
pub struct RemoteIndex {
    api: ApiClient,
    kind: IndexKind,
    snapshot: Mutex<Option<Arc<IndexSnapshot>>>,
}

impl RemoteIndex {
    pub fn new(api: ApiClient, kind: IndexKind) -> Self {
        Self {
            api,
            kind,
            snapshot: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Drop the in-memory snapshot so the next query reloads it.
    pub async fn clear(&self) {
        *self.snapshot.lock().await = None;
    }

    /// The current snapshot, fetching and rebuilding derived files on first use.
    pub async fn snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        let mut guard = self.snapshot.lock().await;
        if let Some(snapshot) = guard.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let (manifest, updated) = self.api.fetch_json_api_file(&self.kind.endpoint()).await?;
        let snapshot = Arc::new(IndexSnapshot::from_manifest(self.kind, &manifest));
        tracing::debug!(
            "Loaded {} {} entries ({} aliases, {} renames)",
            snapshot.entries.len(),
            self.kind.as_str(),
            snapshot.aliases.len(),
            snapshot.renames.len()
        );

        self.write_derived_files(Arc::clone(&snapshot), updated).await?;
        *guard = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub async fn all_entries(&self) -> Result<Arc<IndexSnapshot>> {
        self.snapshot().await
    }

    pub async fn all_aliases(&self) -> Result<HashMap<String, String>> {
        Ok(self.snapshot().await?.aliases.clone())
    }

    pub async fn all_renames(&self) -> Result<HashMap<String, String>> {
        Ok(self.snapshot().await?.renames.clone())
    }

    /// Refresh the manifest regardless of the in-memory state.
    pub async fn update(&self) -> Result<Arc<IndexSnapshot>> {
        self.clear().await;
        self.snapshot().await
    }

    /// Resolve `name` to its canonical name: exact, then alias, then rename.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        let snapshot = self.snapshot().await?;
        if snapshot.entries.contains_key(name) {
            return Ok(name.to_string());
        }
        if let Some(target) = snapshot.aliases.get(name) {
            return Ok(target.clone());
        }
        if let Some(target) = snapshot.renames.get(name) {
            tracing::info!("{} was renamed to {}", name, target);
            return Ok(target.clone());
        }

        Err(PourError::NotFound {
            kind: self.kind.label(),
            name: name.to_string(),
            suggestions: suggestions(name, snapshot.entries.keys()),
        })
    }

    /// Entry metadata for `name`, after resolving aliases and renames.
    pub async fn get(&self, name: &str) -> Result<(String, Value)> {
        let canonical = self.resolve(name).await?;
        let snapshot = self.snapshot().await?;
        let entry = snapshot
            .entries
            .get(&canonical)
            .cloned()
            .unwrap_or(Value::Null);
        Ok((canonical, entry))
    }

    /// Names, aliases and renames files, written under the index lock.
    ///
    /// Aliases and renames go first so a reader that sees the new names file
    /// never pairs it with older derived maps.
    async fn write_derived_files(&self, snapshot: Arc<IndexSnapshot>, regenerate: bool) -> Result<()> {
        let config = self.api.config();
        let api_dir = config.api_cache();
        let lock_dir = config.lock_dir();
        let timeout = config.lock_timeout;
        let kind = self.kind;

        let task = tokio::task::spawn_blocking(move || -> Result<bool> {
            let names_path = api_dir.join(format!("{}_names.txt", kind.as_str()));
            if names_path.exists() && !regenerate {
                return Ok(false);
            }

            let _lock = FileLock::acquire(&lock_dir, &format!("api-{}", kind.as_str()), timeout)?;
            if kind == IndexKind::Formula {
                cache::write_pairs_file(
                    &api_dir.join("formula_aliases.txt"),
                    &sorted(&snapshot.aliases),
                )?;
            }
            cache::write_pairs_file(
                &api_dir.join(format!("{}_renames.txt", kind.as_str())),
                &sorted(&snapshot.renames),
            )?;

            let names: Vec<String> = snapshot.entries.keys().cloned().collect();
            cache::write_names_file(&api_dir, &names, kind.as_str(), true)
        });

        let written = task
            .await
            .map_err(|e| PourError::io(PathBuf::from(kind.as_str()), std::io::Error::other(e)))??;
        if written {
            tracing::debug!("Rewrote {} name files", self.kind.as_str());
        }
        Ok(())
    }
}

fn sorted(map: &HashMap<String, String>) -> BTreeMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Closest names by Jaro-Winkler similarity.
fn suggestions<'a>(name: &str, candidates: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .map(|candidate| (strsim::jaro_winkler(name, candidate), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, name)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_formula_manifest_maps() {
        let manifest = json!([
            {"name": "foo", "aliases": ["foo-alias1"], "desc": "Foo"},
            {"name": "bar", "aliases": [], "oldnames": ["baz", "qux"]},
            {"name": "legacy", "aliases": [], "oldname": "ancient"},
            {"aliases": ["orphan"]}
        ]);
        let snapshot = IndexSnapshot::from_manifest(IndexKind::Formula, &manifest);

        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(snapshot.entries["foo"], json!({"aliases": ["foo-alias1"], "desc": "Foo"}));
        assert_eq!(snapshot.aliases.len(), 1);
        assert_eq!(snapshot.aliases["foo-alias1"], "foo");
        assert_eq!(snapshot.renames["baz"], "bar");
        assert_eq!(snapshot.renames["qux"], "bar");
        assert_eq!(snapshot.renames["ancient"], "legacy");

        for target in snapshot.aliases.values().chain(snapshot.renames.values()) {
            assert!(snapshot.entries.contains_key(target));
        }
    }

    #[test]
    fn test_cask_manifest_uses_tokens() {
        let manifest = json!([
            {"token": "firefox", "old_tokens": ["firefox-esr-old"], "aliases": ["ff"]}
        ]);
        let snapshot = IndexSnapshot::from_manifest(IndexKind::Cask, &manifest);
        assert!(snapshot.entries.contains_key("firefox"));
        assert!(snapshot.aliases.is_empty());
        assert_eq!(snapshot.renames["firefox-esr-old"], "firefox");
    }

    #[test]
    fn test_suggestions_are_ranked_and_capped() {
        let names: Vec<String> = ["ripgrep", "ripgrep-all", "grep", "ripmime", "wget"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let found = suggestions("ripgre", names.iter());
        assert_eq!(found.first().map(String::as_str), Some("ripgrep"));
        assert!(found.len() <= MAX_SUGGESTIONS);
        assert!(!found.contains(&"wget".to_string()));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("formula".parse::<IndexKind>().unwrap(), IndexKind::Formula);
        assert_eq!("casks".parse::<IndexKind>().unwrap(), IndexKind::Cask);
        assert!("tap".parse::<IndexKind>().is_err());
        assert_eq!(IndexKind::Cask.endpoint(), "cask.jws.json");
    }
}
