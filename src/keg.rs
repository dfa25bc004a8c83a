//! Relocating an installed keg.
//!
//! A keg is one versioned package directory under the cellar:
//! ```text
//! /opt/homebrew/Cellar/ripgrep/14.1.0/
//!   INSTALL_RECEIPT.json
//!   bin/
//!   share/
//! ```
//!
//! Bottles are built with every well-known Homebrew path replaced by an
//! `@@HOMEBREW_*@@` placeholder. [`Keg::replace_locations_with_placeholders`]
//! produces that form, [`Keg::replace_placeholders_with_locations`] undoes it
//! at pour time, and [`Keg::relocate_build_prefix`] moves a tree from one
//! concrete directory to another.
//!
//! Every mutating operation holds the keg's advisory lock. A relocation that
//! fails part-way leaves a `RELOCATION_FAILED` marker so the keg is reported
//! as needing reinstallation instead of looking healthy.

use crate::config::Config;
use crate::elf::ElfFile;
use crate::error::{PourError, Result};
use crate::linkage::{self, CxxStdlib, DynamicLinkage};
use crate::lock::FileLock;
use crate::platform::Platform;
use crate::relocation::{Matcher, Relocation};
use crate::rewrite::{self, RewriteReport};
use memchr::memmem;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use walkdir::WalkDir;

pub const PREFIX_PLACEHOLDER: &str = "@@HOMEBREW_PREFIX@@";
pub const CELLAR_PLACEHOLDER: &str = "@@HOMEBREW_CELLAR@@";
pub const REPOSITORY_PLACEHOLDER: &str = "@@HOMEBREW_REPOSITORY@@";
pub const LIBRARY_PLACEHOLDER: &str = "@@HOMEBREW_LIBRARY@@";
pub const PERL_PLACEHOLDER: &str = "@@HOMEBREW_PERL@@";
pub const JAVA_PLACEHOLDER: &str = "@@HOMEBREW_JAVA@@";

pub const LIBTOOL_EXTENSIONS: &[&str] = &["la", "lai"];

/// Documentation files that never need relocating.
const METAFILE_EXTENSIONS: &[&str] = &["adoc", "md", "rdoc", "rst", "rtf", "txt"];

/// Directory inside a keg for bookkeeping files.
pub const STATE_DIR: &str = ".pourover";
const FAILURE_MARKER: &str = "RELOCATION_FAILED";

static OPENJDK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^openjdk(@\d[\d.]*)?$").expect("static openjdk regex is valid"));

/// How far a relocation got. Ordered: a later state implies every earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelocationState {
    Unrelocated,
    TextRewritten,
    BinariesPatched,
    Verified,
}

/// Result of a successful relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationOutcome {
    pub state: RelocationState,
    /// Changed files, relative to the keg.
    pub changed: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RuntimeDependency {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct Receipt {
    #[serde(default)]
    runtime_dependencies: Vec<RuntimeDependency>,
}

pub struct Keg {
    path: PathBuf,
    name: String,
    config: Arc<Config>,
    linkage: Arc<dyn DynamicLinkage>,
}

impl std::fmt::Debug for Keg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keg")
            .field("path", &self.path)
            .field("name", &self.name)
            .finish()
    }
}

impl Keg {
    /// Open the keg at `path` (`<cellar>/<name>/<version>`).
    ///
    /// # Errors
    ///
    /// When `path` is not a directory.
    pub fn new(path: impl Into<PathBuf>, config: Arc<Config>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(PourError::NotFound {
                kind: "Keg",
                name: path.display().to_string(),
                suggestions: Vec::new(),
            });
        }
        let name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path,
            name,
            config,
            linkage: Arc::from(Platform::current().linkage()),
        })
    }

    /// Use a different linkage strategy than the running platform's.
    pub fn with_linkage(mut self, linkage: Arc<dyn DynamicLinkage>) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Exclusive advisory lock for this keg, shared across processes.
    pub fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(
            &self.config.lock_dir(),
            &format!("keg-{}", self.path.display()),
            self.config.lock_timeout,
        )
    }

    fn path_string(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn perl_pattern(&self) -> Matcher {
        let prefix = regex::escape(&Self::path_string(&self.config.prefix));
        let regex = regex::bytes::Regex::new(&format!(
            r"(?m)\A#!(/usr/bin/perl\d\.\d+|{prefix}/opt/perl/bin/perl)(?: |$)"
        ))
        .expect("escaped perl pattern is valid");
        Matcher::pattern_group(regex, 1)
    }

    fn java_pattern(&self) -> Matcher {
        let prefix = regex::escape(&Self::path_string(&self.config.prefix));
        let regex = regex::bytes::Regex::new(&format!(
            r"{prefix}/opt/openjdk(@\d+(\.\d+)*)?/libexec(/openjdk\.jdk/Contents/Home)?"
        ))
        .expect("escaped java pattern is valid");
        Matcher::pattern(regex)
    }

    /// Concrete paths to placeholders, for building bottles.
    pub fn prepare_relocation_to_placeholders(&self) -> Relocation {
        let config = &self.config;
        let mut relocation = Relocation::with_flag_prefixes(config.flag_prefixes.clone());
        relocation.add_replacement_pair(
            "prefix",
            &Self::path_string(&config.prefix),
            PREFIX_PLACEHOLDER,
            true,
        );
        relocation.add_replacement_pair(
            "cellar",
            &Self::path_string(&config.cellar),
            CELLAR_PLACEHOLDER,
            true,
        );
        // With prefix == repository the two cannot be told apart again, so
        // everything becomes the prefix placeholder.
        if config.prefix != config.repository {
            relocation.add_replacement_pair(
                "repository",
                &Self::path_string(&config.repository),
                REPOSITORY_PLACEHOLDER,
                true,
            );
        }
        relocation.add_replacement_pair(
            "library",
            &Self::path_string(&config.library),
            LIBRARY_PLACEHOLDER,
            true,
        );
        relocation.add_rule("perl", self.perl_pattern(), PERL_PLACEHOLDER);
        relocation.add_rule("java", self.java_pattern(), JAVA_PLACEHOLDER);
        relocation
    }

    /// Placeholders to concrete paths, for pouring bottles.
    pub fn prepare_relocation_to_locations(&self) -> Relocation {
        let config = &self.config;
        let prefix = Self::path_string(&config.prefix);
        let mut relocation = Relocation::with_flag_prefixes(config.flag_prefixes.clone());
        relocation.add_replacement_pair("prefix", PREFIX_PLACEHOLDER, &prefix, false);
        relocation.add_replacement_pair(
            "cellar",
            CELLAR_PLACEHOLDER,
            &Self::path_string(&config.cellar),
            false,
        );
        relocation.add_replacement_pair(
            "repository",
            REPOSITORY_PLACEHOLDER,
            &Self::path_string(&config.repository),
            false,
        );
        relocation.add_replacement_pair(
            "library",
            LIBRARY_PLACEHOLDER,
            &Self::path_string(&config.library),
            false,
        );
        relocation.add_replacement_pair(
            "perl",
            PERL_PLACEHOLDER,
            &format!("{prefix}/opt/perl/bin/perl"),
            false,
        );
        if let Some(openjdk) = self.openjdk_dep_name() {
            relocation.add_replacement_pair(
                "java",
                JAVA_PLACEHOLDER,
                &format!("{prefix}/opt/{openjdk}/libexec"),
                false,
            );
        }
        relocation
    }

    /// Rewrite the keg into its path-independent bottle form.
    pub fn replace_locations_with_placeholders(&self) -> Result<RelocationOutcome> {
        let relocation = self.prepare_relocation_to_placeholders();
        let files = self.relocatable_files();
        self.apply(&relocation, &files, false)
    }

    /// Rewrite a freshly poured keg to point at this installation. `files`
    /// limits the text rewrite to the given keg-relative paths.
    pub fn replace_placeholders_with_locations(
        &self,
        files: Option<&[PathBuf]>,
        skip_linkage: bool,
    ) -> Result<RelocationOutcome> {
        let relocation = self.prepare_relocation_to_locations();
        let files = match files {
            Some(files) => files.iter().map(|f| self.path.join(f)).collect(),
            None => self.relocatable_files(),
        };
        self.apply(&relocation, &files, skip_linkage)
    }

    fn apply(
        &self,
        relocation: &Relocation,
        files: &[PathBuf],
        skip_linkage: bool,
    ) -> Result<RelocationOutcome> {
        let _lock = self.lock()?;
        let mut changed = Vec::new();

        let report = rewrite::replace_text_in_files(files, relocation);
        self.absorb(report, RelocationState::Unrelocated, &mut changed)?;

        if !skip_linkage {
            let report = self.linkage.relocate(self, relocation);
            self.absorb(report, RelocationState::TextRewritten, &mut changed)?;
        }

        self.clear_failure()?;
        Ok(RelocationOutcome {
            state: RelocationState::BinariesPatched,
            changed: self.relative(changed),
        })
    }

    /// Fold a bulk report into `changed`, or fail the keg at `state`.
    fn absorb(
        &self,
        report: RewriteReport,
        state: RelocationState,
        changed: &mut Vec<PathBuf>,
    ) -> Result<()> {
        if let Some((file, error)) = report.failures.into_iter().next() {
            return Err(self.fail(state, file, error.to_string()));
        }
        changed.extend(report.changed);
        Ok(())
    }

    /// Move every reference to `old_prefix` in the keg to `new_prefix`.
    ///
    /// Text files are rewritten at path boundaries. Dynamic ELF binaries get
    /// their interpreter and search path patched, then every remaining
    /// occurrence in a binary is replaced in place with NUL padding. The keg
    /// only counts as relocated once a rescan finds no file still referring
    /// to `old_prefix`.
    ///
    /// # Errors
    ///
    /// [`PourError::Relocation`] naming the state reached and the first
    /// offending file. The keg is then marked as needing reinstallation.
    pub fn relocate_build_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<RelocationOutcome> {
        let _lock = self.lock()?;
        let mut relocation = Relocation::with_flag_prefixes(self.config.flag_prefixes.clone());
        relocation.add_replacement_pair("prefix", old_prefix, new_prefix, true);
        let Some((matcher, _)) = relocation.replacement_pair_for("prefix") else {
            return Ok(RelocationOutcome {
                state: RelocationState::Verified,
                changed: Vec::new(),
            });
        };

        // Every file that mentions the old prefix is rewritten, metafiles
        // included, so the rescan below can reach a fixed point.
        let (binaries, texts): (Vec<Vec<PathBuf>>, Vec<Vec<PathBuf>>) = self
            .link_groups_matching(old_prefix)
            .into_iter()
            .partition(|group| group.first().is_some_and(|file| is_patchable_binary(file)));

        let mut changed = Vec::new();
        let text = rewrite::replace_text_in_files(&texts.concat(), &relocation);
        self.absorb(text, RelocationState::Unrelocated, &mut changed)?;
        tracing::debug!("{}: text rewritten", self.name);

        let mut failures = Vec::new();
        for group in binaries {
            let Some((file, siblings)) = group.split_first() else {
                continue;
            };
            let result = self
                .patch_binary(file, matcher, old_prefix, new_prefix)
                .and_then(|patched| {
                    if patched {
                        rewrite::relink_hard_links(file, siblings)?;
                    }
                    Ok(patched)
                });
            match result {
                Ok(true) => changed.extend(group.iter().cloned()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to relocate {}: {}", file.display(), e);
                    failures.push((file.clone(), e));
                }
            }
        }
        if let Some((file, error)) = failures.into_iter().next() {
            return Err(self.fail(RelocationState::TextRewritten, file, error.to_string()));
        }
        tracing::debug!("{}: binaries patched", self.name);

        if let Some(file) = self
            .files_matching(old_prefix)
            .into_iter()
            .find(|file| fs::read(file).is_ok_and(|data| matcher.is_match(&data)))
        {
            return Err(self.fail(
                RelocationState::BinariesPatched,
                file,
                format!("still refers to {old_prefix}"),
            ));
        }

        self.clear_failure()?;
        changed.sort();
        changed.dedup();
        Ok(RelocationOutcome {
            state: RelocationState::Verified,
            changed: self.relative(changed),
        })
    }

    fn patch_binary(&self, file: &Path, matcher: &Matcher, old: &str, new: &str) -> Result<bool> {
        let mut elf = ElfFile::new(file);
        let mut changed = linkage::substitute_elf_paths(&mut elf, matcher, new)?;

        let data = fs::read(file).map_err(|e| PourError::io(file, e))?;
        if let Some(patched) = rewrite::replace_in_binary(file, &data, old, new)? {
            tracing::debug!("Replacing build prefix in {}", file.display());
            rewrite::write_preserving_metadata(file, &patched)?;
            changed = true;
        }
        if changed {
            self.linkage.codesign_patched_binary(file)?;
        }
        Ok(changed)
    }

    /// Files in the keg containing `needle`, one per inode, bookkeeping
    /// excluded.
    pub fn files_matching(&self, needle: &str) -> Vec<PathBuf> {
        let state_dir = self.path.join(STATE_DIR);
        rewrite::each_unique_file_matching(&self.path, needle)
            .filter(|file| !file.starts_with(&state_dir))
            .collect()
    }

    /// Regular files containing `needle`, grouped by inode, bookkeeping
    /// excluded.
    fn link_groups_matching(&self, needle: &str) -> Vec<Vec<PathBuf>> {
        let ignores = [self.path.join(STATE_DIR)];
        let finder = memmem::Finder::new(needle.as_bytes());
        let files: Vec<PathBuf> = rewrite::find_matching_files(&self.path, &ignores).collect();
        rewrite::hard_link_groups(&files)
            .into_iter()
            .filter(|group| {
                group
                    .first()
                    .is_some_and(|file| fs::read(file).is_ok_and(|data| finder.find(&data).is_some()))
            })
            .collect()
    }

    /// Text files and libtool archives, deduplicated.
    pub fn relocatable_files(&self) -> Vec<PathBuf> {
        let set: BTreeSet<PathBuf> = self
            .text_files()
            .into_iter()
            .chain(self.libtool_files())
            .collect();
        set.into_iter().collect()
    }

    fn walk(&self) -> impl Iterator<Item = walkdir::DirEntry> + '_ {
        let state_dir = self.path.join(STATE_DIR);
        WalkDir::new(&self.path)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| e.path() != state_dir)
            .filter_map(|e| e.ok())
    }

    /// Scripts and any other file without a NUL byte near its start.
    pub fn text_files(&self) -> Vec<PathBuf> {
        let formula_file = self.path.join(".brew").join(format!("{}.rb", self.name));
        self.walk()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|path| {
                // Python virtualenvs record their original prefix here.
                if path.file_name().is_some_and(|n| n == "orig-prefix.txt") {
                    return true;
                }
                if *path == formula_file || has_extension(path, METAFILE_EXTENSIONS) {
                    return false;
                }
                if rewrite::is_text_executable(path) {
                    return true;
                }
                matches!(rewrite::is_binary_file(path), Ok(false))
            })
            .collect()
    }

    pub fn libtool_files(&self) -> Vec<PathBuf> {
        self.walk()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|path| has_extension(path, LIBTOOL_EXTENSIONS))
            .collect()
    }

    pub fn symlink_files(&self) -> Vec<PathBuf> {
        self.walk()
            .filter(|e| e.path_is_symlink())
            .map(|e| e.into_path())
            .collect()
    }

    /// Turn absolute symlinks into the cellar or prefix into relative ones.
    pub fn fix_dynamic_linkage(&self) -> Result<Vec<PathBuf>> {
        let mut fixed = Vec::new();
        for file in self.symlink_files() {
            let link = fs::read_link(&file).map_err(|e| PourError::io(&file, e))?;
            if !link.is_absolute() {
                continue;
            }
            if !link.starts_with(&self.config.cellar) && !link.starts_with(&self.config.prefix) {
                continue;
            }
            let Some(parent) = file.parent() else {
                continue;
            };

            let relative = relative_path(parent, &link);
            fs::remove_file(&file).map_err(|e| PourError::io(&file, e))?;
            unix_fs::symlink(&relative, &file).map_err(|e| PourError::io(&file, e))?;
            tracing::debug!("{} -> {}", file.display(), relative.display());
            fixed.push(file);
        }
        Ok(self.relative(fixed))
    }

    /// Runtime dependencies recorded in the install receipt.
    pub fn runtime_dependencies(&self) -> Vec<String> {
        let receipt_path = self.path.join("INSTALL_RECEIPT.json");
        let Ok(contents) = fs::read_to_string(&receipt_path) else {
            return Vec::new();
        };
        match serde_json::from_str::<Receipt>(&contents) {
            Ok(receipt) => receipt
                .runtime_dependencies
                .into_iter()
                .map(|d| d.full_name)
                .collect(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable receipt {}: {}", receipt_path.display(), e);
                Vec::new()
            }
        }
    }

    /// The `openjdk` formula this keg runs against, if any.
    pub fn openjdk_dep_name(&self) -> Option<String> {
        self.runtime_dependencies()
            .into_iter()
            .find(|name| OPENJDK_NAME.is_match(name))
    }

    pub fn detect_cxx_stdlibs(&self, skip_executables: bool) -> Vec<CxxStdlib> {
        self.linkage.detect_cxx_stdlibs(self, skip_executables)
    }

    fn marker_path(&self) -> PathBuf {
        self.path.join(STATE_DIR).join(FAILURE_MARKER)
    }

    /// A previous relocation failed and the keg cannot be trusted.
    pub fn needs_reinstall(&self) -> bool {
        self.marker_path().exists()
    }

    fn fail(&self, state: RelocationState, file: PathBuf, reason: String) -> PourError {
        let marker = self.marker_path();
        let contents = format!("state: {state:?}\nfile: {}\nreason: {reason}\n", file.display());
        let written = marker
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&marker, contents));
        if let Err(e) = written {
            tracing::warn!("Could not write {}: {}", marker.display(), e);
        }

        PourError::Relocation {
            keg: self.path.clone(),
            state,
            file,
            reason,
        }
    }

    fn clear_failure(&self) -> Result<()> {
        let marker = self.marker_path();
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PourError::io(marker, e)),
        }
    }

    fn relative(&self, files: Vec<PathBuf>) -> Vec<PathBuf> {
        files
            .into_iter()
            .map(|f| f.strip_prefix(&self.path).map(Path::to_path_buf).unwrap_or(f))
            .collect()
    }
}

/// Binary content that is not a self-extracting shell archive, which would
/// break if patched.
fn is_patchable_binary(path: &Path) -> bool {
    matches!(rewrite::is_binary_file(path), Ok(true)) && !rewrite::is_text_executable(path)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

/// Path to `target` from the directory `base`. Both must be absolute.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}
