//! Bottle tags and per-tag bottle specifications.
//!
//! A bottle is published once per platform, identified by a tag such as
//! `arm64_sonoma`, `sonoma` (Intel macOS) or `x86_64_linux`. A formula's
//! bottle table maps each tag to a checksum and a cellar policy; the
//! [`Collector`] answers "which of these bottles can this machine pour?".
//!
//! # Examples
//!
//! ```
//! use pourover::bottle::{CellarPolicy, Collector, Tag};
//!
//! let mut collector = Collector::new();
//! collector.add("arm64_ventura".parse().unwrap(), "abc123".into(), CellarPolicy::Any);
//!
//! // Sonoma can pour the Ventura bottle; an Intel machine cannot.
//! let sonoma: Tag = "arm64_sonoma".parse().unwrap();
//! assert!(collector.specification_for(&sonoma, false).is_some());
//! assert!(collector.specification_for(&"sonoma".parse().unwrap(), false).is_none());
//! ```

use crate::api::BottleFile;
use crate::error::{PourError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

/// macOS release names and the version each one corresponds to.
const MACOS_VERSIONS: &[(&str, &str)] = &[
    ("tahoe", "26"),
    ("sequoia", "15"),
    ("sonoma", "14"),
    ("ventura", "13"),
    ("monterey", "12"),
    ("big_sur", "11"),
    ("catalina", "10.15"),
    ("mojave", "10.14"),
    ("high_sierra", "10.13"),
    ("sierra", "10.12"),
    ("el_capitan", "10.11"),
];

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<arch>x86_64h|x86_64|i386|ppc64le|ppc64|ppc7400|ppc7450|ppc970|ppc32|ppc|arm64|aarch64)_)?(?P<system>[\w.]+)$",
    )
    .expect("static tag regex is valid")
});

/// CPU architecture of a bottle tag.
///
/// `Intel` and `Arm` are the spellings the formula DSL uses; they compare
/// equal to `X86_64` and `Arm64` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Intel,
    Arm64,
    Arm,
    I386,
    PowerPc,
    All,
}

impl Arch {
    pub fn standardized(self) -> Arch {
        match self {
            Arch::Intel => Arch::X86_64,
            Arch::Arm => Arch::Arm64,
            other => other,
        }
    }

    pub fn is_intel(self) -> bool {
        self.standardized() == Arch::X86_64
    }

    pub fn is_arm(self) -> bool {
        self.standardized() == Arch::Arm64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Intel => "intel",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::I386 => "i386",
            Arch::PowerPc => "ppc",
            Arch::All => "all",
        }
    }
}

impl FromStr for Arch {
    type Err = PourError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "x86_64" | "x86_64h" => Arch::X86_64,
            "intel" => Arch::Intel,
            "arm64" | "aarch64" => Arch::Arm64,
            "arm" => Arch::Arm,
            "i386" => Arch::I386,
            "ppc" | "ppc32" | "ppc64" | "ppc64le" | "ppc7400" | "ppc7450" | "ppc970" => {
                Arch::PowerPc
            }
            "all" => Arch::All,
            other => return Err(PourError::InvalidTag(format!("unknown architecture {other}"))),
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A macOS version number, compared component-wise (`10.15 < 11`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacOsVersion(Vec<u32>);

impl MacOsVersion {
    pub fn from_name(name: &str) -> Option<Self> {
        MACOS_VERSIONS
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| v.parse().ok())
    }

    /// Release name for a full product version such as `14.6.1` or `10.15.7`.
    /// Releases from Big Sur on are named by major version alone.
    pub fn name(&self) -> Option<&'static str> {
        let significant = match self.0.as_slice() {
            [major, ..] if *major >= 11 => MacOsVersion(vec![*major]),
            [major, minor, ..] => MacOsVersion(vec![*major, *minor]),
            _ => return None,
        };
        MACOS_VERSIONS
            .iter()
            .find(|(_, v)| v.parse::<MacOsVersion>().is_ok_and(|v| v == significant))
            .map(|(name, _)| *name)
    }
}

impl FromStr for MacOsVersion {
    type Err = PourError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: std::result::Result<Vec<u32>, _> = s.split('.').map(str::parse).collect();
        match parts {
            Ok(parts) if !parts.is_empty() && parts[0] >= 10 => Ok(MacOsVersion(parts)),
            _ => Err(PourError::InvalidTag(format!("unknown macOS version {s}"))),
        }
    }
}

impl PartialOrd for MacOsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MacOsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

/// Platform + architecture identifier of a bottle.
///
/// Equality and hashing use the standardized architecture, so
/// `ventura`/`intel` and `ventura`/`x86_64` are the same tag.
#[derive(Debug, Clone)]
pub struct Tag {
    system: String,
    arch: Arch,
}

impl Tag {
    pub fn new(system: impl Into<String>, arch: Arch) -> Self {
        Self {
            system: system.into(),
            arch,
        }
    }

    /// The universal tag used by architecture-independent bottles.
    pub fn all() -> Self {
        Self::new("all", Arch::All)
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn standardized_arch(&self) -> Arch {
        self.arch.standardized()
    }

    pub fn is_all(&self) -> bool {
        self.system == "all" && self.arch == Arch::All
    }

    pub fn is_linux(&self) -> bool {
        self.system == "linux"
    }

    pub fn macos_version(&self) -> Option<MacOsVersion> {
        MacOsVersion::from_name(&self.system)
    }

    pub fn is_macos(&self) -> bool {
        self.macos_version().is_some()
    }

    /// ARM bottles only exist for Big Sur and newer, and never for Linux.
    pub fn valid_combination(&self) -> bool {
        if !self.arch.is_arm() {
            return true;
        }
        if self.is_linux() {
            return false;
        }
        match (self.macos_version(), MacOsVersion::from_name("big_sur")) {
            (Some(version), Some(big_sur)) => version >= big_sur,
            _ => false,
        }
    }

    pub fn default_prefix(&self) -> &'static str {
        if self.is_linux() {
            crate::config::LINUX_DEFAULT_PREFIX
        } else if self.arch.is_arm() {
            crate::config::MACOS_ARM_DEFAULT_PREFIX
        } else {
            crate::config::MACOS_INTEL_DEFAULT_PREFIX
        }
    }

    pub fn default_cellar(&self) -> String {
        format!("{}/Cellar", self.default_prefix())
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.system == other.system && self.standardized_arch() == other.standardized_arch()
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.system.hash(state);
        self.standardized_arch().hash(state);
    }
}

impl FromStr for Tag {
    type Err = PourError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(Tag::all());
        }
        let caps = TAG_REGEX
            .captures(s)
            .ok_or_else(|| PourError::InvalidTag(s.to_string()))?;
        let arch = match caps.name("arch") {
            Some(arch) => arch.as_str().parse()?,
            None => Arch::X86_64,
        };
        Ok(Tag::new(&caps["system"], arch))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("all")
        } else if self.is_macos() && self.arch.is_intel() {
            f.write_str(&self.system)
        } else {
            write!(f, "{}_{}", self.standardized_arch(), self.system)
        }
    }
}

/// Where a bottle expects to be poured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellarPolicy {
    /// Relocatable to any cellar.
    Any,
    /// Relocatable to any cellar and contains no paths that need rewriting.
    AnySkipRelocation,
    /// Only pourable into this exact cellar.
    Path(String),
}

impl CellarPolicy {
    pub fn parse(value: &str) -> Self {
        match value {
            ":any" | "any" => CellarPolicy::Any,
            ":any_skip_relocation" | "any_skip_relocation" => CellarPolicy::AnySkipRelocation,
            path => CellarPolicy::Path(path.to_string()),
        }
    }

    pub fn skip_relocation(&self) -> bool {
        matches!(self, CellarPolicy::AnySkipRelocation)
    }

    /// Whether a bottle with this policy may be poured into `cellar`.
    pub fn compatible_with(&self, cellar: &std::path::Path) -> bool {
        match self {
            CellarPolicy::Any | CellarPolicy::AnySkipRelocation => true,
            CellarPolicy::Path(path) => std::path::Path::new(path) == cellar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpecification {
    pub tag: Tag,
    /// The tag as spelled in the bottle table it came from.
    pub key: String,
    pub checksum: String,
    pub cellar: CellarPolicy,
}

/// All bottles a formula declares, keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    specs: HashMap<Tag, TagSpecification>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collector from the API's `bottle.stable.files` table.
    /// Entries with unparseable tags are skipped.
    pub fn from_bottle_files(files: &HashMap<String, BottleFile>) -> Self {
        let mut collector = Self::new();
        for (tag, file) in files {
            match tag.parse::<Tag>() {
                Ok(parsed) => collector.insert(TagSpecification {
                    tag: parsed,
                    key: tag.clone(),
                    checksum: file.sha256.clone(),
                    cellar: CellarPolicy::parse(&file.cellar),
                }),
                Err(e) => tracing::debug!("Skipping bottle entry {}: {}", tag, e),
            }
        }
        collector
    }

    pub fn add(&mut self, tag: Tag, checksum: String, cellar: CellarPolicy) {
        self.insert(TagSpecification {
            key: tag.to_string(),
            tag,
            checksum,
            cellar,
        });
    }

    fn insert(&mut self, spec: TagSpecification) {
        self.specs.insert(spec.tag.clone(), spec);
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.specs.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn has_tag(&self, tag: &Tag, no_older_versions: bool) -> bool {
        self.find_matching_tag(tag, no_older_versions).is_some()
    }

    pub fn specification_for(&self, tag: &Tag, no_older_versions: bool) -> Option<&TagSpecification> {
        self.find_matching_tag(tag, no_older_versions)
            .and_then(|matched| self.specs.get(matched))
    }

    fn find_matching_tag(&self, tag: &Tag, no_older_versions: bool) -> Option<&Tag> {
        if let Some((matched, _)) = self.specs.get_key_value(tag) {
            return Some(matched);
        }
        if !no_older_versions
            && let Some(older) = self.find_older_compatible_tag(tag)
        {
            return Some(older);
        }
        self.specs.get_key_value(&Tag::all()).map(|(all, _)| all)
    }

    /// Newest macOS tag of the same architecture that is not newer than `tag`.
    fn find_older_compatible_tag(&self, tag: &Tag) -> Option<&Tag> {
        let wanted = tag.macos_version()?;
        self.specs
            .keys()
            .filter(|candidate| candidate.standardized_arch() == tag.standardized_arch())
            .filter_map(|candidate| candidate.macos_version().map(|v| (candidate, v)))
            .filter(|(_, version)| *version <= wanted)
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(candidate, _)| candidate)
    }
}
