//! Command implementations for the `pour` CLI

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;
use colored::Colorize;
use pourover::api::merge_variations;
use pourover::bottle::CellarPolicy;
use pourover::elf::ElfFile;
use pourover::install::{self, Installer};
use pourover::keg::{Keg, RelocationOutcome};
use pourover::{ApiClient, Config, IndexKind, RemoteIndex, cache, platform};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub fn tag() -> Result<()> {
    let tag = platform::detect_bottle_tag()?;
    println!("{}", tag);
    Ok(())
}

pub fn elf(path: &Path, resolve: bool) -> Result<()> {
    let file = ElfFile::new(path);
    if !file.is_elf() {
        anyhow::bail!("{} is not a Linux ELF file", path.display());
    }

    println!("{}", path.display().to_string().bold());
    println!("  arch:        {}", file.arch());
    println!("  type:        {:?}", file.object_type());
    println!("  dynamic:     {}", file.is_dynamic());
    if let Some(interpreter) = file.interpreter() {
        println!("  interpreter: {}", interpreter);
    }
    if let Some(soname) = file.soname() {
        println!("  soname:      {}", soname);
    }
    for rpath in file.rpaths() {
        println!("  rpath:       {}", rpath);
    }
    for needed in file.needed() {
        println!("  needed:      {}", needed);
    }
    if resolve {
        for lib in file.needed_libraries() {
            println!("  resolved:    {}", lib.display());
        }
    }
    Ok(())
}

fn open_keg(path: &Path, config: Config) -> Result<Keg> {
    let path = path
        .canonicalize()
        .with_context(|| format!("No keg at {}", path.display()))?;
    Ok(Keg::new(path, Arc::new(config))?)
}

fn report(keg: &Keg, action: &str, outcome: &RelocationOutcome) {
    println!(
        "{} {} {} ({} files changed, {:?})",
        "✓".green(),
        action,
        keg.path().display().to_string().bold(),
        outcome.changed.len(),
        outcome.state
    );
    for file in &outcome.changed {
        tracing::debug!("  {}", file.display());
    }
}

pub fn relocate(config: Config, keg: &Path, old: &str, new: &str) -> Result<()> {
    let keg = open_keg(keg, config)?;
    let outcome = keg
        .relocate_build_prefix(old, new)
        .with_context(|| format!("{} needs to be reinstalled", keg.name()))?;
    report(&keg, "Relocated", &outcome);
    Ok(())
}

pub fn bottle_prep(config: Config, keg: &Path) -> Result<()> {
    let keg = open_keg(keg, config)?;
    let outcome = keg.replace_locations_with_placeholders()?;
    report(&keg, "Prepared", &outcome);

    let stdlibs = keg.detect_cxx_stdlibs(false);
    if !stdlibs.is_empty() {
        let names: Vec<&str> = stdlibs.iter().map(|s| s.as_str()).collect();
        println!("  C++ standard libraries: {}", names.join(", "));
    }
    Ok(())
}

pub fn pour(config: Config, bottle: &Path, name: &str, version: &str, cellar: &str) -> Result<()> {
    let config = Arc::new(config);
    let poured = install::pour(bottle, &config, name, version, &CellarPolicy::parse(cellar))?;
    match &poured.relocation {
        Some(outcome) => report(&poured.keg, "Poured", outcome),
        None => println!(
            "{} Poured {} (no relocation needed)",
            "✓".green(),
            poured.keg.path().display().to_string().bold()
        ),
    }
    Ok(())
}

pub async fn install(api: ApiClient, name: &str) -> Result<()> {
    let tag = platform::detect_bottle_tag()?;
    let poured = Installer::new(api, tag).install(name).await?;
    println!(
        "{} Installed {}",
        "✓".green(),
        poured.keg.path().display().to_string().bold()
    );
    Ok(())
}

pub async fn update(api: ApiClient, kinds: &[IndexKind], force: bool) -> Result<()> {
    if force {
        cache::clear_caches(&api.config().api_cache())?;
        tracing::debug!("Cleared API cache");
    }
    for kind in kinds {
        let index = RemoteIndex::new(api.clone(), *kind);
        let snapshot = index.update().await?;
        println!(
            "{} {} {} entries ({} aliases, {} renames)",
            "✓".green(),
            snapshot.entries.len().to_string().bold(),
            kind.as_str(),
            snapshot.aliases.len(),
            snapshot.renames.len()
        );
    }
    Ok(())
}

pub async fn info(api: ApiClient, name: &str, kind: IndexKind) -> Result<()> {
    let index = RemoteIndex::new(api, kind);
    let (canonical, entry) = index.get(name).await?;
    let entry = match platform::detect_bottle_tag() {
        Ok(tag) => merge_variations(&entry, &tag),
        Err(_) => entry,
    };

    println!("{}", format!("==> {}", canonical).bold().green());
    if let Some(desc) = entry.get("desc").and_then(Value::as_str) {
        println!("{}", desc);
    }
    if let Some(homepage) = entry.get("homepage").and_then(Value::as_str) {
        println!("{}", homepage.cyan());
    }
    let version = entry
        .pointer("/versions/stable")
        .or_else(|| entry.get("version"))
        .and_then(Value::as_str);
    if let Some(version) = version {
        println!("Version: {}", version);
    }
    if let Some(deps) = entry.get("dependencies").and_then(Value::as_array)
        && !deps.is_empty()
    {
        let deps: Vec<&str> = deps.iter().filter_map(Value::as_str).collect();
        println!("Dependencies: {}", deps.join(", "));
    }
    Ok(())
}

pub fn completions(shell: Shell) {
    let mut cmd = crate::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
