//! Rewriting dynamic-linkage metadata inside a keg.
//!
//! Text rewriting is the same everywhere, but the load commands of a binary
//! are platform specific. [`ElfLinkage`] patches ELF interpreters and
//! runtime search paths natively; [`MachOLinkage`] drives `otool`,
//! `install_name_tool` and `codesign`. [`crate::platform::Platform::linkage`]
//! picks one at startup.

use crate::elf::ElfFile;
use crate::error::{PourError, Result};
use crate::keg::Keg;
use crate::relocation::{Matcher, Relocation};
use crate::rewrite::{self, RewriteReport};
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use walkdir::WalkDir;

static GLIBC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^glibc(@\d[\d.]*)?$").expect("static glibc regex is valid"));
static GCC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^gcc(@\d[\d.]*)?$").expect("static gcc regex is valid"));
static VERSIONED_GCC_LIB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"lib/gcc/\d+$").expect("static gcc lib regex is valid"));

/// C++ standard library a keg links against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CxxStdlib {
    Libcxx,
    Libstdcxx,
}

impl CxxStdlib {
    pub fn as_str(self) -> &'static str {
        match self {
            CxxStdlib::Libcxx => "libcxx",
            CxxStdlib::Libstdcxx => "libstdcxx",
        }
    }
}

/// Platform-specific half of a keg relocation.
pub trait DynamicLinkage: Send + Sync {
    /// Rewrite the linkage of every binary in `keg` according to the
    /// `prefix` pair (and, on macOS, every other pair) of `relocation`.
    fn relocate(&self, keg: &Keg, relocation: &Relocation) -> RewriteReport;

    /// Which C++ runtimes the keg's binaries resolve at load time.
    fn detect_cxx_stdlibs(&self, keg: &Keg, skip_executables: bool) -> Vec<CxxStdlib>;

    /// Re-sign a binary whose bytes were patched. A no-op where signatures
    /// are not enforced.
    fn codesign_patched_binary(&self, _file: &Path) -> Result<()> {
        Ok(())
    }
}

/// Linux: native ELF patching.
#[derive(Debug, Clone)]
pub struct ElfLinkage {
    ldd: Option<PathBuf>,
}

impl Default for ElfLinkage {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfLinkage {
    pub fn new() -> Self {
        Self { ldd: None }
    }

    /// Resolve needed libraries with a different `ldd`.
    pub fn with_ldd(mut self, ldd: impl Into<PathBuf>) -> Self {
        self.ldd = Some(ldd.into());
        self
    }

    fn open(&self, path: &Path) -> ElfFile {
        let file = ElfFile::new(path);
        match &self.ldd {
            Some(ldd) => file.with_ldd(ldd),
            None => file,
        }
    }

    /// ELF executables and shared libraries under `keg`, one per inode.
    pub fn elf_files(&self, keg: &Keg) -> Vec<ElfFile> {
        self.elf_file_groups(keg)
            .into_iter()
            .map(|(file, _)| file)
            .collect()
    }

    /// Like [`ElfLinkage::elf_files`], each with the other paths hard-linked
    /// to it.
    pub fn elf_file_groups(&self, keg: &Keg) -> Vec<(ElfFile, Vec<PathBuf>)> {
        let files: Vec<PathBuf> = WalkDir::new(keg.path())
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        rewrite::hard_link_groups(&files)
            .into_iter()
            .filter_map(|group| {
                let (first, siblings) = group.split_first()?;
                let file = self.open(first);
                (file.is_dylib() || file.is_executable()).then(|| (file, siblings.to_vec()))
            })
            .collect()
    }

    /// Rewrite one binary's runtime search path and interpreter for a move
    /// from `old_prefix` to `new_prefix`. Returns whether anything changed.
    ///
    /// Search-path entries are rewritten, then only those under the new
    /// prefix or relative to `$ORIGIN` are kept, and `<new_prefix>/lib` is
    /// always present. The interpreter becomes `<new_prefix>/lib/ld.so` when
    /// that file exists.
    pub fn change_rpath(
        file: &mut ElfFile,
        old_prefix: &Matcher,
        new_prefix: &str,
        keg_name: &str,
    ) -> Result<bool> {
        if !file.is_elf() || !file.is_dynamic() {
            return Ok(false);
        }

        let old_rpath = file.rpath().map(str::to_string);
        let new_rpath = old_rpath.as_deref().map(|old| {
            let mut entries: Vec<String> = old
                .split(':')
                .map(|entry| substitute(old_prefix, entry, new_prefix))
                .filter(|entry| entry.starts_with(new_prefix) || entry.starts_with("$ORIGIN"))
                .collect();

            let lib_path = format!("{new_prefix}/lib");
            if !entries.contains(&lib_path) {
                entries.push(lib_path);
            }

            if !GCC_NAME.is_match(keg_name) {
                for entry in &mut entries {
                    *entry = VERSIONED_GCC_LIB
                        .replace(entry, "lib/gcc/current")
                        .into_owned();
                }
            }
            entries.join(":")
        });

        let old_interpreter = file.interpreter().map(str::to_string);
        let new_interpreter = old_interpreter.as_deref().map(|old| {
            let ld_so = format!("{new_prefix}/lib/ld.so");
            if Path::new(&ld_so).is_file() {
                ld_so
            } else {
                substitute(old_prefix, old, new_prefix)
            }
        });

        let rpath = new_rpath.filter(|new| Some(new) != old_rpath.as_ref());
        let interpreter = new_interpreter.filter(|new| Some(new) != old_interpreter.as_ref());
        if rpath.is_none() && interpreter.is_none() {
            return Ok(false);
        }

        file.patch(interpreter.as_deref(), rpath.as_deref())?;
        Ok(true)
    }
}

/// Replace every search-path entry and the interpreter occurrence of `old`
/// with `new`, without any of the pour-time filtering of
/// [`ElfLinkage::change_rpath`].
pub fn substitute_elf_paths(file: &mut ElfFile, old: &Matcher, new: &str) -> Result<bool> {
    if !file.is_elf() || !file.is_dynamic() {
        return Ok(false);
    }

    let rpath = file
        .rpath()
        .filter(|rpath| old.is_match(rpath.as_bytes()))
        .map(|rpath| {
            rpath
                .split(':')
                .map(|entry| replace_all(old, entry, new))
                .collect::<Vec<_>>()
                .join(":")
        });
    let interpreter = file
        .interpreter()
        .filter(|interp| old.is_match(interp.as_bytes()))
        .map(|interp| replace_all(old, interp, new));

    if rpath.is_none() && interpreter.is_none() {
        return Ok(false);
    }
    file.patch(interpreter.as_deref(), rpath.as_deref())?;
    Ok(true)
}

fn substitute(matcher: &Matcher, text: &str, replacement: &str) -> String {
    matcher
        .replace_first(text.as_bytes(), replacement.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|| text.to_string())
}

fn replace_all(matcher: &Matcher, text: &str, replacement: &str) -> String {
    matcher
        .replace_all(text.as_bytes(), replacement.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|| text.to_string())
}

impl DynamicLinkage for ElfLinkage {
    fn relocate(&self, keg: &Keg, relocation: &Relocation) -> RewriteReport {
        let mut report = RewriteReport::default();

        // Patching the dynamic linker of glibc breaks it.
        if GLIBC_NAME.is_match(keg.name()) {
            tracing::debug!("Skipping linkage relocation for {}", keg.name());
            return report;
        }
        let Some((old_prefix, new_prefix)) = relocation.replacement_pair_for("prefix") else {
            return report;
        };

        let results: Vec<(PathBuf, Vec<PathBuf>, Result<bool>)> = self
            .elf_file_groups(keg)
            .into_par_iter()
            .map(|(mut file, siblings)| {
                let result = Self::change_rpath(&mut file, old_prefix, new_prefix, keg.name())
                    .and_then(|patched| {
                        if patched {
                            rewrite::relink_hard_links(file.path(), &siblings)?;
                        }
                        Ok(patched)
                    });
                (file.path().to_path_buf(), siblings, result)
            })
            .collect();

        for (path, siblings, result) in results {
            match result {
                Ok(true) => {
                    report.changed.push(path);
                    report.changed.extend(siblings);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to patch linkage of {}: {}", path.display(), e);
                    report.failures.push((path, e));
                }
            }
        }
        report
    }

    fn detect_cxx_stdlibs(&self, keg: &Keg, skip_executables: bool) -> Vec<CxxStdlib> {
        let mut found = HashSet::new();
        for file in self.elf_files(keg) {
            if !file.is_dynamic() || (skip_executables && file.is_executable()) {
                continue;
            }
            for lib in file.needed_libraries() {
                let lib = lib.to_string_lossy();
                if lib.contains("libc++.so") {
                    found.insert(CxxStdlib::Libcxx);
                }
                if lib.contains("libstdc++.so") {
                    found.insert(CxxStdlib::Libstdcxx);
                }
            }
        }
        let mut found: Vec<CxxStdlib> = found.into_iter().collect();
        found.sort();
        found
    }
}

/// macOS: rewrite install names with the Xcode command line tools.
#[derive(Debug, Clone, Default)]
pub struct MachOLinkage;

impl MachOLinkage {
    pub fn new() -> Self {
        Self
    }

    /// Every Mach-O file under `dir`.
    fn mach_o_files(dir: &Path) -> Vec<PathBuf> {
        let all_files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .max_open(64)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        all_files.into_par_iter().filter(|path| is_mach_o(path)).collect()
    }

    fn relocate_file(path: &Path, relocation: &Relocation) -> Result<bool> {
        let mut changed = false;

        for old in linked_libraries(path)? {
            let new = relocation.replace_text(&old);
            if new != old {
                install_name_tool(path, &["-change", &old, &new])?;
                changed = true;
            }
        }

        for old in rpaths(path)? {
            let new = relocation.replace_text(&old);
            if new != old {
                install_name_tool(path, &["-rpath", &old, &new])?;
                changed = true;
            }
        }

        if let Some(ext) = path.extension()
            && (ext == "dylib" || ext == "bundle" || ext == "so")
            && let Some(old_id) = dylib_id(path)?
        {
            let new_id = relocation.replace_text(&old_id);
            if new_id != old_id {
                install_name_tool(path, &["-id", &new_id])?;
                changed = true;
            }
        }

        Ok(changed)
    }
}

impl DynamicLinkage for MachOLinkage {
    fn relocate(&self, keg: &Keg, relocation: &Relocation) -> RewriteReport {
        let results: Vec<(PathBuf, Result<bool>)> = Self::mach_o_files(keg.path())
            .into_par_iter()
            .map(|file| {
                let result = Self::relocate_file(&file, relocation).and_then(|changed| {
                    if changed {
                        self.codesign_patched_binary(&file)?;
                    }
                    Ok(changed)
                });
                (file, result)
            })
            .collect();

        let mut report = RewriteReport::default();
        for (path, result) in results {
            match result {
                Ok(true) => report.changed.push(path),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to relocate {}: {}", path.display(), e);
                    report.failures.push((path, e));
                }
            }
        }
        report
    }

    fn detect_cxx_stdlibs(&self, keg: &Keg, skip_executables: bool) -> Vec<CxxStdlib> {
        let mut found = HashSet::new();
        for file in Self::mach_o_files(keg.path()) {
            let is_dylib = file
                .extension()
                .is_some_and(|ext| ext == "dylib" || ext == "bundle");
            if skip_executables && !is_dylib {
                continue;
            }
            let Ok(libraries) = linked_libraries(&file) else {
                continue;
            };
            for lib in libraries {
                if lib.contains("libc++") {
                    found.insert(CxxStdlib::Libcxx);
                }
                if lib.contains("libstdc++") {
                    found.insert(CxxStdlib::Libstdcxx);
                }
            }
        }
        let mut found: Vec<CxxStdlib> = found.into_iter().collect();
        found.sort();
        found
    }

    fn codesign_patched_binary(&self, file: &Path) -> Result<()> {
        if !cfg!(target_arch = "aarch64") {
            return Ok(());
        }
        let output = Command::new("codesign")
            .args(["--sign", "-", "--force", "--preserve-metadata=entitlements,requirements,flags,runtime"])
            .arg(file)
            .output()
            .map_err(|e| PourError::io("codesign", e))?;
        if !output.status.success() {
            return Err(PourError::Patch {
                path: file.to_path_buf(),
                reason: format!(
                    "codesign failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

fn is_mach_o(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut bytes = [0u8; 4];
    if file.read_exact(&mut bytes).is_err() {
        return false;
    }
    let magic = u32::from_ne_bytes(bytes);
    // Thin 32/64-bit in both byte orders, plus fat archives.
    matches!(
        magic,
        0xfeedface | 0xfeedfacf | 0xcefaedfe | 0xcffaedfe | 0xcafebabe | 0xbebafeca
    )
}

fn otool(path: &Path, flag: &str) -> Result<String> {
    let output = Command::new("otool")
        .arg(flag)
        .arg(path)
        .output()
        .map_err(|e| PourError::io("otool", e))?;
    if !output.status.success() {
        return Err(PourError::Format {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Install names from `otool -L`, skipping the header line.
fn linked_libraries(path: &Path) -> Result<Vec<String>> {
    Ok(parse_otool_libraries(&otool(path, "-L")?))
}

fn parse_otool_libraries(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.trim().split(" (").next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn dylib_id(path: &Path) -> Result<Option<String>> {
    let output = otool(path, "-D")?;
    Ok(output
        .lines()
        .nth(1)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string))
}

/// `LC_RPATH` entries from `otool -l`.
fn rpaths(path: &Path) -> Result<Vec<String>> {
    Ok(parse_otool_rpaths(&otool(path, "-l")?))
}

fn parse_otool_rpaths(output: &str) -> Vec<String> {
    let mut rpaths = Vec::new();
    let mut in_rpath = false;
    for line in output.lines().map(str::trim) {
        if let Some(cmd) = line.strip_prefix("cmd ") {
            in_rpath = cmd.trim() == "LC_RPATH";
        } else if in_rpath && let Some(rest) = line.strip_prefix("path ") {
            if let Some(path) = rest.split(" (offset").next() {
                rpaths.push(path.trim().to_string());
            }
            in_rpath = false;
        }
    }
    rpaths
}

fn install_name_tool(path: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("install_name_tool")
        .args(args)
        .arg(path)
        .output()
        .map_err(|e| PourError::io("install_name_tool", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Signature invalidation warnings are expected; we re-sign afterwards.
        if !stderr.contains("warning:") {
            return Err(PourError::Patch {
                path: path.to_path_buf(),
                reason: stderr.trim().to_string(),
            });
        }
    }
    Ok(())
}
