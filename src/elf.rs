//! ELF metadata for relocation.
//!
//! [`ElfFile`] answers the questions relocation asks of a binary: is it a
//! Linux/System V ELF at all, which architecture and object type, and what
//! its interpreter, runtime search path and needed libraries are. Header
//! fields come from a fixed-offset read of the first bytes; the dynamic
//! section is parsed with the `object` crate. Every answer is computed once
//! per [`ElfFile`] and cached.
//!
//! Patching rewrites the interpreter and runtime search path strings in
//! place. New values must fit into the space of the old ones (the remainder
//! is NUL padded); anything longer is a [`PourError::Patch`].
//!
//! # Examples
//!
//! ```no_run
//! use pourover::elf::ElfFile;
//!
//! let elf = ElfFile::new("/home/linuxbrew/.linuxbrew/bin/jq");
//! if elf.is_elf() && elf.is_dynamic() {
//!     println!("{:?} {:?}", elf.arch(), elf.interpreter());
//!     for dir in elf.rpaths() {
//!         println!("  rpath {dir}");
//!     }
//! }
//! ```

use crate::error::{PourError, Result};
use crate::rewrite;
use object::Endianness;
use object::elf;
use object::read::elf::{Dyn, FileHeader, ProgramHeader};
use regex::Regex;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{LazyLock, OnceLock};

const MAGIC: &[u8; 4] = b"\x7fELF";
const HEADER_LEN: usize = 0x14;

const EI_CLASS: usize = 0x04;
const EI_DATA: usize = 0x05;
const OS_ABI_OFFSET: usize = 0x07;
const OS_ABI_SYSTEM_V: u8 = 0;
const OS_ABI_LINUX: u8 = 3;

const TYPE_OFFSET: usize = 0x10;
const TYPE_EXECUTABLE: u16 = 2;
const TYPE_SHARED: u16 = 3;

const ARCHITECTURE_OFFSET: usize = 0x12;
const ARCHITECTURE_I386: u16 = 0x3;
const ARCHITECTURE_POWERPC: u16 = 0x14;
const ARCHITECTURE_ARM: u16 = 0x28;
const ARCHITECTURE_X86_64: u16 = 0x3E;
const ARCHITECTURE_AARCH64: u16 = 0xB7;

static LDD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\t.+ => (.+) \(.+\)|\t(.+) => not found").expect("static ldd regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfArch {
    I386,
    X86_64,
    Arm,
    Arm64,
    PowerPc,
    Unknown,
}

impl fmt::Display for ElfArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElfArch::I386 => "i386",
            ElfArch::X86_64 => "x86_64",
            ElfArch::Arm => "arm",
            ElfArch::Arm64 => "arm64",
            ElfArch::PowerPc => "powerpc",
            ElfArch::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Executable,
    Shared,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    os_abi: u8,
    e_type: u16,
    e_machine: u16,
}

/// A NUL-terminated string in the file and the bytes available to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringSlot {
    pub value: String,
    pub offset: usize,
    pub capacity: usize,
}

/// Dynamic-linking metadata read from the program headers.
#[derive(Debug, Clone, Default)]
pub struct DynamicInfo {
    pub has_dynamic: bool,
    pub interpreter: Option<StringSlot>,
    pub soname: Option<String>,
    pub runpath: Option<StringSlot>,
    pub rpath: Option<StringSlot>,
    pub needed: Vec<String>,
}

impl DynamicInfo {
    /// DT_RUNPATH wins over DT_RPATH, as it does for the loader.
    fn search_path(&self) -> Option<&StringSlot> {
        self.runpath.as_ref().or(self.rpath.as_ref())
    }
}

/// Lazily-read ELF metadata for one file.
#[derive(Debug)]
pub struct ElfFile {
    path: PathBuf,
    ldd: PathBuf,
    header: OnceLock<Option<Header>>,
    dynamic: OnceLock<Option<DynamicInfo>>,
    needed_libraries: OnceLock<Vec<PathBuf>>,
}

impl ElfFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ldd: PathBuf::from("ldd"),
            header: OnceLock::new(),
            dynamic: OnceLock::new(),
            needed_libraries: OnceLock::new(),
        }
    }

    /// Use a different dynamic-linker introspection tool than `ldd`.
    pub fn with_ldd(mut self, ldd: impl Into<PathBuf>) -> Self {
        self.ldd = ldd.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> Option<Header> {
        *self.header.get_or_init(|| read_header(&self.path))
    }

    /// Magic bytes match and the OS ABI is System V or Linux.
    pub fn is_elf(&self) -> bool {
        self.header()
            .is_some_and(|h| h.os_abi == OS_ABI_SYSTEM_V || h.os_abi == OS_ABI_LINUX)
    }

    pub fn arch(&self) -> ElfArch {
        if !self.is_elf() {
            return ElfArch::Unknown;
        }
        match self.header().map(|h| h.e_machine) {
            Some(ARCHITECTURE_I386) => ElfArch::I386,
            Some(ARCHITECTURE_X86_64) => ElfArch::X86_64,
            Some(ARCHITECTURE_POWERPC) => ElfArch::PowerPc,
            Some(ARCHITECTURE_ARM) => ElfArch::Arm,
            Some(ARCHITECTURE_AARCH64) => ElfArch::Arm64,
            _ => ElfArch::Unknown,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        if !self.is_elf() {
            return ObjectType::Unknown;
        }
        match self.header().map(|h| h.e_type) {
            Some(TYPE_EXECUTABLE) => ObjectType::Executable,
            Some(TYPE_SHARED) => ObjectType::Shared,
            _ => ObjectType::Unknown,
        }
    }

    pub fn is_dylib(&self) -> bool {
        self.object_type() == ObjectType::Shared
    }

    pub fn is_executable(&self) -> bool {
        self.object_type() == ObjectType::Executable
    }

    /// Parsed dynamic metadata. `None` for non-ELF files and for files the
    /// parser rejects; the rejection is logged and the file is skipped.
    pub fn dynamic_info(&self) -> Option<&DynamicInfo> {
        self.dynamic
            .get_or_init(|| {
                if !self.is_elf() {
                    return None;
                }
                match self.load_dynamic() {
                    Ok(info) => Some(info),
                    Err(e) => {
                        tracing::debug!("Skipping {}: {}", self.path.display(), e);
                        None
                    }
                }
            })
            .as_ref()
    }

    fn load_dynamic(&self) -> Result<DynamicInfo> {
        let data = std::fs::read(&self.path).map_err(|e| PourError::io(&self.path, e))?;
        parse_dynamic(&data).map_err(|reason| PourError::Format {
            path: self.path.clone(),
            reason,
        })
    }

    /// True only if a PT_DYNAMIC segment is present.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic_info().is_some_and(|d| d.has_dynamic)
    }

    /// Runtime search path as stored, e.g. `"/lib:/usr/lib"`.
    pub fn rpath(&self) -> Option<&str> {
        self.dynamic_info()
            .and_then(DynamicInfo::search_path)
            .map(|slot| slot.value.as_str())
    }

    pub fn rpaths(&self) -> Vec<String> {
        self.rpath()
            .map(|rpath| {
                rpath
                    .split(':')
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn interpreter(&self) -> Option<&str> {
        self.dynamic_info()
            .and_then(|d| d.interpreter.as_ref())
            .map(|slot| slot.value.as_str())
    }

    /// DT_SONAME, the library's own install name.
    pub fn soname(&self) -> Option<&str> {
        self.dynamic_info().and_then(|d| d.soname.as_deref())
    }

    /// DT_NEEDED entries, as declared.
    pub fn needed(&self) -> &[String] {
        self.dynamic_info()
            .map(|d| d.needed.as_slice())
            .unwrap_or_default()
    }

    /// Resolved paths of the needed libraries, as reported by `ldd`.
    ///
    /// Empty for static binaries and whenever the tool exits non-zero.
    pub fn needed_libraries(&self) -> &[PathBuf] {
        self.needed_libraries.get_or_init(|| self.resolve_needed())
    }

    fn resolve_needed(&self) -> Vec<PathBuf> {
        if !self.is_dynamic() || self.needed().is_empty() {
            return Vec::new();
        }

        let target = std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone());
        let output = match Command::new(&self.ldd).arg(&target).output() {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Could not run {}: {}", self.ldd.display(), e);
                return Vec::new();
            }
        };
        if !output.status.success() {
            tracing::debug!(
                "{} {} exited with {}",
                self.ldd.display(),
                self.path.display(),
                output.status
            );
            return Vec::new();
        }

        parse_ldd_output(&String::from_utf8_lossy(&output.stdout), self.needed())
    }

    /// Rewrite the interpreter and/or runtime search path in place.
    ///
    /// Empty or absent values are left alone. File permissions are kept.
    pub fn patch(&mut self, interpreter: Option<&str>, rpath: Option<&str>) -> Result<()> {
        let interpreter = interpreter.filter(|s| !s.is_empty());
        let rpath = rpath.filter(|s| !s.is_empty());
        if interpreter.is_none() && rpath.is_none() {
            return Ok(());
        }

        let mut data = std::fs::read(&self.path).map_err(|e| PourError::io(&self.path, e))?;
        let info = parse_dynamic(&data).map_err(|reason| PourError::Format {
            path: self.path.clone(),
            reason,
        })?;

        if let Some(new) = interpreter {
            let slot = info
                .interpreter
                .as_ref()
                .ok_or_else(|| self.patch_error("no PT_INTERP segment"))?;
            self.write_slot(&mut data, slot, new)?;
        }
        if let Some(new) = rpath {
            let slot = info
                .search_path()
                .ok_or_else(|| self.patch_error("no DT_RUNPATH or DT_RPATH entry"))?;
            self.write_slot(&mut data, slot, new)?;
        }

        rewrite::write_preserving_metadata(&self.path, &data)?;
        tracing::debug!("Patched {}", self.path.display());

        self.dynamic = OnceLock::new();
        self.needed_libraries = OnceLock::new();
        Ok(())
    }

    fn write_slot(&self, data: &mut [u8], slot: &StringSlot, new: &str) -> Result<()> {
        if new.len() > slot.capacity {
            return Err(self.patch_error(&format!(
                "{} needs {} bytes but only {} are available for {}",
                new,
                new.len(),
                slot.capacity,
                slot.value
            )));
        }
        let region = data
            .get_mut(slot.offset..slot.offset + slot.capacity)
            .ok_or_else(|| self.patch_error("string lies outside the file"))?;
        region[..new.len()].copy_from_slice(new.as_bytes());
        region[new.len()..].fill(0);
        Ok(())
    }

    fn patch_error(&self, reason: &str) -> PourError {
        PourError::Patch {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

fn read_header(path: &Path) -> Option<Header> {
    let mut buf = [0u8; HEADER_LEN];
    let mut file = File::open(path).ok()?;
    file.read_exact(&mut buf).ok()?;
    if &buf[..4] != MAGIC {
        return None;
    }

    let read_u16 = |offset: usize| {
        let bytes = [buf[offset], buf[offset + 1]];
        if buf[EI_DATA] == elf::ELFDATA2MSB {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    };

    Some(Header {
        os_abi: buf[OS_ABI_OFFSET],
        e_type: read_u16(TYPE_OFFSET),
        e_machine: read_u16(ARCHITECTURE_OFFSET),
    })
}

/// Parse the program headers and dynamic table of a whole ELF image.
pub fn parse_dynamic(data: &[u8]) -> std::result::Result<DynamicInfo, String> {
    match data.get(EI_CLASS) {
        Some(&elf::ELFCLASS32) => parse_dynamic_as::<elf::FileHeader32<Endianness>>(data),
        Some(&elf::ELFCLASS64) => parse_dynamic_as::<elf::FileHeader64<Endianness>>(data),
        _ => Err("unknown ELF class".into()),
    }
}

fn parse_dynamic_as<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
) -> std::result::Result<DynamicInfo, String> {
    let header = Elf::parse(data).map_err(|e| e.to_string())?;
    let endian = header.endian().map_err(|e| e.to_string())?;
    let segments = header
        .program_headers(endian, data)
        .map_err(|e| e.to_string())?;

    let mut info = DynamicInfo::default();
    let mut dynamic = None;
    let mut loads = Vec::new();

    for segment in segments {
        let offset: u64 = segment.p_offset(endian).into();
        let filesz: u64 = segment.p_filesz(endian).into();
        let vaddr: u64 = segment.p_vaddr(endian).into();
        match segment.p_type(endian) {
            elf::PT_INTERP => {
                let start = to_usize(offset)?;
                let len = to_usize(filesz)?;
                let bytes = data
                    .get(start..start.saturating_add(len))
                    .ok_or("PT_INTERP outside file")?;
                let value = until_nul(bytes);
                info.interpreter = Some(StringSlot {
                    value,
                    offset: start,
                    capacity: len.saturating_sub(1),
                });
            }
            elf::PT_DYNAMIC => {
                dynamic = segment.dynamic(endian, data).map_err(|e| e.to_string())?
            }
            elf::PT_LOAD => loads.push((vaddr, offset, filesz)),
            _ => {}
        }
    }

    let Some(entries) = dynamic else {
        return Ok(info);
    };
    info.has_dynamic = true;

    let mut strtab_addr = None;
    let mut strtab_size = None;
    for entry in entries {
        let tag: u64 = entry.d_tag(endian).into();
        let value: u64 = entry.d_val(endian).into();
        match tag {
            t if t == u64::from(elf::DT_STRTAB) => strtab_addr = Some(value),
            t if t == u64::from(elf::DT_STRSZ) => strtab_size = Some(value),
            t if t == u64::from(elf::DT_NULL) => break,
            _ => {}
        }
    }
    let (Some(strtab_addr), Some(strtab_size)) = (strtab_addr, strtab_size) else {
        return Ok(info);
    };

    // DT_STRTAB is a virtual address; map it through the PT_LOAD segment
    // that contains it.
    let strtab_offset = loads
        .iter()
        .find(|(vaddr, _, filesz)| {
            strtab_addr >= *vaddr && vaddr.checked_add(*filesz).is_some_and(|end| strtab_addr < end)
        })
        .map(|(vaddr, offset, _)| strtab_addr - vaddr + offset)
        .ok_or("DT_STRTAB not in a loaded segment")?;
    let strtab_start = to_usize(strtab_offset)?;
    let strtab = data
        .get(strtab_start..strtab_start.saturating_add(to_usize(strtab_size)?))
        .ok_or("string table outside file")?;

    let slot = |index: u64| -> std::result::Result<StringSlot, String> {
        let index = to_usize(index)?;
        let bytes = strtab
            .get(index..)
            .ok_or("string index outside string table")?;
        let value = until_nul(bytes);
        let capacity = value.len();
        Ok(StringSlot {
            value,
            offset: strtab_start + index,
            capacity,
        })
    };

    for entry in entries {
        let tag: u64 = entry.d_tag(endian).into();
        let value: u64 = entry.d_val(endian).into();
        match tag {
            t if t == u64::from(elf::DT_NULL) => break,
            t if t == u64::from(elf::DT_NEEDED) => info.needed.push(slot(value)?.value),
            t if t == u64::from(elf::DT_SONAME) => info.soname = Some(slot(value)?.value),
            t if t == u64::from(elf::DT_RUNPATH) => info.runpath = Some(slot(value)?),
            t if t == u64::from(elf::DT_RPATH) => info.rpath = Some(slot(value)?),
            _ => {}
        }
    }

    Ok(info)
}

fn to_usize(value: u64) -> std::result::Result<usize, String> {
    usize::try_from(value).map_err(|_| format!("offset {value:#x} too large"))
}

fn until_nul(bytes: &[u8]) -> String {
    let end = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Pick the resolved paths out of `ldd` output, keeping only libraries the
/// binary itself declares as needed.
pub fn parse_ldd_output(output: &str, needed: &[String]) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let caps = LDD_LINE.captures(line)?;
            caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
        })
        .filter(|resolved| {
            Path::new(resolved)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| needed.iter().any(|n| n == name))
        })
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldd_output_filters_to_needed() {
        let output = "\tlinux-vdso.so.1 (0x00007ffc8a5f2000)\n\
                      \tlibz.so.1 => /home/linuxbrew/.linuxbrew/lib/libz.so.1 (0x00007f2a1c000000)\n\
                      \tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f2a1be00000)\n\
                      \tlibmissing.so.2 => not found\n\
                      \t/lib64/ld-linux-x86-64.so.2 (0x00007f2a1c2a0000)\n";
        let needed = vec![
            "libz.so.1".to_string(),
            "libc.so.6".to_string(),
            "libmissing.so.2".to_string(),
        ];
        assert_eq!(
            parse_ldd_output(output, &needed),
            vec![
                PathBuf::from("/home/linuxbrew/.linuxbrew/lib/libz.so.1"),
                PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6"),
                PathBuf::from("libmissing.so.2"),
            ]
        );
    }

    #[test]
    fn test_short_and_foreign_files_are_not_elf() {
        let dir = tempfile::tempdir().unwrap();

        let short = dir.path().join("short");
        std::fs::write(&short, b"\x7fELF").unwrap();
        assert!(!ElfFile::new(&short).is_elf());

        let mut freebsd = vec![0u8; 64];
        freebsd[..4].copy_from_slice(MAGIC);
        freebsd[OS_ABI_OFFSET] = 9;
        let path = dir.path().join("freebsd");
        std::fs::write(&path, &freebsd).unwrap();
        let elf = ElfFile::new(&path);
        assert!(!elf.is_elf());
        assert_eq!(elf.arch(), ElfArch::Unknown);
        assert_eq!(elf.object_type(), ObjectType::Unknown);

        assert!(!ElfFile::new(dir.path().join("missing")).is_elf());
    }

    #[test]
    fn test_header_fields_respect_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(MAGIC);
        header[EI_CLASS] = elf::ELFCLASS64;
        header[EI_DATA] = elf::ELFDATA2MSB;
        header[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&TYPE_SHARED.to_be_bytes());
        header[ARCHITECTURE_OFFSET..ARCHITECTURE_OFFSET + 2]
            .copy_from_slice(&ARCHITECTURE_POWERPC.to_be_bytes());
        let path = dir.path().join("ppc.so");
        std::fs::write(&path, &header).unwrap();

        let elf = ElfFile::new(&path);
        assert!(elf.is_elf());
        assert_eq!(elf.arch(), ElfArch::PowerPc);
        assert!(elf.is_dylib());
        // No program headers: not dynamic, nothing to report.
        assert!(!elf.is_dynamic());
        assert!(elf.rpaths().is_empty());
        assert!(elf.needed_libraries().is_empty());
    }

    #[test]
    fn test_patch_without_values_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-elf");
        std::fs::write(&path, b"plain text").unwrap();
        let mut elf = ElfFile::new(&path);
        elf.patch(None, Some("")).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"plain text");
    }
}
