//! Platform detection for selecting the correct bottle and linkage strategy.
//!
//! Homebrew maintains separate bottles per macOS release and CPU architecture,
//! plus one per architecture for Linux. [`detect_bottle_tag`] reports the tag
//! the running machine wants; [`Platform::current`] picks how dynamic linkage
//! is rewritten after a pour.
//!
//! # Examples
//!
//! ```no_run
//! use pourover::platform;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bottle_tag = platform::detect_bottle_tag()?;
//!     println!("This system needs: {}", bottle_tag);
//!     // Output: "arm64_sequoia" on M3 Mac with macOS 15
//!     // Output: "x86_64_linux" on an Intel Linux box
//!     Ok(())
//! }
//! ```

use crate::bottle::{Arch, Tag};
use crate::error::{PourError, Result};
use crate::linkage::{DynamicLinkage, ElfLinkage, MachOLinkage};
#[cfg(target_os = "macos")]
use std::process::Command;

/// Operating system family, as far as relocation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// The linkage rewriter for this platform.
    pub fn linkage(self) -> Box<dyn DynamicLinkage> {
        match self {
            Platform::MacOs => Box::new(MachOLinkage::new()),
            Platform::Linux => Box::new(ElfLinkage::new()),
        }
    }
}

/// Architecture of the running binary, in bottle-tag spelling.
pub fn current_arch() -> Arch {
    std::env::consts::ARCH.parse().unwrap_or(Arch::X86_64)
}

/// Detect the current system platform for bottle selection.
///
/// # Errors
///
/// On macOS, when `sw_vers` is missing or reports a release this crate does
/// not know. On anything other than macOS and Linux.
pub fn detect_bottle_tag() -> Result<Tag> {
    #[cfg(target_os = "macos")]
    {
        let version = macos_version()?;
        let name = version
            .parse::<crate::bottle::MacOsVersion>()
            .ok()
            .and_then(|v| v.name())
            .ok_or_else(|| PourError::InvalidTag(format!("unknown macOS version {version}")))?;
        Ok(Tag::new(name, current_arch()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Tag::new("linux", current_arch()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PourError::InvalidTag(format!(
            "unsupported platform {}",
            std::env::consts::OS
        )))
    }
}

#[cfg(target_os = "macos")]
fn macos_version() -> Result<String> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .map_err(|e| PourError::io("sw_vers", e))?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
