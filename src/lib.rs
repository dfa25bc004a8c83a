//! Library interface for pourover (`pour`)
//!
//! The pieces of a Homebrew-compatible client that do real work on bytes:
//!
//! - [`elf`]: ELF header and dynamic-section metadata, with in-place patching
//! - [`relocation`] and [`rewrite`]: boundary-aware path substitution over
//!   text and binary files
//! - [`keg`] and [`linkage`]: relocating a whole installed keg
//! - [`api`], [`index`] and [`jws`]: the signed, cache-backed formula and
//!   cask index

pub mod api;
pub mod bottle;
pub mod cache;
pub mod config;
pub mod download;
pub mod elf;
pub mod error;
pub mod extract;
pub mod index;
pub mod install;
pub mod jws;
pub mod keg;
pub mod linkage;
pub mod lock;
pub mod platform;
pub mod relocation;
pub mod rewrite;

// Re-export commonly used types
pub use api::ApiClient;
pub use bottle::{Collector, Tag};
pub use config::Config;
pub use error::{PourError, Result};
pub use index::{IndexKind, RemoteIndex};
pub use keg::{Keg, RelocationState};
pub use relocation::Relocation;
