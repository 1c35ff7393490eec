//! # elf-rewriter
//!
//! Section replacement and layout rewriting for ELF binaries, built on
//! [goblin](https://crates.io/crates/goblin).
//!
//! This crate edits already-linked executables and shared libraries on
//! disk while keeping them loadable. Edits are expressed as whole-section
//! replacements ("replace section S with these N bytes"); a single commit
//! pass then re-plans the file layout and updates every structure that
//! depends on it: program headers, section headers, `.dynamic` tag
//! pointers, note segments, and symbol tables.
//!
//! The one high-level editor included is
//! [`replace_needed`](ElfImage::replace_needed), which substitutes the
//! shared-library names recorded in `DT_NEEDED` entries (and in the
//! version-requirement table, when present).
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use elf_rewriter::ElfImage;
//!
//! let data = std::fs::read("mybinary").unwrap();
//! let mut image = ElfImage::parse(data).unwrap();
//!
//! let mut libs = BTreeMap::new();
//! libs.insert("libfoo.so.1".to_string(), "libbar.so.2".to_string());
//! image.replace_needed(&libs).unwrap();
//! image.commit(false).unwrap();
//!
//! if image.is_changed() {
//!     std::fs::write("mybinary", image.bytes()).unwrap();
//! }
//! ```
//!
//! Growing a section never moves code: sections holding code or read-only
//! data (`SHT_PROGBITS`, except `.interp`) stay at their virtual
//! addresses. For shared libraries the replaced sections are appended at
//! the end of the file under a new `PT_LOAD`; for executables the header
//! region at the start of the file is grown instead, shifting the rest of
//! the file forward by whole pages when necessary.

mod image;
mod needed;
mod rewrite;

pub use image::ElfImage;
