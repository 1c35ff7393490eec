//! Substitution of shared-library names in the dynamic-linking metadata.
//!
//! A library dependency is recorded twice: as a `DT_NEEDED` entry in
//! `.dynamic` whose value is an offset into `.dynstr`, and (when symbol
//! versioning is in use) as a file-name string referenced from the
//! `.gnu.version_r` table. Both references are rewritten here. New names are
//! appended to the string tables through the section-replacement machinery,
//! so the layout fixup at commit time takes care of the growth.

use std::collections::{BTreeMap, HashMap};

use goblin::elf::dynamic::{Dyn, DT_NEEDED, DT_NULL, DT_VERNEEDNUM};
use goblin::error::{self, Error};
use log::debug;
use scroll::ctx::SizeWith;
use scroll::{Pread, Pwrite};

use crate::image::{read_str_at, ElfImage};

/// Byte offset of `vn_file` within an `Elf_Verneed` entry. The structure
/// has the same layout for both ELF classes.
const VN_FILE_OFFSET: usize = 4;
/// Byte offset of `vn_next` within an `Elf_Verneed` entry.
const VN_NEXT_OFFSET: usize = 12;

fn set_substr(dest: &mut [u8], pos: usize, src: &[u8]) {
    assert!(pos + src.len() <= dest.len());
    dest[pos..pos + src.len()].copy_from_slice(src);
}

impl ElfImage {
    /// Replace dependency names according to `libs`, a map from current
    /// name to replacement name.
    ///
    /// Every `DT_NEEDED` entry whose current string is a key in the map is
    /// rewritten to point at the replacement, and the same substitution is
    /// applied to the file names in `.gnu.version_r` when the image uses
    /// symbol versioning. Replacement strings are appended once and shared
    /// between entries. Call [`commit`](ElfImage::commit) afterwards to
    /// apply the staged string-table growth.
    pub fn replace_needed(&mut self, libs: &BTreeMap<String, String>) -> error::Result<()> {
        if libs.is_empty() {
            return Ok(());
        }

        let shdr_dynamic = self.find_section_header(".dynamic")?;
        let shdr_dynstr = self.find_section_header(".dynstr")?;
        let str_tab_offset = shdr_dynstr.sh_offset as usize;

        let entsize = Dyn::size_with(&self.ctx);
        let table_offset = shdr_dynamic.sh_offset as usize;
        let count = shdr_dynamic.sh_size as usize / entsize;

        let mut ver_need_num: u64 = 0;

        let mut dyn_str_added_bytes = 0usize;
        let mut added_strings: HashMap<String, u64> = HashMap::new();

        for index in 0..count {
            let offset = table_offset + index * entsize;
            let mut entry: Dyn = self.bytes.pread_with(offset, self.ctx)?;
            if entry.d_tag == DT_NULL {
                break;
            }

            if entry.d_tag == DT_NEEDED {
                let name = read_str_at(&self.bytes, str_tab_offset + entry.d_val as usize)?;
                match libs.get(&name) {
                    Some(replacement) if *replacement != name => {
                        debug!("replacing DT_NEEDED entry '{name}' with '{replacement}'");

                        if let Some(&existing) = added_strings.get(replacement) {
                            // The same replacement was appended for an
                            // earlier entry; reuse it.
                            entry.d_val = existing;
                            self.bytes.pwrite_with(entry.clone(), offset, self.ctx)?;
                            self.changed = true;
                            continue;
                        }

                        // The string at d_val could be referenced from
                        // elsewhere too, so append a new one instead of
                        // overwriting it.
                        debug!("resizing .dynstr ...");
                        let str_offset = shdr_dynstr.sh_size as usize + dyn_str_added_bytes;
                        let replacement = replacement.clone();
                        let buf =
                            self.replace_section(".dynstr", str_offset + replacement.len() + 1)?;
                        set_substr(buf, str_offset, replacement.as_bytes());

                        entry.d_val = str_offset as u64;
                        self.bytes.pwrite_with(entry.clone(), offset, self.ctx)?;

                        dyn_str_added_bytes += replacement.len() + 1;
                        added_strings.insert(replacement, str_offset as u64);
                        self.changed = true;
                    }
                    _ => {
                        debug!("keeping DT_NEEDED entry '{name}'");
                    }
                }
            }

            if entry.d_tag == DT_VERNEEDNUM {
                ver_need_num = entry.d_val;
            }
        }

        // If a replaced library uses symbol versions there are also
        // references to it in the version-needed table.
        if ver_need_num > 0 {
            let shdr_version_r = self.find_section_header(".gnu.version_r")?;

            // The file-name strings of .gnu.version_r live in whatever
            // section sh_link names, which need not be .dynstr.
            let strings_index = shdr_version_r.sh_link as usize;
            if strings_index >= self.shdrs.len() {
                return Err(Error::Malformed(
                    ".gnu.version_r has an out-of-bounds sh_link".into(),
                ));
            }
            let shdr_strings = self.shdrs[strings_index].clone();
            let ver_str_tab_offset = shdr_strings.sh_offset as usize;
            let strings_name = self.section_name(&shdr_strings)?;

            debug!("found .gnu.version_r with {ver_need_num} entries, strings in {strings_name}");

            let mut ver_str_added_bytes = 0usize;
            if strings_name == ".dynstr" {
                // New offsets must account for the strings appended above.
                ver_str_added_bytes += dyn_str_added_bytes;
            } else {
                // Strings appended to .dynstr cannot be reused here.
                added_strings.clear();
            }

            let mut need_offset = shdr_version_r.sh_offset as usize;
            let mut remaining = ver_need_num;
            while remaining > 0 {
                let vn_file: u32 = self
                    .bytes
                    .pread_with(need_offset + VN_FILE_OFFSET, self.ctx.le)?;
                let vn_next: u32 = self
                    .bytes
                    .pread_with(need_offset + VN_NEXT_OFFSET, self.ctx.le)?;

                let file = read_str_at(&self.bytes, ver_str_tab_offset + vn_file as usize)?;
                match libs.get(&file) {
                    Some(replacement) if *replacement != file => {
                        debug!("replacing .gnu.version_r entry '{file}' with '{replacement}'");

                        let new_offset = match added_strings.get(replacement) {
                            Some(&existing) => existing,
                            None => {
                                debug!("resizing string section {strings_name} ...");
                                let str_offset =
                                    shdr_strings.sh_size as usize + ver_str_added_bytes;
                                let replacement = replacement.clone();
                                let buf = self.replace_section(
                                    &strings_name,
                                    str_offset + replacement.len() + 1,
                                )?;
                                set_substr(buf, str_offset, replacement.as_bytes());

                                ver_str_added_bytes += replacement.len() + 1;
                                added_strings.insert(replacement, str_offset as u64);
                                str_offset as u64
                            }
                        };

                        self.bytes.pwrite_with::<u32>(
                            new_offset as u32,
                            need_offset + VN_FILE_OFFSET,
                            self.ctx.le,
                        )?;
                        self.changed = true;
                    }
                    _ => {
                        debug!("keeping .gnu.version_r entry '{file}'");
                    }
                }

                // The entries form a linked list; a zero vn_next ends it.
                remaining -= 1;
                if vn_next == 0 {
                    break;
                }
                need_offset += vn_next as usize;
            }
        }

        Ok(())
    }
}
