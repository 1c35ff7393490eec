//! Layout planning and header fixup.
//!
//! Committing staged section replacements means finding file space for the
//! new contents and then making every view of the file agree with the new
//! layout: program headers, section headers, `.dynamic` tag pointers, and
//! symbol-table section references.
//!
//! Two strategies exist. Shared libraries (`ET_DYN`) get their replaced
//! sections appended at the end of the file under a fresh read-write
//! `PT_LOAD`. Executables (`ET_EXEC`) cannot grow upward in address space,
//! so the header region at the start of the file is grown instead, shifting
//! later content forward by whole pages when it does not fit.

use std::collections::{BTreeMap, BTreeSet};

use goblin::elf::dynamic::{
    Dyn, DT_GNU_HASH, DT_HASH, DT_JMPREL, DT_NULL, DT_REL, DT_RELA, DT_STRSZ, DT_STRTAB,
    DT_SYMTAB, DT_VERNEED, DT_VERSYM,
};
use goblin::elf::header;
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_NOTE, PT_PHDR};
use goblin::elf::section_header::{
    SectionHeader, SHT_DYNSYM, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_SYMTAB,
};
use goblin::elf::sym::{Sym, STT_SECTION};
use goblin::error::{self, Error};
use log::{debug, warn};
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::{Pread, Pwrite};

use crate::image::{consts, ElfImage};

/// Round `n` up to a multiple of `m`. Zero rounds up to a full unit.
pub(crate) fn round_up(n: u64, m: u64) -> u64 {
    if n == 0 {
        return m;
    }
    ((n - 1) / m + 1) * m
}

/// Point every segment of the given type at the (moved) section.
fn sync_segments(phdrs: &mut [ProgramHeader], p_type: u32, shdr: &SectionHeader) {
    for phdr in phdrs.iter_mut().filter(|p| p.p_type == p_type) {
        phdr.p_offset = shdr.sh_offset;
        phdr.p_vaddr = shdr.sh_addr;
        phdr.p_paddr = shdr.sh_addr;
        phdr.p_filesz = shdr.sh_size;
        phdr.p_memsz = shdr.sh_size;
    }
}

impl ElfImage {
    /// Apply all staged section replacements, rewriting the file layout.
    ///
    /// Without `force` this is a no-op when no replacements are pending.
    /// After a successful commit, [`bytes`](ElfImage::bytes) holds a
    /// well-formed image reflecting every edit; staging further edits after
    /// a commit is not supported.
    pub fn commit(&mut self, force: bool) -> error::Result<()> {
        if !force && self.replaced_sections.is_empty() {
            return Ok(());
        }

        for (name, content) in &self.replaced_sections {
            debug!("replacing section '{}' with size {}", name, content.len());
        }

        match self.header.e_type {
            header::ET_DYN => {
                debug!("this is a dynamic library");
                self.rewrite_sections_library()?;
            }
            header::ET_EXEC => {
                debug!("this is an executable");
                self.rewrite_sections_executable()?;
            }
            _ => return Err(Error::Malformed("unknown ELF type".into())),
        }

        self.header.try_into_ctx(&mut self.bytes[..], self.ctx.le)?;
        Ok(())
    }

    fn ehdr_size(&self) -> u64 {
        if self.ctx.container.is_big() {
            goblin::elf64::header::SIZEOF_EHDR as u64
        } else {
            goblin::elf32::header::SIZEOF_EHDR as u64
        }
    }

    /// Place replaced sections at the end of the file, mapped by a PT_LOAD
    /// directly after the last virtual address page of the other segments.
    fn rewrite_sections_library(&mut self) -> error::Result<()> {
        let mut start_page: u64 = 0;
        let mut first_page: u64 = 0;
        let mut align_start_page = self.page_size();
        for phdr in &self.phdrs {
            let this_page = phdr.p_vaddr + phdr.p_memsz;
            if this_page > start_page {
                start_page = this_page;
            }
            if phdr.p_type == PT_PHDR {
                first_page = phdr.p_vaddr - phdr.p_offset;
            }
            align_start_page = align_start_page.max(phdr.p_align);
        }
        let start_page = round_up(start_page, align_start_page);

        debug!("last page is {start_page:#x}");
        debug!("first page is {first_page:#x}");

        // Normalizing note segments adds at worst one program header per
        // SHT_NOTE section; reserve room for that and for one extra
        // PT_LOAD covering a relocated PHT.
        let num_notes = self.shdrs.iter().filter(|s| s.sh_type == SHT_NOTE).count() as u64;

        let phentsize = ProgramHeader::size_with(&self.ctx) as u64;
        let pht_size = round_up(
            (self.phdrs.len() as u64 + num_notes + 1) * phentsize + self.ehdr_size(),
            self.section_alignment,
        );
        let sht_size = round_up(
            self.header.e_shnum as u64 * self.header.e_shentsize as u64,
            self.section_alignment,
        );

        // Keeping the PHT at the start of the file preserves compatibility
        // with kernels that refuse a PHT elsewhere, but that only works if
        // every section inside the grown PHT's footprint can be moved out
        // of the way.
        let mut relocate_pht = false;
        let mut i = 1;
        while i < self.shdrs.len() && self.shdrs[i].sh_offset <= pht_size {
            let name = self.section_name(&self.shdrs[i])?;
            if !self.has_replaced_section(&name) && !self.can_replace_section(&name)? {
                relocate_pht = true;
                break;
            }
            i += 1;
        }

        if !relocate_pht {
            let mut i = 1;
            while i < self.shdrs.len() && self.shdrs[i].sh_offset <= pht_size {
                let name = self.section_name(&self.shdrs[i])?;
                let section_size = self.shdrs[i].sh_size as usize;
                if !self.has_replaced_section(&name) {
                    self.replace_section(&name, section_size)?;
                }
                i += 1;
            }
        }

        let mut needed_space = sht_size;
        if relocate_pht {
            needed_space += pht_size;
        }
        for content in self.replaced_sections.values() {
            needed_space += round_up(content.len() as u64, self.section_alignment);
        }
        debug!("needed space is {needed_space}");

        let start_offset = round_up(self.bytes.len() as u64, align_start_page);

        // One byte of slack: binutils 2.30 readelf checks that the dynamic
        // segment is strictly smaller than the file.
        let binutils_quirk_padding = 1u64;
        self.bytes
            .resize((start_offset + needed_space + binutils_quirk_padding) as usize, 0);

        // Instead of allocating a new PT_LOAD segment, try expanding the
        // last one.
        let mut last_seg_addr: u64 = 0;
        if let Some(last_seg) = self.phdrs.last_mut() {
            if last_seg.p_type == PT_LOAD
                && last_seg.p_flags == (PF_R | PF_W)
                && last_seg.p_align == align_start_page
            {
                let seg_end = round_up(last_seg.p_offset + last_seg.p_memsz, align_start_page);
                if seg_end == start_offset {
                    let new_size = start_offset + needed_space - last_seg.p_offset;
                    last_seg.p_filesz = new_size;
                    last_seg.p_memsz = new_size;
                    last_seg_addr = last_seg.p_vaddr + new_size - needed_space;
                }
            }
        }

        if last_seg_addr == 0 {
            debug!("allocating new PT_LOAD segment");
            assert_eq!(start_page % align_start_page, start_offset % align_start_page);
            self.phdrs.push(ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: start_offset,
                p_vaddr: start_page,
                p_paddr: start_page,
                p_filesz: needed_space,
                p_memsz: needed_space,
                p_align: align_start_page,
            });
            self.header.e_phnum = self.phdrs.len() as u16;
            last_seg_addr = start_page;
        }

        self.normalize_note_segments()?;

        let mut cur_off = start_offset;

        if relocate_pht {
            debug!(
                "rewriting pht from offset {:#x} to offset {:#x} (size {})",
                self.header.e_phoff, cur_off, pht_size
            );
            self.header.e_phoff = cur_off;
            cur_off += pht_size;
        }

        debug!(
            "rewriting sht from offset {:#x} to offset {:#x} (size {})",
            self.header.e_shoff, cur_off, sht_size
        );
        self.header.e_shoff = cur_off;
        cur_off += sht_size;

        self.write_replaced_sections(&mut cur_off, start_page, start_offset)?;
        assert_eq!(cur_off, start_offset + needed_space);

        if relocate_pht {
            self.rewrite_headers(last_seg_addr)
        } else {
            self.rewrite_headers(first_page + self.header.e_phoff)
        }
    }

    /// Grow the header region at the start of the file, moving every
    /// section in the way, and shift later pages forward when the region
    /// cannot absorb the growth.
    fn rewrite_sections_executable(&mut self) -> error::Result<()> {
        // Sort by offset first, otherwise the walk below would miss
        // sections preceding the last replaced one.
        self.sort_shdrs()?;

        let mut last_replaced = 0;
        for i in 1..self.shdrs.len() {
            let name = self.section_name(&self.shdrs[i])?;
            if self.replaced_sections.contains_key(&name) {
                debug!("using replaced section '{name}'");
                last_replaced = i;
            }
        }
        assert!(last_replaced != 0, "no replaced sections");
        debug!("last replaced is {last_replaced}");

        assert!(last_replaced + 1 < self.shdrs.len());
        let mut start_offset = self.shdrs[last_replaced + 1].sh_offset;
        let mut start_addr = self.shdrs[last_replaced + 1].sh_addr;

        // Replace all sections before the last replaced one as well, as far
        // as possible, so the whole prefix can be rewritten as one region.
        // SHT_PROGBITS sections (other than .interp) stop the walk: they
        // cannot be moved in virtual address space since that would
        // invalidate absolute references to them. A section directly after
        // .dynstr stops the walk too; the reason for that rule is lost.
        let mut prev_section = String::new();
        for i in 1..=last_replaced {
            let shdr = self.shdrs[i].clone();
            let section_name = self.section_name(&shdr)?;
            debug!("looking at section '{section_name}'");
            if (shdr.sh_type == SHT_PROGBITS && section_name != ".interp")
                || prev_section == ".dynstr"
            {
                start_offset = shdr.sh_offset;
                start_addr = shdr.sh_addr;
                break;
            }
            if !self.replaced_sections.contains_key(&section_name) {
                debug!("replacing section '{section_name}' which is in the way");
                self.replace_section(&section_name, shdr.sh_size as usize)?;
            }
            prev_section = section_name;
        }

        debug!("first reserved offset/addr is {start_offset:#x}/{start_addr:#x}");

        let page_size = self.page_size();
        assert_eq!(start_addr % page_size, start_offset % page_size);
        let mut first_page = start_addr - start_offset;
        debug!("first page is {first_page:#x}");

        if self.header.e_shoff < start_offset {
            // The section headers occur too early in the file and would be
            // overwritten by the replaced sections. Move them to the end of
            // the file before proceeding.
            let shoff_new = self.bytes.len() as u64;
            let sh_size =
                self.header.e_shoff + self.header.e_shnum as u64 * self.header.e_shentsize as u64;
            self.bytes.resize(self.bytes.len() + sh_size as usize, 0);
            self.header.e_shoff = shoff_new;

            assert_eq!(self.header.e_shnum as usize, self.shdrs.len());
            self.sort_shdrs()?;
            self.write_shdrs_into_bytes()?;
        }

        self.normalize_note_segments()?;

        let phentsize = ProgramHeader::size_with(&self.ctx) as u64;
        let mut needed_space = self.ehdr_size() + self.phdrs.len() as u64 * phentsize;
        for content in self.replaced_sections.values() {
            needed_space += round_up(content.len() as u64, self.section_alignment);
        }
        debug!("needed space is {needed_space}");

        if needed_space > start_offset {
            // The shift below introduces one more program header.
            needed_space += phentsize;
            debug!("needed space is {needed_space}");

            let extra_space = needed_space - start_offset;
            // One extra page avoids colliding with segments that start at
            // unaligned addresses and get rounded down when mapped.
            let needed_pages = 1 + round_up(extra_space, page_size) / page_size;
            debug!("needed pages is {needed_pages}");
            if needed_pages * page_size > first_page {
                return Err(Error::Malformed("virtual address space underrun!".into()));
            }

            self.shift_file(needed_pages, start_offset, extra_space);

            first_page -= needed_pages * page_size;
            start_offset += needed_pages * page_size;
        }

        let mut cur_off = self.ehdr_size() + self.phdrs.len() as u64 * phentsize;

        // The PHT was covered by a PT_LOAD before, so no new segment is
        // needed here; extend the covering one if it falls short.
        for phdr in self.phdrs.iter_mut() {
            if phdr.p_type == PT_LOAD
                && phdr.p_offset <= cur_off
                && phdr.p_offset + phdr.p_filesz > cur_off
                && phdr.p_filesz < needed_space
            {
                phdr.p_filesz = needed_space;
                phdr.p_memsz = needed_space;
                break;
            }
        }

        debug!("clearing first {} bytes", start_offset - cur_off);
        self.bytes[cur_off as usize..start_offset as usize].fill(0);

        self.write_replaced_sections(&mut cur_off, first_page, 0)?;
        assert_eq!(cur_off, needed_space);

        self.rewrite_headers(first_page + self.header.e_phoff)
    }

    /// Insert `extra_pages` zero pages at `start_offset`, splitting the
    /// PT_LOAD that straddles the gap and adding a PT_LOAD for the pages.
    fn shift_file(&mut self, extra_pages: u64, start_offset: u64, extra_bytes: u64) {
        assert!(start_offset >= self.ehdr_size());
        let old_size = self.bytes.len();
        assert!(old_size as u64 > start_offset);

        let page_size = self.page_size();
        let shift = extra_pages * page_size;
        let start = start_offset as usize;
        self.bytes.resize(old_size + shift as usize, 0);
        self.bytes.copy_within(start..old_size, start + shift as usize);
        self.bytes[start..start + shift as usize].fill(0);

        self.header.e_phoff = self.ehdr_size();
        if self.header.e_shoff >= start_offset {
            self.header.e_shoff += shift;
        }

        for shdr in self.shdrs.iter_mut().skip(1) {
            if shdr.sh_offset >= start_offset {
                shdr.sh_offset += shift;
            }
        }

        let mut split: Option<(usize, u64)> = None;
        for i in 0..self.phdrs.len() {
            let phdr = &mut self.phdrs[i];
            let mut p_start = phdr.p_offset;

            if p_start <= start_offset
                && p_start + phdr.p_filesz > start_offset
                && phdr.p_type == PT_LOAD
            {
                assert!(split.is_none(), "more than one PT_LOAD covers the gap");
                let split_shift = start_offset - p_start;
                split = Some((i, split_shift));

                // This is the load segment the gap opens inside; it keeps
                // only the part after the gap.
                phdr.p_offset = start_offset;
                phdr.p_memsz -= split_shift;
                phdr.p_filesz -= split_shift;
                phdr.p_paddr += split_shift;
                phdr.p_vaddr += split_shift;

                p_start = start_offset;
            }

            if p_start >= start_offset {
                phdr.p_offset = p_start + shift;
                if phdr.p_align != 0
                    && phdr.p_vaddr.wrapping_sub(phdr.p_offset) % phdr.p_align != 0
                {
                    debug!(
                        "changing alignment of program header {} from {} to {}",
                        i, phdr.p_align, page_size
                    );
                    phdr.p_align = page_size;
                }
            } else {
                // Not physically shifted; pull the mapping back instead so
                // the inserted pages fit in front of it.
                if phdr.p_paddr >= shift {
                    phdr.p_paddr -= shift;
                }
                if phdr.p_vaddr >= shift {
                    phdr.p_vaddr -= shift;
                }
            }
        }

        let Some((split_index, split_shift)) = split else {
            panic!("no PT_LOAD covers the shifted region");
        };

        // Add a PT_LOAD for the part split off above plus the fresh space.
        let base = &self.phdrs[split_index];
        let new_phdr = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: base.p_offset - split_shift - shift,
            p_vaddr: base.p_vaddr - split_shift - shift,
            p_paddr: base.p_paddr - split_shift - shift,
            p_filesz: split_shift + extra_bytes,
            p_memsz: split_shift + extra_bytes,
            p_align: page_size,
        };
        self.phdrs.push(new_phdr);
        self.header.e_phnum = self.phdrs.len() as u16;
    }

    /// Break up PT_NOTE segments covering multiple SHT_NOTE sections into
    /// one segment per section, so a single note section can move without
    /// dragging its neighbors along.
    fn normalize_note_segments(&mut self) -> error::Result<()> {
        let mut replaced_note = false;
        for name in self.replaced_sections.keys() {
            if self.find_section_header(name)?.sh_type == SHT_NOTE {
                replaced_note = true;
                break;
            }
        }
        if !replaced_note {
            return Ok(());
        }

        let mut new_phdrs = Vec::new();
        for phdr in self.phdrs.iter_mut() {
            if phdr.p_type != PT_NOTE {
                continue;
            }
            let start_off = phdr.p_offset;
            let mut curr_off = start_off;
            let end_off = start_off + phdr.p_filesz;

            // Earlier rewrites may have left empty PT_NOTE segments behind;
            // ignore them.
            let empty = !self
                .shdrs
                .iter()
                .any(|shdr| shdr.sh_offset >= start_off && shdr.sh_offset < end_off);
            if empty {
                continue;
            }

            while curr_off < end_off {
                // Find the note section starting at the current offset. If
                // there is none, the sections are not contiguous within the
                // segment.
                let mut size = 0;
                for shdr in self.shdrs.iter() {
                    if shdr.sh_type != SHT_NOTE {
                        continue;
                    }
                    if shdr.sh_offset != round_up(curr_off, shdr.sh_addralign.max(1)) {
                        continue;
                    }
                    size = shdr.sh_size;
                    curr_off = round_up(curr_off, shdr.sh_addralign.max(1));
                    break;
                }
                if size == 0 {
                    return Err(Error::Malformed(
                        "cannot normalize PT_NOTE segment: non-contiguous SHT_NOTE sections".into(),
                    ));
                }
                if curr_off + size > end_off {
                    return Err(Error::Malformed(
                        "cannot normalize PT_NOTE segment: partially mapped SHT_NOTE section".into(),
                    ));
                }

                let mut new_phdr = phdr.clone();
                new_phdr.p_offset = curr_off;
                new_phdr.p_vaddr = phdr.p_vaddr + (curr_off - start_off);
                new_phdr.p_paddr = phdr.p_paddr + (curr_off - start_off);
                new_phdr.p_filesz = size;
                new_phdr.p_memsz = size;

                // The first derived segment reuses the original slot;
                // later ones are appended.
                if curr_off == start_off {
                    *phdr = new_phdr;
                } else {
                    new_phdrs.push(new_phdr);
                }

                curr_off += size;
            }
        }
        self.phdrs.extend(new_phdrs);
        self.header.e_phnum = self.phdrs.len() as u16;
        Ok(())
    }

    /// Write every staged replacement into the reserved region starting at
    /// `cur_off`, updating its section header and any segment that must
    /// track the section.
    fn write_replaced_sections(
        &mut self,
        cur_off: &mut u64,
        start_addr: u64,
        start_offset: u64,
    ) -> error::Result<()> {
        // Overwrite the old contents before writing the new ones, so a
        // section landing inside the reserved region cannot clobber data
        // already written there.
        let names: Vec<String> = self.replaced_sections.keys().cloned().collect();
        for name in &names {
            let shdr = self.find_section_header(name)?;
            if shdr.sh_type != SHT_NOBITS {
                let start = shdr.sh_offset as usize;
                let end = start + shdr.sh_size as usize;
                self.bytes[start..end].fill(b'Z');
            }
        }

        let replaced = std::mem::take(&mut self.replaced_sections);
        let mut noted_phdrs = BTreeSet::new();

        // Iterate the section headers in table order so the relative
        // position of replaced sections is preserved.
        for idx in 0..self.shdrs.len() {
            let section_name = self.section_name(&self.shdrs[idx])?;
            let Some(content) = replaced.get(&section_name) else {
                continue;
            };

            let orig_shdr = self.shdrs[idx].clone();
            debug!(
                "rewriting section '{}' from offset {:#x} (size {}) to offset {:#x} (size {})",
                section_name,
                orig_shdr.sh_offset,
                orig_shdr.sh_size,
                *cur_off,
                content.len()
            );

            let dst = *cur_off as usize;
            self.bytes[dst..dst + content.len()].copy_from_slice(content);

            let shdr = &mut self.shdrs[idx];
            shdr.sh_offset = *cur_off;
            shdr.sh_addr = start_addr + (*cur_off - start_offset);
            shdr.sh_size = content.len() as u64;
            shdr.sh_addralign = self.section_alignment;

            // Note contents are formatted differently depending on the
            // section alignment, so keep the original alignment if possible.
            if shdr.sh_type == SHT_NOTE && orig_shdr.sh_addralign < self.section_alignment {
                shdr.sh_addralign = orig_shdr.sh_addralign;
            }

            let moved = shdr.clone();

            if section_name == ".interp" {
                sync_segments(&mut self.phdrs, PT_INTERP, &moved);
            } else if section_name == ".dynamic" {
                sync_segments(&mut self.phdrs, PT_DYNAMIC, &moved);
            }

            // After normalization every PT_NOTE maps exactly one section,
            // so a moved note section takes its segment along.
            if moved.sh_type == SHT_NOTE {
                for j in 0..self.phdrs.len() {
                    if self.phdrs[j].p_type != PT_NOTE || noted_phdrs.contains(&j) {
                        continue;
                    }
                    let p_start = self.phdrs[j].p_offset;
                    let p_end = p_start + self.phdrs[j].p_filesz;
                    let s_start = orig_shdr.sh_offset;
                    let s_end = s_start + orig_shdr.sh_size;

                    if !(s_start >= p_start && s_start < p_end)
                        && !(s_end > p_start && s_end <= p_end)
                    {
                        continue;
                    }
                    if p_start != s_start || p_end != s_end {
                        return Err(Error::Malformed(
                            "unsupported overlap of SHT_NOTE and PT_NOTE".into(),
                        ));
                    }

                    let phdr = &mut self.phdrs[j];
                    phdr.p_offset = moved.sh_offset;
                    phdr.p_vaddr = moved.sh_addr;
                    phdr.p_paddr = moved.sh_addr;
                    phdr.p_filesz = moved.sh_size;
                    phdr.p_memsz = moved.sh_size;
                    noted_phdrs.insert(j);
                }
            }

            if section_name == ".MIPS.abiflags" {
                sync_segments(&mut self.phdrs, consts::PT_MIPS_ABIFLAGS, &moved);
            }
            if section_name == ".note.gnu.property" {
                sync_segments(&mut self.phdrs, consts::PT_GNU_PROPERTY, &moved);
            }

            *cur_off += round_up(content.len() as u64, self.section_alignment);
        }

        Ok(())
    }

    /// Stable sort of the program headers by file offset.
    fn sort_phdrs(&mut self) {
        self.phdrs.sort_by_key(|phdr| phdr.p_offset);
    }

    /// Stable sort of the section headers by file offset, keeping the null
    /// section at index 0.
    ///
    /// `sh_link` and `sh_info` cross-references hold indices that go stale
    /// when the table is permuted; they are captured as section names before
    /// the sort and resolved back to indices afterwards. `e_shstrndx` is
    /// restored by offset, since duplicate names could make a name lookup
    /// pick the wrong table.
    fn sort_shdrs(&mut self) -> error::Result<()> {
        let mut linkage: BTreeMap<String, String> = BTreeMap::new();
        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_link != 0 {
                let from = self.section_name(&self.shdrs[i])?;
                let to_index = self.shdrs[i].sh_link as usize;
                if to_index >= self.shdrs.len() {
                    return Err(Error::Malformed(format!(
                        "section '{from}' has an out-of-bounds sh_link"
                    )));
                }
                let to = self.section_name(&self.shdrs[to_index])?;
                linkage.insert(from, to);
            }
        }

        let mut info: BTreeMap<String, String> = BTreeMap::new();
        for i in 1..self.shdrs.len() {
            let shdr = &self.shdrs[i];
            if shdr.sh_info != 0 && (shdr.sh_type == SHT_REL || shdr.sh_type == SHT_RELA) {
                let from = self.section_name(shdr)?;
                let to_index = shdr.sh_info as usize;
                if to_index >= self.shdrs.len() {
                    return Err(Error::Malformed(format!(
                        "section '{from}' has an out-of-bounds sh_info"
                    )));
                }
                let to = self.section_name(&self.shdrs[to_index])?;
                info.insert(from, to);
            }
        }

        let shstrtab = self.shdrs[self.header.e_shstrndx as usize].clone();

        self.shdrs[1..].sort_by_key(|shdr| shdr.sh_offset);

        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_link != 0 {
                let name = self.section_name(&self.shdrs[i])?;
                if let Some(target) = linkage.get(&name) {
                    let new_index = self.section_index(target)? as u32;
                    self.shdrs[i].sh_link = new_index;
                }
            }
        }

        for i in 1..self.shdrs.len() {
            let (sh_type, sh_info) = (self.shdrs[i].sh_type, self.shdrs[i].sh_info);
            if sh_info != 0 && (sh_type == SHT_REL || sh_type == SHT_RELA) {
                let name = self.section_name(&self.shdrs[i])?;
                if let Some(target) = info.get(&name) {
                    let new_index = self.section_index(target)? as u32;
                    self.shdrs[i].sh_info = new_index;
                }
            }
        }

        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_offset == shstrtab.sh_offset {
                self.header.e_shstrndx = i as u16;
            }
        }

        Ok(())
    }

    fn write_phdrs_into_bytes(&mut self) -> error::Result<()> {
        let offset = self.header.e_phoff as usize;
        let phentsize = ProgramHeader::size_with(&self.ctx);
        for (i, phdr) in self.phdrs.iter().enumerate() {
            self.bytes
                .pwrite_with(phdr.clone(), offset + i * phentsize, self.ctx)?;
        }
        Ok(())
    }

    /// Serialize the section headers, skipping index 0: the null entry is
    /// all zeroes and the reserved space already is.
    fn write_shdrs_into_bytes(&mut self) -> error::Result<()> {
        let offset = self.header.e_shoff as usize;
        let shentsize = SectionHeader::size_with(&self.ctx);
        for (i, shdr) in self.shdrs.iter().enumerate().skip(1) {
            self.bytes
                .pwrite_with(shdr.clone(), offset + i * shentsize, self.ctx)?;
        }
        Ok(())
    }

    /// Re-emit the program and section header tables and bring every
    /// derived view of the layout back in sync: the PT_PHDR segment, the
    /// `.dynamic` tag pointers, and symbol-table section references.
    fn rewrite_headers(&mut self, phdr_address: u64) -> error::Result<()> {
        // If there is a segment for the program header table, update it;
        // there can be only one.
        let pht_bytes = self.phdrs.len() as u64 * ProgramHeader::size_with(&self.ctx) as u64;
        for phdr in self.phdrs.iter_mut() {
            if phdr.p_type == PT_PHDR {
                phdr.p_offset = self.header.e_phoff;
                phdr.p_vaddr = phdr_address;
                phdr.p_paddr = phdr_address;
                phdr.p_filesz = pht_bytes;
                phdr.p_memsz = pht_bytes;
                break;
            }
        }

        self.sort_phdrs();
        self.write_phdrs_into_bytes()?;

        assert_eq!(self.header.e_shnum as usize, self.shdrs.len());
        self.sort_shdrs()?;
        self.write_shdrs_into_bytes()?;

        self.rewrite_dynamic_tags()?;
        self.rewrite_symbol_tables()
    }

    /// Refresh the virtual addresses in the `.dynamic` tag table from the
    /// (re-sorted, possibly moved) section headers. Not every image has a
    /// `.dynamic` section.
    fn rewrite_dynamic_tags(&mut self) -> error::Result<()> {
        let Some(shdr_dynamic) = self.try_find_section_header(".dynamic")? else {
            return Ok(());
        };

        let entsize = Dyn::size_with(&self.ctx);
        let table_offset = shdr_dynamic.sh_offset as usize;
        let count = shdr_dynamic.sh_size as usize / entsize;

        for index in 0..count {
            let offset = table_offset + index * entsize;
            let mut entry: Dyn = self.bytes.pread_with(offset, self.ctx)?;
            if entry.d_tag == DT_NULL {
                break;
            }

            let new_val = match entry.d_tag {
                DT_STRTAB => Some(self.find_section_header(".dynstr")?.sh_addr),
                DT_STRSZ => Some(self.find_section_header(".dynstr")?.sh_size),
                DT_SYMTAB => Some(self.find_section_header(".dynsym")?.sh_addr),
                DT_HASH => Some(self.find_section_header(".hash")?.sh_addr),
                // Some binaries have the hash section stripped; leave the
                // tag alone then.
                DT_GNU_HASH => self
                    .try_find_section_header(".gnu.hash")?
                    .map(|shdr| shdr.sh_addr),
                consts::DT_MIPS_XHASH => Some(self.find_section_header(".MIPS.xhash")?.sh_addr),
                DT_JMPREL => {
                    let mut shdr = self.try_find_section_header(".rel.plt")?;
                    if shdr.is_none() {
                        shdr = self.try_find_section_header(".rela.plt")?;
                    }
                    if shdr.is_none() {
                        shdr = self.try_find_section_header(".rela.IA_64.pltoff")?;
                    }
                    let shdr = shdr.ok_or_else(|| {
                        Error::Malformed("cannot find section corresponding to DT_JMPREL".into())
                    })?;
                    Some(shdr.sh_addr)
                }
                DT_REL => {
                    let mut shdr = self.try_find_section_header(".rel.dyn")?;
                    if shdr.is_none() {
                        shdr = self.try_find_section_header(".rel.got")?;
                    }
                    // Some binaries have neither section; that is fine.
                    shdr.map(|shdr| shdr.sh_addr)
                }
                DT_RELA => self
                    .try_find_section_header(".rela.dyn")?
                    .map(|shdr| shdr.sh_addr),
                DT_VERNEED => Some(self.find_section_header(".gnu.version_r")?.sh_addr),
                DT_VERSYM => Some(self.find_section_header(".gnu.version")?.sh_addr),
                consts::DT_MIPS_RLD_MAP_REL => {
                    // This tag stores the offset of the debug map pointer
                    // relative to the tag's own address.
                    match self.try_find_section_header(".rld_map")? {
                        Some(rld_map) => {
                            let tag_offset = (index * entsize) as u64;
                            Some(
                                rld_map
                                    .sh_addr
                                    .wrapping_sub(tag_offset)
                                    .wrapping_sub(shdr_dynamic.sh_addr),
                            )
                        }
                        None => {
                            // The dynamic loader still needs somewhere to
                            // write the debug pointer; the file is broken,
                            // not ours to fix.
                            warn!(
                                "DT_MIPS_RLD_MAP_REL entry is present, but .rld_map section is not"
                            );
                            Some(0)
                        }
                    }
                }
                _ => None,
            };

            if let Some(val) = new_val {
                entry.d_val = val;
                self.bytes.pwrite_with(entry, offset, self.ctx)?;
            }
        }

        Ok(())
    }

    /// Symbol tables carry the indices of the sections their symbols live
    /// in; remap them from parse-time indices to the re-sorted table.
    fn rewrite_symbol_tables(&mut self) -> error::Result<()> {
        let sym_size = Sym::size_with(&self.ctx);
        for i in 1..self.shdrs.len() {
            let shdr = self.shdrs[i].clone();
            if shdr.sh_type != SHT_SYMTAB && shdr.sh_type != SHT_DYNSYM {
                continue;
            }
            debug!("rewriting symbol table section {i}");

            let count = shdr.sh_size as usize / sym_size;
            for entry in 0..count {
                let offset = shdr.sh_offset as usize + entry * sym_size;
                let mut sym: Sym = self.bytes.pread_with(offset, self.ctx)?;
                let shndx = sym.st_shndx;
                if shndx == consts::SHN_UNDEF || shndx >= consts::SHN_LORESERVE {
                    continue;
                }
                if shndx >= self.sections_by_old_index.len() {
                    warn!("symbol table entry {entry} refers to non-existent section {shndx}, skipping");
                    continue;
                }
                let section = self.sections_by_old_index[shndx].clone();
                assert!(!section.is_empty());
                let new_index = self.section_index(&section)?;
                sym.st_shndx = new_index;
                if sym.st_type() == STT_SECTION {
                    sym.st_value = self.shdrs[new_index].sh_addr;
                }
                self.bytes.pwrite_with(sym, offset, self.ctx)?;
            }
        }
        Ok(())
    }
}
