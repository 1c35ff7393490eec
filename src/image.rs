//! Parsed, mutable view of an ELF image.
//!
//! [`ElfImage`] owns the raw bytes of an executable or shared library
//! together with parsed copies of the program-header and section-header
//! tables. Edits are staged as whole-section replacements and applied in a
//! single [`commit`](ElfImage::commit) pass that re-plans the file layout.

use std::collections::BTreeMap;

use goblin::container::Ctx;
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::{ProgramHeader, PT_INTERP};
use goblin::elf::section_header::{SectionHeader, SHT_PROGBITS};
use goblin::error::{self, Error};
use log::debug;
use scroll::ctx::SizeWith;
use scroll::Pread;

/// ELF constants not exported by goblin.
pub(crate) mod consts {
    /// Index of the version byte in `e_ident`.
    pub const EI_VERSION: usize = 6;
    /// Current ELF version.
    pub const EV_CURRENT: u8 = 1;
    /// Historical Alpha machine value, still emitted by Alpha toolchains.
    pub const EM_ALPHA: u16 = 0x9026;
    /// LoongArch machine value, not yet exported by goblin.
    pub const EM_LOONGARCH: u16 = 258;
    /// Segment holding the `.note.gnu.property` section.
    pub const PT_GNU_PROPERTY: u32 = 0x6474_e553;
    /// Segment holding the `.MIPS.abiflags` section.
    pub const PT_MIPS_ABIFLAGS: u32 = 0x7000_0003;
    /// Offset of the debug map pointer, relative to the tag's own address.
    pub const DT_MIPS_RLD_MAP_REL: u64 = 0x7000_0035;
    /// Address of the `.MIPS.xhash` table.
    pub const DT_MIPS_XHASH: u64 = 0x7000_0036;
    /// Undefined section index in a symbol table entry.
    pub const SHN_UNDEF: usize = 0;
    /// First reserved section index.
    pub const SHN_LORESERVE: usize = 0xff00;
}

/// A mutable ELF image with staged section replacements.
///
/// The image is created from a complete file with [`ElfImage::parse`],
/// mutated through any number of [`replace_section`](ElfImage::replace_section)
/// calls (or higher-level editors such as
/// [`replace_needed`](ElfImage::replace_needed)), and finalized with a single
/// [`commit`](ElfImage::commit). After the commit the byte buffer returned by
/// [`bytes`](ElfImage::bytes) or [`into_bytes`](ElfImage::into_bytes) is the
/// rewritten file.
///
/// # Example
///
/// ```no_run
/// use elf_rewriter::ElfImage;
///
/// let data = std::fs::read("libfoo.so").unwrap();
/// let mut image = ElfImage::parse(data).unwrap();
///
/// // Grow .dynstr by eight bytes; the layout is fixed up at commit time.
/// let len = image.section_contents(".dynstr").unwrap().len();
/// image.replace_section(".dynstr", len + 8).unwrap();
/// image.commit(false).unwrap();
///
/// std::fs::write("libfoo_patched.so", image.bytes()).unwrap();
/// ```
#[derive(Debug)]
pub struct ElfImage {
    /// The current on-disk image.
    pub(crate) bytes: Vec<u8>,
    /// ELF header, authoritative during a rewrite.
    pub(crate) header: Header,
    /// Container width and byte order; every multi-byte read and write of
    /// the image goes through this context.
    pub(crate) ctx: Ctx,
    /// Owned copy of the program-header table.
    pub(crate) phdrs: Vec<ProgramHeader>,
    /// Owned copy of the section-header table. Index 0 is the null section.
    pub(crate) shdrs: Vec<SectionHeader>,
    /// Contents of the section-name string table (`.shstrtab`).
    pub(crate) section_names: Vec<u8>,
    /// Section names keyed by their index at parse time, so symbol-table
    /// rewrites can translate indices after the headers are re-sorted.
    pub(crate) sections_by_old_index: Vec<String>,
    /// Pending edits: intended new contents keyed by section name.
    pub(crate) replaced_sections: BTreeMap<String, Vec<u8>>,
    /// Alignment used when packing replaced sections end-to-end.
    pub(crate) section_alignment: u64,
    /// Page-size override; the machine-derived value is used otherwise.
    pub(crate) forced_page_size: Option<u64>,
    pub(crate) is_executable: bool,
    pub(crate) changed: bool,
}

impl ElfImage {
    /// Parse a complete ELF image, taking ownership of its bytes.
    ///
    /// Fails fast on structural problems: bad magic or version, an ELF type
    /// other than `ET_EXEC`/`ET_DYN`, header tables that do not fit in the
    /// file (checked arithmetic, so overflowing offsets are rejected), a
    /// missing or unterminated section-name string table.
    pub fn parse(bytes: Vec<u8>) -> error::Result<Self> {
        let header: Header = bytes.pread(0)?;

        if header.e_ident[consts::EI_VERSION] != consts::EV_CURRENT {
            return Err(Error::Malformed("unsupported ELF version".into()));
        }

        let container = header.container()?;
        let endianness = header.endianness()?;
        let ctx = Ctx::new(container, endianness);

        if header.e_type != header::ET_EXEC && header.e_type != header::ET_DYN {
            return Err(Error::Malformed("wrong ELF type".into()));
        }

        table_bounds(
            header.e_phoff,
            header.e_phnum as u64,
            header.e_phentsize as u64,
            bytes.len(),
            "program header table out of bounds",
        )?;

        if header.e_shnum == 0 {
            return Err(Error::Malformed(
                "no section headers. The input file is probably a statically linked, \
                 self-decompressing binary"
                    .into(),
            ));
        }

        table_bounds(
            header.e_shoff,
            header.e_shnum as u64,
            header.e_shentsize as u64,
            bytes.len(),
            "section header table out of bounds",
        )?;

        let phentsize = ProgramHeader::size_with(&ctx);
        if header.e_phentsize as usize != phentsize {
            return Err(Error::Malformed("program headers have wrong size".into()));
        }

        let mut phdrs = Vec::with_capacity(header.e_phnum as usize);
        let mut is_executable = false;
        for i in 0..header.e_phnum as usize {
            let phdr: ProgramHeader = bytes.pread_with(header.e_phoff as usize + i * phentsize, ctx)?;
            if phdr.p_type == PT_INTERP {
                is_executable = true;
            }
            phdrs.push(phdr);
        }

        let shentsize = SectionHeader::size_with(&ctx);
        let mut shdrs = Vec::with_capacity(header.e_shnum as usize);
        for i in 0..header.e_shnum as usize {
            let shdr: SectionHeader = bytes.pread_with(header.e_shoff as usize + i * shentsize, ctx)?;
            shdrs.push(shdr);
        }

        let shstrndx = header.e_shstrndx as usize;
        if shstrndx >= shdrs.len() {
            return Err(Error::Malformed("string table index out of bounds".into()));
        }
        let strtab_end = shdrs[shstrndx]
            .sh_offset
            .checked_add(shdrs[shstrndx].sh_size)
            .ok_or_else(|| Error::Malformed("string table overflow".into()))?;
        if strtab_end > bytes.len() as u64 {
            return Err(Error::Malformed("string table out of bounds".into()));
        }
        let section_names = bytes[shdrs[shstrndx].sh_offset as usize..strtab_end as usize].to_vec();
        if section_names.is_empty() {
            return Err(Error::Malformed("string table size is zero".into()));
        }
        if section_names.last() != Some(&0) {
            return Err(Error::Malformed("string table is not zero terminated".into()));
        }

        let mut sections_by_old_index = vec![String::new(); shdrs.len()];
        for i in 1..shdrs.len() {
            sections_by_old_index[i] = name_from_table(&section_names, shdrs[i].sh_name)?;
        }

        let section_alignment = if container.is_big() { 8 } else { 4 };

        Ok(ElfImage {
            bytes,
            header,
            ctx,
            phdrs,
            shdrs,
            section_names,
            sections_by_old_index,
            replaced_sections: BTreeMap::new(),
            section_alignment,
            forced_page_size: None,
            is_executable,
            changed: false,
        })
    }

    /// The current image bytes. Only meaningful as a file after
    /// [`commit`](ElfImage::commit).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the image, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Whether any edit actually modified the image. Pass-through
    /// replacements staged for layout reasons do not count.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// True iff the image has a `PT_INTERP` segment.
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Override the page size used by the layout planners instead of
    /// deriving it from `e_machine`.
    pub fn set_forced_page_size(&mut self, page_size: u64) {
        self.forced_page_size = Some(page_size);
    }

    /// The loader's mapping granularity for this image.
    pub fn page_size(&self) -> u64 {
        match self.forced_page_size {
            Some(size) => size,
            None => page_size_for(self.header.e_machine),
        }
    }

    /// Name of the given section header, looked up in `.shstrtab`.
    pub(crate) fn section_name(&self, shdr: &SectionHeader) -> error::Result<String> {
        name_from_table(&self.section_names, shdr.sh_name)
    }

    /// Index of the named section, or 0 (the null section) when absent.
    pub(crate) fn section_index(&self, name: &str) -> error::Result<usize> {
        for i in 1..self.shdrs.len() {
            if self.section_name(&self.shdrs[i])? == name {
                return Ok(i);
            }
        }
        Ok(0)
    }

    /// Look up a section header by name, or `None` when absent.
    pub(crate) fn try_find_section_header(
        &self,
        name: &str,
    ) -> error::Result<Option<SectionHeader>> {
        let i = self.section_index(name)?;
        if i == 0 {
            return Ok(None);
        }
        Ok(Some(self.shdrs[i].clone()))
    }

    /// Look up a section header by name, failing when absent.
    pub(crate) fn find_section_header(&self, name: &str) -> error::Result<SectionHeader> {
        match self.try_find_section_header(name)? {
            Some(shdr) => Ok(shdr),
            None => {
                let extra = if name == ".interp" || name == ".dynamic" || name == ".dynstr" {
                    ". The input file is most likely statically linked"
                } else {
                    ""
                };
                Err(Error::Malformed(format!("cannot find section '{name}'{extra}")))
            }
        }
    }

    /// Copy of the named section's current on-disk contents.
    pub fn section_contents(&self, name: &str) -> error::Result<Vec<u8>> {
        let shdr = self.find_section_header(name)?;
        self.extract(shdr.sh_offset, shdr.sh_size)
    }

    pub(crate) fn extract(&self, offset: u64, size: u64) -> error::Result<Vec<u8>> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Malformed("section extends past the end of the file".into()))?;
        if end > self.bytes.len() as u64 {
            return Err(Error::Malformed("section extends past the end of the file".into()));
        }
        Ok(self.bytes[offset as usize..end as usize].to_vec())
    }

    /// Whether a replacement has been staged for the named section.
    pub fn has_replaced_section(&self, name: &str) -> bool {
        self.replaced_sections.contains_key(name)
    }

    /// Whether the named section may be moved in virtual address space.
    ///
    /// `SHT_PROGBITS` sections other than `.interp` hold code or read-only
    /// data that absolute references may point into, so they must stay put.
    pub fn can_replace_section(&self, name: &str) -> error::Result<bool> {
        let shdr = self.find_section_header(name)?;
        Ok(name == ".interp" || shdr.sh_type != SHT_PROGBITS)
    }

    /// Stage a replacement for the named section and return its buffer.
    ///
    /// The buffer starts from a previously staged replacement if one exists,
    /// otherwise from the section's current on-disk contents, and is resized
    /// to `size` (zero-extended on growth, truncated on shrink). Repeated
    /// calls therefore read-modify-write the same pending edit.
    pub fn replace_section(&mut self, name: &str, size: usize) -> error::Result<&mut Vec<u8>> {
        let base = match self.replaced_sections.get(name) {
            Some(buf) => buf.clone(),
            None => {
                let shdr = self.find_section_header(name)?;
                self.extract(shdr.sh_offset, shdr.sh_size)?
            }
        };
        debug!("staging replacement of section '{name}' with size {size}");
        let slot = self.replaced_sections.entry(name.to_owned()).or_default();
        *slot = base;
        slot.resize(size, 0);
        Ok(slot)
    }
}

/// Bounds-check `offset + count * entsize` against the file size.
fn table_bounds(
    offset: u64,
    count: u64,
    entsize: u64,
    file_len: usize,
    msg: &str,
) -> error::Result<()> {
    let table_size = count
        .checked_mul(entsize)
        .ok_or_else(|| Error::Malformed(msg.into()))?;
    let end = offset
        .checked_add(table_size)
        .ok_or_else(|| Error::Malformed(msg.into()))?;
    if end > file_len as u64 {
        return Err(Error::Malformed(msg.into()));
    }
    Ok(())
}

/// Read a NUL-terminated name out of a string-table copy.
fn name_from_table(table: &[u8], offset: usize) -> error::Result<String> {
    if offset >= table.len() {
        return Err(Error::Malformed("section name offset out of bounds".into()));
    }
    let end = table[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|pos| offset + pos)
        .unwrap_or(table.len());
    Ok(String::from_utf8_lossy(&table[offset..end]).into_owned())
}

/// Read a NUL-terminated string out of the image at an absolute offset.
pub(crate) fn read_str_at(bytes: &[u8], offset: usize) -> error::Result<String> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| Error::Malformed(format!("string offset {offset:#x} out of bounds")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Malformed(format!("unterminated string at offset {offset:#x}")))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Minimum mapping granularity by architecture. There is no authoritative
/// list of these values; this one follows GNU gold's `abi_pagesize`.
pub(crate) fn page_size_for(machine: u16) -> u64 {
    match machine {
        consts::EM_ALPHA
        | header::EM_IA_64
        | header::EM_MIPS
        | header::EM_PPC
        | header::EM_PPC64
        | header::EM_AARCH64
        | header::EM_TILEGX
        | consts::EM_LOONGARCH => 0x10000,
        // SPARC 32-bit could use 4K pages on Linux, but Solaris uses 8K.
        header::EM_SPARC | header::EM_SPARCV9 => 0x2000,
        _ => 0x1000,
    }
}
