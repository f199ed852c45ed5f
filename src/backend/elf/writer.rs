//! Relocatable ELF64 emission.
//!
//! The writer collects `.text` bytes, `.data` bytes, symbols, and
//! relocations, then serializes a complete little-endian ELF64 relocatable
//! object: file header, section bodies, section header table. Section
//! offsets and sizes are filled in during serialization.

use std::path::Path;

use super::{
    EF_RISCV_FLOAT_ABI_DOUBLE, EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_RISCV, ET_REL,
    EV_CURRENT, RELA_SIZE, SHDR_SIZE, SHF_ALLOC, SHF_EXECINSTR, SHF_INFO_LINK, SHF_WRITE,
    SHT_NULL, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STT_NOTYPE, SYM_SIZE,
};
use crate::common::error::Error;

// Section indices, fixed by construction.
const SECTION_STRTAB: usize = 1;
const SECTION_TEXT: usize = 2;
const SECTION_RELA_TEXT: usize = 3;
const SECTION_DATA: usize = 4;
const SECTION_SYMTAB: usize = 5;
const SECTION_COUNT: usize = 6;

// Fixed name offsets produced by the string-table seeding.
const STRTAB_NAME: u32 = 1;
const RELA_TEXT_NAME: u32 = 9;
const TEXT_NAME: u32 = 14;
const DATA_NAME: u32 = 20;
const SYMTAB_NAME: u32 = 26;

/// Append-only ELF string table.
#[derive(Debug)]
struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    /// Seeded with the six fixed section names. `.text` is not stored
    /// separately: it is the tail of `.rela.text`, so the fixed offsets are
    /// 0 (empty), 1, 9, 14, 20 and 26.
    fn with_section_names() -> Self {
        let mut table = StringTable { bytes: vec![0] };
        table.add(".strtab");
        table.add(".rela.text");
        table.add(".data");
        table.add(".symtab");
        debug_assert_eq!(&table.bytes[TEXT_NAME as usize..TEXT_NAME as usize + 6], b".text\0");
        table
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }
}

/// One `Elf64_Sym` record.
#[derive(Debug, Clone, Copy)]
struct Symbol {
    name: u32,
    info: u8,
    other: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

impl Symbol {
    fn null() -> Symbol {
        Symbol { name: 0, info: 0, other: 0, shndx: 0, value: 0, size: 0 }
    }
}

/// One `Elf64_Rela` record against `.text`.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub offset: u64,
    pub symbol: u32,
    pub kind: u32,
    pub addend: i64,
}

/// Collects machine code and wraps it into a relocatable ELF64 object.
#[derive(Debug)]
pub struct ElfWriter {
    strtab: StringTable,
    text: Vec<u8>,
    data: Vec<u8>,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
}

impl ElfWriter {
    pub fn new() -> Self {
        ElfWriter {
            strtab: StringTable::with_section_names(),
            text: Vec::new(),
            data: Vec::new(),
            symbols: vec![Symbol::null()],
            relocations: Vec::new(),
        }
    }

    /// Append one encoded instruction word to `.text`.
    pub fn emit(&mut self, word: u32) {
        self.text.extend_from_slice(&word.to_le_bytes());
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// Append bytes to `.data`, returning their offset within the section.
    pub fn add_data(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Add a global symbol whose value is the current end of `.text`.
    pub fn add_symbol_at_end(&mut self, name: &str) {
        let name = self.strtab.add(name);
        self.symbols.push(Symbol {
            name,
            info: (STB_GLOBAL << 4) | STT_NOTYPE,
            other: 0,
            shndx: SECTION_TEXT as u16,
            value: self.text.len() as u64,
            size: 0,
        });
    }

    pub fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    /// Serialize the complete object file.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; EHDR_SIZE];
        let mut layout = [(0u64, 0u64); SECTION_COUNT];

        layout[SECTION_STRTAB] = append_section(&mut out, &self.strtab.bytes, 1);
        layout[SECTION_TEXT] = append_section(&mut out, &self.text, 4);
        let mut rela = Vec::with_capacity(self.relocations.len() * RELA_SIZE);
        for relocation in &self.relocations {
            write_u64(&mut rela, relocation.offset);
            write_u64(&mut rela, (relocation.symbol as u64) << 32 | relocation.kind as u64);
            write_u64(&mut rela, relocation.addend as u64);
        }
        layout[SECTION_RELA_TEXT] = append_section(&mut out, &rela, 8);
        layout[SECTION_DATA] = append_section(&mut out, &self.data, 1);
        let mut symtab = Vec::with_capacity(self.symbols.len() * SYM_SIZE);
        for symbol in &self.symbols {
            write_u32(&mut symtab, symbol.name);
            symtab.push(symbol.info);
            symtab.push(symbol.other);
            write_u16(&mut symtab, symbol.shndx);
            write_u64(&mut symtab, symbol.value);
            write_u64(&mut symtab, symbol.size);
        }
        layout[SECTION_SYMTAB] = append_section(&mut out, &symtab, 8);

        align_to(&mut out, 8);
        let shoff = out.len() as u64;
        self.write_section_headers(&mut out, &layout);
        self.write_file_header(&mut out, shoff);
        out
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    fn write_section_headers(&self, out: &mut Vec<u8>, layout: &[(u64, u64); SECTION_COUNT]) {
        // sh_name, sh_type, sh_flags, sh_link, sh_info, sh_addralign, sh_entsize
        let descriptors: [(u32, u32, u64, u32, u32, u64, u64); SECTION_COUNT] = [
            (0, SHT_NULL, 0, 0, 0, 0, 0),
            (STRTAB_NAME, SHT_STRTAB, 0, 0, 0, 1, 0),
            (TEXT_NAME, SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 0, 0, 4, 0),
            (
                RELA_TEXT_NAME,
                SHT_RELA,
                SHF_INFO_LINK,
                SECTION_SYMTAB as u32,
                SECTION_TEXT as u32,
                8,
                RELA_SIZE as u64,
            ),
            (DATA_NAME, SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 0, 0, 1, 0),
            // sh_info of a symbol table is the index of its first non-local
            // symbol; only the null symbol is local here.
            (SYMTAB_NAME, SHT_SYMTAB, 0, SECTION_STRTAB as u32, 1, 8, SYM_SIZE as u64),
        ];
        for (index, &(name, sh_type, flags, link, info, addralign, entsize)) in
            descriptors.iter().enumerate()
        {
            let (offset, size) = layout[index];
            write_u32(out, name);
            write_u32(out, sh_type);
            write_u64(out, flags);
            write_u64(out, 0); // sh_addr
            write_u64(out, if sh_type == SHT_NULL { 0 } else { offset });
            write_u64(out, size);
            write_u32(out, link);
            write_u32(out, info);
            write_u64(out, addralign);
            write_u64(out, entsize);
        }
    }

    fn write_file_header(&self, out: &mut [u8], shoff: u64) {
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS64;
        out[5] = ELFDATA2LSB;
        out[6] = EV_CURRENT;
        // e_ident bytes 7..16: System V ABI, zero padding.
        out[16..18].copy_from_slice(&ET_REL.to_le_bytes());
        out[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        out[20..24].copy_from_slice(&(EV_CURRENT as u32).to_le_bytes());
        // e_entry and e_phoff stay zero for a relocatable object.
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[48..52].copy_from_slice(&EF_RISCV_FLOAT_ABI_DOUBLE.to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        // e_phentsize and e_phnum stay zero.
        out[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out[60..62].copy_from_slice(&(SECTION_COUNT as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(SECTION_STRTAB as u16).to_le_bytes());
    }
}

impl Default for ElfWriter {
    fn default() -> Self {
        ElfWriter::new()
    }
}

/// Align, append a section body, and return its (offset, size).
fn append_section(out: &mut Vec<u8>, body: &[u8], align: usize) -> (u64, u64) {
    align_to(out, align);
    let offset = out.len() as u64;
    out.extend_from_slice(body);
    (offset, body.len() as u64)
}

fn align_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}
