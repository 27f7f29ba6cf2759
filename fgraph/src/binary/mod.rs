//! # Binary Image
//!
//! Opens an x86-64 ELF file and exposes what the analyzer needs: sections,
//! an address-sorted symbol table, DWARF subprogram ranges and raw bytes.
//!
//! ## Addresses and offsets
//!
//! Symbols and debug info speak in link-time virtual addresses. Uprobes are
//! placed by *file offset*. For an address inside a section:
//!
//! ```text
//! file_offset = addr - section.address + section.file_offset
//! ```
//!
//! Relocatable objects (`.o`) have every section at address 0 and symbol
//! values relative to their section, which the same formula handles.
//!
//! ## Caching
//!
//! The symbol table is built when the image is opened. DWARF is only parsed
//! the first time a subprogram range is asked for, behind a `OnceLock`, so
//! several threads may share one image once it is populated.

pub mod dwarf;
pub mod symbols;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::warn;
use object::{Architecture, Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind};

pub use dwarf::SubprogramMap;
pub use symbols::{Symbol, SymbolKind, SymbolTable};

use crate::domain::ImageError;

/// Half-open `[low, high)` address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub low: u64,
    pub high: u64,
}

impl AddressRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.high.saturating_sub(self.low)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// `ET_EXEC`: loaded at its link-time addresses
    Executable,
    /// `ET_DYN`: loaded at a per-process bias
    PositionIndependent,
    /// `ET_REL`
    Relocatable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub index: usize,
    pub name: String,
    pub address: u64,
    pub size: u64,
    /// `(offset, size)` of the section contents in the file, if any
    pub file_range: Option<(u64, u64)>,
    pub executable: bool,
}

impl SectionInfo {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// File offset of `addr`, which must lie inside this section
    #[must_use]
    pub fn file_offset_of(&self, addr: u64) -> Option<u64> {
        let (offset, _) = self.file_range?;
        (addr >= self.address && addr <= self.end()).then(|| addr - self.address + offset)
    }
}

pub struct BinaryImage {
    path: PathBuf,
    data: Vec<u8>,
    kind: ImageKind,
    load_address: u64,
    sections: Vec<SectionInfo>,
    symbols: SymbolTable,
    subprograms: OnceLock<SubprogramMap>,
}

impl BinaryImage {
    /// Read and index an executable from disk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not an object file, or
    /// is not x86-64
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|source| ImageError::Read { path: path.display().to_string(), source })?;
        Self::from_bytes(path, data)
    }

    /// Index an in-memory object file; `path` is only used for messages and
    /// as the probe target
    ///
    /// # Errors
    /// Returns an error if `data` is not an x86-64 object file
    pub fn from_bytes<P: Into<PathBuf>>(path: P, data: Vec<u8>) -> Result<Self, ImageError> {
        let (kind, load_address, sections, symbols) = {
            let file = object::File::parse(&*data)?;
            if file.architecture() != Architecture::X86_64 {
                return Err(ImageError::UnsupportedArchitecture(format!(
                    "{:?}",
                    file.architecture()
                )));
            }

            let kind = match file.kind() {
                ObjectKind::Dynamic => ImageKind::PositionIndependent,
                ObjectKind::Relocatable => ImageKind::Relocatable,
                _ => ImageKind::Executable,
            };
            let load_address = file.segments().map(|s| s.address()).min().unwrap_or(0);

            let sections: Vec<SectionInfo> = file
                .sections()
                .map(|s| SectionInfo {
                    index: s.index().0,
                    name: s.name().unwrap_or_default().to_string(),
                    address: s.address(),
                    size: s.size(),
                    file_range: s.file_range(),
                    executable: s.kind() == SectionKind::Text,
                })
                .collect();

            let mut symbols = collect_symbols(file.symbols(), &sections);
            if symbols.is_empty() {
                symbols = collect_symbols(file.dynamic_symbols(), &sections);
            }

            (kind, load_address, sections, symbols)
        };

        let symbols = SymbolTable::new(symbols, &sections);
        Ok(Self {
            path: path.into(),
            data,
            kind,
            load_address,
            sections,
            symbols,
            subprograms: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Lowest `PT_LOAD` virtual address (0 for relocatable objects)
    #[must_use]
    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[must_use]
    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    #[must_use]
    pub fn section(&self, index: usize) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.index == index)
    }

    /// File contents of a section (`None` for `SHT_NOBITS`)
    #[must_use]
    pub fn section_bytes(&self, section: &SectionInfo) -> Option<&[u8]> {
        let (offset, size) = section.file_range?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        self.data.get(start..end)
    }

    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.sections.iter().any(|s| s.name == ".debug_info")
    }

    /// DWARF subprogram ranges, parsed on first use
    ///
    /// Malformed debug info is logged and treated as absent; callers then
    /// fall back to symbol-table ranges.
    pub fn subprograms(&self) -> &SubprogramMap {
        self.subprograms.get_or_init(|| {
            let loaded = object::File::parse(&*self.data)
                .map_err(ImageError::from)
                .and_then(|file| dwarf::load_subprograms(&file).map_err(ImageError::from));
            loaded.unwrap_or_else(|e| {
                warn!("Ignoring debug info of {}: {e}", self.path.display());
                SubprogramMap::new()
            })
        })
    }
}

fn collect_symbols<'data, 'file, I>(iter: I, sections: &[SectionInfo]) -> Vec<Symbol>
where
    'data: 'file,
    I: Iterator<Item = object::Symbol<'data, 'file>>,
{
    let mut symbols = Vec::new();
    for sym in iter {
        if sym.is_undefined() {
            continue;
        }
        let Ok(name) = sym.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let section = sym.section_index().map(|index| index.0);
        let kind = match sym.kind() {
            object::SymbolKind::Text => SymbolKind::Function,
            object::SymbolKind::Section | object::SymbolKind::File => continue,
            _ => SymbolKind::Other,
        };
        // Non-function symbols only matter when they label code
        if kind == SymbolKind::Other
            && !section
                .and_then(|index| sections.iter().find(|s| s.index == index))
                .is_some_and(|s| s.executable)
        {
            continue;
        }
        symbols.push(Symbol::new(name, sym.address(), sym.size(), kind, section));
    }
    symbols
}
