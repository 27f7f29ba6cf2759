//! Address-sorted symbol table
//!
//! Built once per image. Lookups by name go through a hash index, lookups by
//! address are a binary search for the greatest symbol value not above the
//! query. Symbols sharing a value (aliases) are kept adjacent so an address
//! lookup can return all of them.

use std::collections::HashMap;

use rustc_demangle::demangle;

use super::SectionInfo;
use crate::domain::ResolutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Name as stored in the symbol table
    pub name: String,
    /// Human readable form (Rust and C++ names demangled, others unchanged)
    pub display_name: String,
    pub value: u64,
    pub size: u64,
    pub kind: SymbolKind,
    /// Index of the section holding the symbol
    pub section: Option<usize>,
}

impl Symbol {
    #[must_use]
    pub fn new(name: &str, value: u64, size: u64, kind: SymbolKind, section: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            display_name: format!("{:#}", demangle(name)),
            value,
            size,
            kind,
            section,
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.value.saturating_add(self.size)
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
}

impl SymbolTable {
    /// Sort `symbols` by address and fill in missing sizes
    ///
    /// A symbol without an explicit size extends to the next symbol with a
    /// higher address, or to the end of its section, whichever is closer.
    #[must_use]
    pub fn new(mut symbols: Vec<Symbol>, sections: &[SectionInfo]) -> Self {
        symbols.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.name.cmp(&b.name)));

        for i in 0..symbols.len() {
            if symbols[i].size != 0 {
                continue;
            }
            let value = symbols[i].value;
            let next = symbols[i + 1..].iter().map(|s| s.value).find(|&v| v > value);
            let section_end = symbols[i]
                .section
                .and_then(|index| sections.iter().find(|s| s.index == index))
                .map(SectionInfo::end)
                .filter(|&end| end > value);
            let end = match (next, section_end) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => value,
            };
            symbols[i].size = end - value;
        }

        let mut by_name = HashMap::with_capacity(symbols.len());
        for (index, symbol) in symbols.iter().enumerate() {
            by_name.entry(symbol.name.clone()).or_insert(index);
        }

        Self { symbols, by_name }
    }

    /// Look a symbol up by its exact table name
    ///
    /// # Errors
    /// Returns `SymbolNotFound` if no symbol carries that name
    pub fn resolve_symbol(&self, name: &str) -> Result<&Symbol, ResolutionError> {
        self.by_name
            .get(name)
            .map(|&index| &self.symbols[index])
            .ok_or_else(|| ResolutionError::SymbolNotFound(name.to_string()))
    }

    /// Find the symbols covering `addr` and the byte offset into them
    ///
    /// Returns every symbol sharing the closest value at or below `addr`.
    ///
    /// # Errors
    /// Returns `AddressNotFound` for address 0 or an address below every symbol
    pub fn resolve_address(&self, addr: u64) -> Result<(&[Symbol], u64), ResolutionError> {
        if addr == 0 {
            return Err(ResolutionError::AddressNotFound(addr));
        }
        let upper = self.symbols.partition_point(|s| s.value <= addr);
        if upper == 0 {
            return Err(ResolutionError::AddressNotFound(addr));
        }
        let value = self.symbols[upper - 1].value;
        let lower = self.symbols[..upper].partition_point(|s| s.value < value);
        Ok((&self.symbols[lower..upper], addr - value))
    }

    /// Function symbols in address order
    pub fn functions(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| s.kind == SymbolKind::Function)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
