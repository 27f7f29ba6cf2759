//! # Binary Analyzer
//!
//! Static analysis of the target image: function ranges, safe probe points and
//! call-graph discovery.
//!
//! ## Probe points
//!
//! - **Entry**: the first instruction boundary after the function has linked
//!   its frame (`push rbp; mov rbp, rsp`). From there `rbp+8` holds the return
//!   address, so the kernel side can read the caller.
//! - **Return**: every `ret` in the body.
//!
//! ## Caching
//!
//! Decoded function bodies are memoized per analyzer. The cache sits behind a
//! `RwLock`, so an `Analyzer` can be shared across threads once built.

pub mod functree;
pub mod probes;
pub mod wildcard;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

pub use functree::FuncTree;
pub use probes::{build_probes, Probe, ProbeRequest};

use crate::binary::{AddressRange, BinaryImage, SectionInfo, Symbol, SymbolKind};
use crate::disasm::{self, Instruction, InstructionClass, Operand};
use crate::domain::{ImageError, ResolutionError};
use crate::registers::{Register, FRAME_POINTER};

/// A decoded function body
#[derive(Debug)]
pub struct FunctionCode {
    pub instructions: Vec<Instruction>,
    /// Link-time address of the first instruction
    pub address: u64,
    /// File offset of the first instruction
    pub file_offset: u64,
}

impl FunctionCode {
    /// File offset of a link-time address inside this function
    #[must_use]
    pub fn file_offset_of(&self, address: u64) -> u64 {
        self.file_offset + (address - self.address)
    }
}

/// Callees of one function
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CalledFunctions {
    /// Targets of direct calls landing on a symbol start, sorted and unique
    pub direct: Vec<String>,
    /// Register-indirect call sites by file offset
    pub indirect: BTreeMap<u64, Register>,
}

pub struct Analyzer {
    image: BinaryImage,
    code: RwLock<HashMap<String, Arc<FunctionCode>>>,
}

impl Analyzer {
    #[must_use]
    pub fn new(image: BinaryImage) -> Self {
        Self { image, code: RwLock::new(HashMap::new()) }
    }

    /// Open and index `path`
    ///
    /// # Errors
    /// Returns an error if the file is not a readable x86-64 object
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        BinaryImage::open(path).map(Self::new)
    }

    #[must_use]
    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    /// # Errors
    /// Returns `SymbolNotFound` if no symbol carries `name`
    pub fn resolve_symbol(&self, name: &str) -> Result<&Symbol, ResolutionError> {
        self.image.symbols().resolve_symbol(name)
    }

    /// # Errors
    /// Returns `AddressNotFound` for 0 or an address below every symbol
    pub fn resolve_address(&self, addr: u64) -> Result<(&[Symbol], u64), ResolutionError> {
        self.image.symbols().resolve_address(addr)
    }

    /// `symbol+offset` for a link-time address, or the bare hex address
    #[must_use]
    pub fn describe_address(&self, addr: u64) -> String {
        match self.resolve_address(addr) {
            Ok((symbols, offset)) => match preferred(symbols) {
                Some(symbol) => format!("{}+{offset}", symbol.display_name),
                None => format!("0x{addr:x}"),
            },
            Err(_) => format!("0x{addr:x}"),
        }
    }

    /// Address range of a function
    ///
    /// A DWARF subprogram range is used when exactly one range under that
    /// name starts at the symbol's address. Otherwise the symbol table range
    /// is used.
    ///
    /// # Errors
    /// Returns an error if the symbol is unknown or its range is empty
    pub fn function_range(&self, name: &str) -> Result<AddressRange, ResolutionError> {
        let symbol = self.resolve_symbol(name)?;

        if let Some(ranges) = self.image.subprograms().get(name) {
            let highs: BTreeSet<u64> = ranges
                .iter()
                .filter(|r| r.low == symbol.value && !r.is_empty())
                .map(|r| r.high)
                .collect();
            if let (1, Some(&high)) = (highs.len(), highs.first()) {
                return Ok(AddressRange { low: symbol.value, high });
            }
            debug!("{name}: debug info range ambiguous, using symbol table");
        }

        let range = AddressRange { low: symbol.value, high: symbol.end() };
        if range.is_empty() {
            return Err(ResolutionError::InvalidRange {
                name: name.to_string(),
                low: range.low,
                high: range.high,
            });
        }
        Ok(range)
    }

    /// Decode the body of `name`
    ///
    /// # Errors
    /// Returns an error if the function's bytes cannot be located in the file
    pub fn function_instructions(&self, name: &str) -> Result<Arc<FunctionCode>, ResolutionError> {
        if let Some(code) = self.code.read().get(name) {
            return Ok(Arc::clone(code));
        }

        let symbol = self.resolve_symbol(name)?;
        let range = self.function_range(name)?;
        let invalid = || ResolutionError::InvalidRange {
            name: name.to_string(),
            low: range.low,
            high: range.high,
        };

        let section = self.section_of(symbol, range.low).ok_or_else(invalid)?;
        let file_offset = section.file_offset_of(range.low).ok_or_else(invalid)?;
        let bytes = self.image.section_bytes(section).ok_or_else(invalid)?;
        let start = usize::try_from(range.low - section.address).map_err(|_| invalid())?;
        let len = usize::try_from(range.len()).map_err(|_| invalid())?;
        let end = start.saturating_add(len).min(bytes.len());
        let body = bytes.get(start..end).ok_or_else(invalid)?;

        let code = Arc::new(FunctionCode {
            instructions: disasm::decode(body, range.low),
            address: range.low,
            file_offset,
        });

        let mut cache = self.code.write();
        Ok(Arc::clone(cache.entry(name.to_string()).or_insert(code)))
    }

    /// File offset right after the frame link is established
    ///
    /// # Errors
    /// Returns `FrameLinkNotFound` if the frame pointer is referenced fewer
    /// than twice
    pub fn prologue_complete_offset(&self, name: &str) -> Result<u64, ResolutionError> {
        let code = self.function_instructions(name)?;
        prologue_complete(&code.instructions)
            .map(|addr| code.file_offset_of(addr))
            .ok_or_else(|| ResolutionError::FrameLinkNotFound(name.to_string()))
    }

    /// File offsets of every return instruction, in program order
    ///
    /// # Errors
    /// Returns `ReturnNotFound` if the body has no return
    pub fn return_offsets(&self, name: &str) -> Result<Vec<u64>, ResolutionError> {
        let code = self.function_instructions(name)?;
        let offsets: Vec<u64> = code
            .instructions
            .iter()
            .filter(|insn| insn.class == InstructionClass::Return)
            .map(|insn| code.file_offset_of(insn.address))
            .collect();
        if offsets.is_empty() {
            return Err(ResolutionError::ReturnNotFound(name.to_string()));
        }
        Ok(offsets)
    }

    /// Direct callees and register-indirect call sites of `name`
    ///
    /// A direct call into the middle of a function is not a call boundary
    /// and is skipped.
    ///
    /// # Errors
    /// Returns an error if the function cannot be decoded
    pub fn called_functions(&self, name: &str) -> Result<CalledFunctions, ResolutionError> {
        let code = self.function_instructions(name)?;
        let mut direct = BTreeSet::new();
        let mut indirect = BTreeMap::new();

        for insn in &code.instructions {
            match (insn.class, insn.operands.first()) {
                (InstructionClass::Call, Some(Operand::Relative(target))) => {
                    if let Ok((symbols, 0)) = self.resolve_address(*target) {
                        if let Some(symbol) = preferred(symbols) {
                            direct.insert(symbol.name.clone());
                        }
                    }
                }
                (InstructionClass::IndirectCall, Some(Operand::Register(reg))) => {
                    indirect.insert(code.file_offset_of(insn.address), *reg);
                }
                _ => {}
            }
        }

        Ok(CalledFunctions { direct: direct.into_iter().collect(), indirect })
    }

    /// Build one call tree per function matching `roots`
    ///
    /// Functions are visited once across the whole forest; later sightings
    /// are marked pruned. Functions matching `excludes` are listed with an
    /// `Excluded` error and never expanded. Children are discovered while the
    /// depth is below `max_depth`, so 0 yields bare roots.
    #[must_use]
    pub fn call_graph(&self, roots: &[String], excludes: &[String], max_depth: usize) -> Vec<FuncTree> {
        let mut matched: Vec<&Symbol> = self
            .image
            .symbols()
            .functions()
            .filter(|s| {
                wildcard::matches_any(roots, &s.name) || wildcard::matches_any(roots, &s.display_name)
            })
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        matched.dedup_by(|a, b| a.name == b.name);

        let root_names: HashSet<&str> = matched.iter().map(|s| s.name.as_str()).collect();
        let mut walk = GraphWalk { excludes, max_depth, roots: &root_names, visited: HashSet::new() };

        matched.iter().map(|symbol| self.expand(&symbol.name, 0, &mut walk)).collect()
    }

    fn expand(&self, name: &str, depth: usize, walk: &mut GraphWalk<'_>) -> FuncTree {
        let display = self
            .resolve_symbol(name)
            .map_or_else(|_| name.to_string(), |s| s.display_name.clone());
        let mut node = FuncTree::new(name, &display);
        node.root = walk.roots.contains(name);

        if wildcard::matches_any(walk.excludes, name) || wildcard::matches_any(walk.excludes, &display) {
            node.error = Some(ResolutionError::Excluded);
            return node;
        }
        if !walk.visited.insert(name.to_string()) {
            node.pruned = true;
            return node;
        }

        let callees = match self.fill(&mut node) {
            Ok(callees) => callees,
            Err(err) => {
                warn!("{display}: {err}");
                node.error = Some(err);
                return node;
            }
        };

        if depth < walk.max_depth {
            for callee in &callees {
                let child = self.expand(callee, depth + 1, walk);
                node.children.push(child);
            }
        }
        node
    }

    fn fill(&self, node: &mut FuncTree) -> Result<Vec<String>, ResolutionError> {
        let code = self.function_instructions(&node.name)?;
        node.address = code.address;
        node.file_offset = code.file_offset;
        node.entry_offset = self.prologue_complete_offset(&node.name)?;
        node.return_offsets = self.return_offsets(&node.name)?;
        let calls = self.called_functions(&node.name)?;
        node.indirect_calls = calls.indirect;
        Ok(calls.direct)
    }

    fn section_of(&self, symbol: &Symbol, addr: u64) -> Option<&SectionInfo> {
        symbol.section.and_then(|index| self.image.section(index)).or_else(|| {
            self.image
                .sections()
                .iter()
                .find(|s| s.executable && s.address <= addr && addr < s.end())
        })
    }
}

struct GraphWalk<'a> {
    excludes: &'a [String],
    max_depth: usize,
    roots: &'a HashSet<&'a str>,
    visited: HashSet<String>,
}

/// Address right after the instruction holding the second frame-pointer
/// reference
#[must_use]
pub fn prologue_complete(instructions: &[Instruction]) -> Option<u64> {
    let mut seen = 0;
    for insn in instructions {
        seen += insn.register_uses(FRAME_POINTER);
        if seen >= 2 {
            return Some(insn.next_address());
        }
    }
    None
}

/// Pick the symbol to name an address by when several share it
fn preferred(symbols: &[Symbol]) -> Option<&Symbol> {
    symbols
        .iter()
        .find(|s| s.kind == SymbolKind::Function)
        .or_else(|| symbols.first())
}
