//! Splice a fetch prelude into one program of the probe object
//!
//! uprobe programs share a section, one symbol each. The prelude goes in
//! front of the program's first instruction. Everything stored at a later
//! byte of the section moves with it: relocations, symbol values and branch
//! offsets. The program symbol itself keeps its value and grows.
//!
//! `.BTF.ext` carries per-instruction line and function info that would no
//! longer line up, so it is dropped along with its relocations.

use std::collections::HashSet;

use log::debug;
use object::build::elf::{Builder, Relocation, SectionData};

use crate::domain::BackendError;
use crate::fetch::bpf::{self, INSN_SIZE};
use crate::fetch::prelude::{Prelude, SCRATCH_MAP};
use crate::fetch::splice;

/// `R_BPF_64_64`: 64-bit immediate of an `ld_imm64`
const R_BPF_64_64: u32 = 1;

const BTF_EXT: &[u8] = b".BTF.ext";

fn rewrite_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::ObjectRewrite(e.to_string())
}

/// Return a copy of `object` with `prelude` inserted into `program`
///
/// # Errors
/// Fails if the object cannot be parsed, the program or the scratch map is
/// missing, or the program section has no relocation table
#[allow(clippy::cast_possible_truncation)]
pub fn patch_program(object: &[u8], program: &str, prelude: &Prelude) -> Result<Vec<u8>, BackendError> {
    let mut builder = Builder::read(object).map_err(rewrite_error)?;

    let (section_id, start) = builder
        .symbols
        .iter()
        .find(|sym| &*sym.name == program.as_bytes())
        .and_then(|sym| Some((sym.section?, sym.st_value)))
        .ok_or_else(|| BackendError::NotFound(program.to_string()))?;
    let scratch = builder
        .symbols
        .iter()
        .find(|sym| &*sym.name == SCRATCH_MAP.as_bytes())
        .map(|sym| sym.id())
        .ok_or_else(|| BackendError::NotFound(SCRATCH_MAP.to_string()))?;

    let at = start as usize / INSN_SIZE;
    let at_byte = start;

    let relocated: HashSet<usize> = builder
        .sections
        .iter()
        .find_map(|s| match &s.data {
            SectionData::Relocation(relocs) if s.sh_info_section == Some(section_id) => Some(relocs),
            _ => None,
        })
        .ok_or_else(|| BackendError::ObjectRewrite(format!("no relocations for {program}")))?
        .iter()
        .map(|r| r.r_offset as usize / INSN_SIZE)
        .collect();

    let section = builder.sections.get_mut(section_id);
    let SectionData::Data(bytes) = &section.data else {
        return Err(BackendError::ObjectRewrite(format!("{program} is not in a code section")));
    };
    let host = bpf::decode_all(bytes)?;
    let (code, delta) = splice::splice_with(&host, at, &prelude.insns, |i| relocated.contains(&i))?;
    let grown = (delta * INSN_SIZE) as u64;
    let code = bpf::encode_all(&code);
    section.sh_size = code.len() as u64;
    section.data = SectionData::Data(code.into());

    if let Some(SectionData::Relocation(relocs)) = builder
        .sections
        .iter_mut()
        .find(|s| s.sh_info_section == Some(section_id) && matches!(s.data, SectionData::Relocation(_)))
        .map(|s| &mut s.data)
    {
        for reloc in relocs.iter_mut() {
            if reloc.r_offset >= at_byte {
                reloc.r_offset += grown;
            }
        }
        relocs.push(Relocation {
            r_offset: at_byte + (prelude.map_load * INSN_SIZE) as u64,
            symbol: Some(scratch),
            r_type: R_BPF_64_64,
            r_addend: 0,
        });
    }

    for sym in builder.symbols.iter_mut() {
        if sym.section != Some(section_id) {
            continue;
        }
        if sym.st_value > at_byte {
            sym.st_value += grown;
        } else if sym.st_value == at_byte && &*sym.name == program.as_bytes() {
            sym.st_size += grown;
        }
    }

    let btf_ext: Vec<_> = builder
        .sections
        .iter()
        .filter(|s| &*s.name == BTF_EXT)
        .map(|s| s.id())
        .collect();
    for section in builder.sections.iter_mut() {
        if btf_ext.contains(&section.id()) || section.sh_info_section.is_some_and(|id| btf_ext.contains(&id)) {
            section.delete = true;
        }
    }

    debug!("{program}: spliced {delta} instructions at byte 0x{at_byte:x}");

    let mut out = Vec::new();
    builder.write(&mut out).map_err(rewrite_error)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::bpf::{Insn, R0, R1};
    use crate::fetch::{prelude, FetchArg};
    use object::write::{self, SectionKind, Symbol, SymbolFlags, SymbolKind, SymbolScope, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, Object, ObjectSection, ObjectSymbol, RelocationTarget};

    fn exit() -> Insn {
        Insn::new(0x95, 0, 0, 0, 0)
    }

    /// `other` at 0 (2 insns), `ent` at 16 loading `EVENTS`
    fn probe_object() -> Vec<u8> {
        let mut obj = write::Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
        let maps = obj.add_section(Vec::new(), b"maps".to_vec(), SectionKind::Data);
        obj.append_section_data(maps, &[0u8; 40], 8);

        let mut code = vec![Insn::mov_imm(R0, 0), exit()];
        code.extend(Insn::ld_imm64(R1));
        code.extend([Insn::mov_imm(R0, 0), exit()]);
        let text = obj.add_section(Vec::new(), b"uprobe".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &bpf::encode_all(&code), 8);

        let mut symbol = |name: &str, value: u64, size: u64, kind: SymbolKind, section: write::SectionId| {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size,
                kind,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            })
        };
        symbol("other", 0, 16, SymbolKind::Text, text);
        symbol("ent", 16, 32, SymbolKind::Text, text);
        let events = symbol("EVENTS", 0, 20, SymbolKind::Data, maps);
        symbol("ARG_SCRATCH", 20, 20, SymbolKind::Data, maps);

        obj.add_relocation(
            text,
            write::Relocation {
                offset: 16,
                symbol: events,
                addend: 0,
                flags: object::RelocationFlags::Elf { r_type: R_BPF_64_64 },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn test_patch_moves_relocations_and_grows_program() {
        let args = [FetchArg::parse("x", "%rdi:u64").unwrap()];
        let prelude = prelude::build("ent", &args).unwrap();
        let grown = (prelude.insns.len() * INSN_SIZE) as u64;

        let patched = patch_program(&probe_object(), "ent", &prelude).unwrap();
        let file = object::File::parse(&*patched).unwrap();

        let section = file.section_by_name("uprobe").unwrap();
        let code = bpf::decode_all(section.data().unwrap()).unwrap();
        assert_eq!(code.len(), 6 + prelude.insns.len());
        assert_eq!(&code[2..2 + prelude.insns.len()], prelude.insns.as_slice());
        assert_eq!(code[0], Insn::mov_imm(R0, 0));

        let ent = file.symbols().find(|s| s.name() == Ok("ent")).unwrap();
        assert_eq!(ent.address(), 16);
        assert_eq!(ent.size(), 32 + grown);
        let other = file.symbols().find(|s| s.name() == Ok("other")).unwrap();
        assert_eq!(other.size(), 16);

        let mut relocs: Vec<(u64, String)> = section
            .relocations()
            .map(|(offset, reloc)| {
                let RelocationTarget::Symbol(index) = reloc.target() else {
                    panic!("unexpected target");
                };
                (offset, file.symbol_by_index(index).unwrap().name().unwrap().to_string())
            })
            .collect();
        relocs.sort();
        assert_eq!(
            relocs,
            [
                (16 + (prelude.map_load * INSN_SIZE) as u64, "ARG_SCRATCH".to_string()),
                (16 + grown, "EVENTS".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_program() {
        let prelude = prelude::build("nope", &[]).unwrap();
        assert!(matches!(
            patch_program(&probe_object(), "nope", &prelude),
            Err(BackendError::NotFound(name)) if name == "nope"
        ));
    }
}
