//! Fetch rules to eBPF bytecode
//!
//! Register conventions inside a fragment:
//!
//! - `r8`: the probe's `pt_regs` context
//! - `r10`: frame pointer; intermediate results go to stack slots below
//!   `scratch_base`, 8 bytes each
//! - `r6`: base of the destination record
//! - `r1`-`r3`: clobbered
//!
//! Every rule reads the previous result from the current scratch slot. All
//! but the last write to the next slot down; the last writes to
//! `r6 + dest_offset`.

use super::bpf::{self, Insn, R1, R10, R2, R3, R6, R8};
use super::{FetchArg, FetchRule};

/// Bytes each intermediate result occupies on the stack
const SLOT: i16 = 8;

impl FetchRule {
    /// Emit this rule, reading the previous result at `r10 + src` and
    /// writing to `dst_base + dst_off`
    #[must_use]
    pub fn insns(&self, src: i16, dst_base: u8, dst_off: i16) -> Vec<Insn> {
        match *self {
            Self::ReadRegister(reg) => vec![
                Insn::ldx_dw(R3, R8, reg.pt_regs_offset()),
                Insn::stx_dw(dst_base, R3, dst_off),
            ],
            Self::ReadMemory { offset, size } => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let size = size as i32;
                vec![
                    Insn::ldx_dw(R3, R10, src),
                    Insn::add_imm(R3, offset),
                    Insn::mov_reg(R1, dst_base),
                    Insn::add_imm(R1, i32::from(dst_off)),
                    Insn::mov_imm(R2, size),
                    Insn::call(bpf::HELPER_PROBE_READ_USER),
                ]
            }
        }
    }
}

/// Compile a rule chain
///
/// `scratch_base` must name a free stack slot region growing downwards for
/// the whole fragment; `dest_offset` is relative to `r6`.
#[must_use]
pub fn compile_rules(rules: &[FetchRule], scratch_base: i16, dest_offset: i16) -> Vec<Insn> {
    let Some((last, steps)) = rules.split_last() else {
        return Vec::new();
    };

    let mut vacant = scratch_base;
    let mut insns = Vec::new();
    for rule in steps {
        insns.extend(rule.insns(vacant, R10, vacant - SLOT));
        vacant -= SLOT;
    }
    insns.extend(last.insns(vacant, R6, dest_offset));
    insns
}

impl FetchArg {
    /// Bytecode that leaves this argument's value at `r6 + dest_offset`
    #[must_use]
    pub fn compile(&self, scratch_base: i16, dest_offset: i16) -> Vec<Insn> {
        compile_rules(&self.rules, scratch_base, dest_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Register;

    #[test]
    fn test_register_only() {
        let arg = FetchArg::parse("x", "%rdi:u64").unwrap();
        assert_eq!(
            arg.compile(-16, 8),
            [Insn::ldx_dw(R3, R8, 112), Insn::stx_dw(R6, R3, 8)]
        );
    }

    #[test]
    fn test_chain_walks_scratch_downwards() {
        let arg = FetchArg::parse("x", "+0(+8(%rax)):u32").unwrap();
        let insns = arg.compile(-16, 72);
        assert_eq!(
            insns,
            [
                // rax -> r10-24
                Insn::ldx_dw(R3, R8, 80),
                Insn::stx_dw(R10, R3, -24),
                // *(r10-24 + 8) -> r10-32
                Insn::ldx_dw(R3, R10, -24),
                Insn::add_imm(R3, 8),
                Insn::mov_reg(R1, R10),
                Insn::add_imm(R1, -32),
                Insn::mov_imm(R2, 8),
                Insn::call(112),
                // *(r10-32 + 0), 4 bytes -> r6+72
                Insn::ldx_dw(R3, R10, -32),
                Insn::add_imm(R3, 0),
                Insn::mov_reg(R1, R6),
                Insn::add_imm(R1, 72),
                Insn::mov_imm(R2, 4),
                Insn::call(112),
            ]
        );
    }

    #[test]
    fn test_empty_rules() {
        assert!(compile_rules(&[], -16, 8).is_empty());
        assert_eq!(
            compile_rules(&[FetchRule::ReadRegister(Register::Rsp)], -16, 8),
            [Insn::ldx_dw(R3, R8, 152), Insn::stx_dw(R6, R3, 8)]
        );
    }
}
