//! Linear x86-64 disassembly of a function body
//!
//! A thin model over `iced-x86`: each decoded instruction keeps its address,
//! its length, a coarse control-flow class and the operands the analyzer
//! inspects. Registers outside the `pt_regs` set are kept as
//! [`Operand::OtherRegister`] so they never compare equal to a frame-pointer
//! or call-target register.
//!
//! Decoding never stops early. A byte sequence that does not decode becomes
//! an [`InstructionClass::Invalid`] instruction of length 1 and the walker
//! resumes at the next byte.

use iced_x86::{Decoder, DecoderOptions, FlowControl, OpKind};

use crate::registers::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    /// Direct near call
    Call,
    /// Call through a register or memory operand
    IndirectCall,
    Return,
    /// Any jump, conditional or not
    Jump,
    Other,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    OtherRegister,
    Memory {
        base: Option<Register>,
        index: Option<Register>,
        displacement: i64,
    },
    Immediate(u64),
    /// Absolute target of a relative branch
    Relative(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub len: usize,
    pub class: InstructionClass,
    pub operands: Vec<Operand>,
}

impl Instruction {
    #[must_use]
    pub fn next_address(&self) -> u64 {
        self.address + self.len as u64
    }

    /// Number of operands that are exactly `reg`
    #[must_use]
    pub fn register_uses(&self, reg: Register) -> usize {
        self.operands.iter().filter(|op| **op == Operand::Register(reg)).count()
    }
}

/// Decode `bytes`, the first of which lives at virtual address `address`
#[must_use]
pub fn decode(bytes: &[u8], address: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
    let mut raw = iced_x86::Instruction::default();
    let mut instructions = Vec::new();

    while decoder.can_decode() {
        let position = decoder.position();
        decoder.decode_out(&mut raw);

        if raw.is_invalid() {
            let next = position + 1;
            instructions.push(Instruction {
                address: address + position as u64,
                len: 1,
                class: InstructionClass::Invalid,
                operands: Vec::new(),
            });
            if next >= bytes.len() || decoder.set_position(next).is_err() {
                break;
            }
            decoder.set_ip(address + next as u64);
            continue;
        }

        instructions.push(Instruction {
            address: raw.ip(),
            len: raw.len(),
            class: classify(&raw),
            operands: operands(&raw),
        });
    }

    instructions
}

fn classify(raw: &iced_x86::Instruction) -> InstructionClass {
    match raw.flow_control() {
        FlowControl::Call => InstructionClass::Call,
        FlowControl::IndirectCall => InstructionClass::IndirectCall,
        FlowControl::Return => InstructionClass::Return,
        FlowControl::UnconditionalBranch
        | FlowControl::ConditionalBranch
        | FlowControl::IndirectBranch => InstructionClass::Jump,
        _ => InstructionClass::Other,
    }
}

#[allow(clippy::cast_possible_wrap)]
fn operands(raw: &iced_x86::Instruction) -> Vec<Operand> {
    (0..raw.op_count())
        .map(|i| match raw.op_kind(i) {
            OpKind::Register => {
                Register::from_iced(raw.op_register(i)).map_or(Operand::OtherRegister, Operand::Register)
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::Relative(raw.near_branch_target())
            }
            OpKind::Memory => Operand::Memory {
                base: Register::from_iced(raw.memory_base()),
                index: Register::from_iced(raw.memory_index()),
                displacement: raw.memory_displacement64() as i64,
            },
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Operand::Immediate(raw.immediate(i)),
            _ => Operand::OtherRegister,
        })
        .collect()
}
