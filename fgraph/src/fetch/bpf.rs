//! Minimal eBPF instruction model
//!
//! Just enough of the ISA to emit fetch fragments and to relocate branches
//! when a fragment is inserted into an existing program. Encoding is the
//! little-endian layout used by `bpfel` objects:
//!
//! ```text
//! byte 0     opcode
//! byte 1     src_reg << 4 | dst_reg
//! bytes 2-3  off (i16)
//! bytes 4-7  imm (i32)
//! ```

use std::fmt;

use crate::domain::SpliceError;

pub const INSN_SIZE: usize = 8;

pub const R0: u8 = 0;
pub const R1: u8 = 1;
pub const R2: u8 = 2;
pub const R3: u8 = 3;
pub const R6: u8 = 6;
pub const R8: u8 = 8;
/// Read-only frame pointer
pub const R10: u8 = 10;

pub const HELPER_MAP_LOOKUP_ELEM: i32 = 1;
pub const HELPER_PROBE_READ_USER: i32 = 112;

const CLASS_MASK: u8 = 0x07;
const CLASS_JMP: u8 = 0x05;
const CLASS_JMP32: u8 = 0x06;
const OP_MASK: u8 = 0xf0;
const OP_JA: u8 = 0x00;
const OP_CALL: u8 = 0x80;
const OP_EXIT: u8 = 0x90;
const PSEUDO_CALL: u8 = 1;

const LD_IMM64: u8 = 0x18;
const LDX_DW: u8 = 0x79;
const STX_DW: u8 = 0x7b;
const ST_W: u8 = 0x62;
const ST_DW: u8 = 0x7a;
const ALU64_ADD_K: u8 = 0x07;
const ALU64_MOV_K: u8 = 0xb7;
const ALU64_MOV_X: u8 = 0xbf;
const JEQ_K: u8 = 0x15;
const CALL: u8 = 0x85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Insn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    #[must_use]
    pub const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self { code, dst, src, off, imm }
    }

    /// `dst = *(u64 *)(src + off)`
    #[must_use]
    pub const fn ldx_dw(dst: u8, src: u8, off: i16) -> Self {
        Self::new(LDX_DW, dst, src, off, 0)
    }

    /// `*(u64 *)(dst + off) = src`
    #[must_use]
    pub const fn stx_dw(dst: u8, src: u8, off: i16) -> Self {
        Self::new(STX_DW, dst, src, off, 0)
    }

    /// `*(u32 *)(dst + off) = imm`
    #[must_use]
    pub const fn st_w(dst: u8, off: i16, imm: i32) -> Self {
        Self::new(ST_W, dst, 0, off, imm)
    }

    /// `*(u64 *)(dst + off) = imm`
    #[must_use]
    pub const fn st_dw(dst: u8, off: i16, imm: i32) -> Self {
        Self::new(ST_DW, dst, 0, off, imm)
    }

    /// `dst += imm`
    #[must_use]
    pub const fn add_imm(dst: u8, imm: i32) -> Self {
        Self::new(ALU64_ADD_K, dst, 0, 0, imm)
    }

    /// `dst = imm`
    #[must_use]
    pub const fn mov_imm(dst: u8, imm: i32) -> Self {
        Self::new(ALU64_MOV_K, dst, 0, 0, imm)
    }

    /// `dst = src`
    #[must_use]
    pub const fn mov_reg(dst: u8, src: u8) -> Self {
        Self::new(ALU64_MOV_X, dst, src, 0, 0)
    }

    /// `if dst == imm goto +off`
    #[must_use]
    pub const fn jeq_imm(dst: u8, imm: i32, off: i16) -> Self {
        Self::new(JEQ_K, dst, 0, off, imm)
    }

    /// Call a kernel helper by id
    #[must_use]
    pub const fn call(helper: i32) -> Self {
        Self::new(CALL, 0, 0, 0, helper)
    }

    /// `dst = imm64`; the immediate is filled in by a map relocation
    #[must_use]
    pub const fn ld_imm64(dst: u8) -> [Self; 2] {
        [Self::new(LD_IMM64, dst, 0, 0, 0), Self::new(0, 0, 0, 0, 0)]
    }

    /// First slot of a 16-byte instruction
    #[must_use]
    pub fn is_wide(&self) -> bool {
        self.code == LD_IMM64
    }

    /// Relative target of a branch or local call, in instructions
    ///
    /// Jumps keep it in `off`. Local calls and `gotol` keep it in `imm`.
    #[must_use]
    pub fn branch_offset(&self) -> Option<i64> {
        let op = self.code & OP_MASK;
        match self.code & CLASS_MASK {
            CLASS_JMP if op == OP_CALL => (self.src == PSEUDO_CALL).then_some(i64::from(self.imm)),
            CLASS_JMP if op == OP_EXIT => None,
            CLASS_JMP => Some(i64::from(self.off)),
            CLASS_JMP32 if op == OP_JA => Some(i64::from(self.imm)),
            CLASS_JMP32 => Some(i64::from(self.off)),
            _ => None,
        }
    }

    /// Rewrite the relative target found by [`Insn::branch_offset`]
    ///
    /// Returns `None` if the new offset does not fit the field.
    #[must_use]
    pub fn with_branch_offset(mut self, offset: i64) -> Option<Self> {
        let op = self.code & OP_MASK;
        let class = self.code & CLASS_MASK;
        if (class == CLASS_JMP && op == OP_CALL) || (class == CLASS_JMP32 && op == OP_JA) {
            self.imm = i32::try_from(offset).ok()?;
        } else {
            self.off = i16::try_from(offset).ok()?;
        }
        Some(self)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; INSN_SIZE] {
        let mut out = [0u8; INSN_SIZE];
        out[0] = self.code;
        out[1] = (self.src << 4) | (self.dst & 0x0f);
        out[2..4].copy_from_slice(&self.off.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: [u8; INSN_SIZE]) -> Self {
        Self {
            code: bytes[0],
            dst: bytes[1] & 0x0f,
            src: bytes[1] >> 4,
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x} dst=r{} src=r{} off={} imm={}",
            self.code, self.dst, self.src, self.off, self.imm
        )
    }
}

/// Split section bytes into instructions
///
/// # Errors
/// Returns `Truncated` if the length is not a multiple of 8
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Insn>, SpliceError> {
    if bytes.len() % INSN_SIZE != 0 {
        return Err(SpliceError::Truncated(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(INSN_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; INSN_SIZE];
            raw.copy_from_slice(chunk);
            Insn::decode(raw)
        })
        .collect())
}

#[must_use]
pub fn encode_all(insns: &[Insn]) -> Vec<u8> {
    insns.iter().flat_map(Insn::encode).collect()
}

/// One instruction per line, as stored in golden files
#[must_use]
pub fn listing(insns: &[Insn]) -> String {
    insns.iter().map(|insn| format!("{insn}\n")).collect()
}
