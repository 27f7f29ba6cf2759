//! x86-64 register naming shared by the disassembler and the fetch compiler
//!
//! The register set is exactly the kernel's `struct pt_regs` layout on x86-64,
//! since a fetch rule can only read what a uprobe handler sees in its context:
//!
//! ```c
//! struct pt_regs {
//!     unsigned long r15;      // offset 0
//!     unsigned long r14;      // offset 8
//!     unsigned long r13;      // offset 16
//!     unsigned long r12;      // offset 24
//!     unsigned long bp;       // offset 32
//!     unsigned long bx;       // offset 40
//!     unsigned long r11;      // offset 48
//!     unsigned long r10;      // offset 56
//!     unsigned long r9;       // offset 64
//!     unsigned long r8;       // offset 72
//!     unsigned long ax;       // offset 80
//!     unsigned long cx;       // offset 88
//!     unsigned long dx;       // offset 96
//!     unsigned long si;       // offset 104
//!     unsigned long di;       // offset 112
//!     unsigned long orig_ax;  // offset 120
//!     unsigned long ip;       // offset 128
//!     unsigned long cs;       // offset 136
//!     unsigned long flags;    // offset 144
//!     unsigned long sp;       // offset 152
//!     unsigned long ss;       // offset 160
//! };
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
}

/// The frame-pointer register
pub const FRAME_POINTER: Register = Register::Rbp;

const ALL: [Register; 21] = [
    Register::R15,
    Register::R14,
    Register::R13,
    Register::R12,
    Register::Rbp,
    Register::Rbx,
    Register::R11,
    Register::R10,
    Register::R9,
    Register::R8,
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::OrigRax,
    Register::Rip,
    Register::Cs,
    Register::Eflags,
    Register::Rsp,
    Register::Ss,
];

impl Register {
    /// Look a register up by its lowercase name (`"rdi"`, `"orig_rax"`, ...)
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL.into_iter().find(|reg| reg.name() == name)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::R15 => "r15",
            Self::R14 => "r14",
            Self::R13 => "r13",
            Self::R12 => "r12",
            Self::Rbp => "rbp",
            Self::Rbx => "rbx",
            Self::R11 => "r11",
            Self::R10 => "r10",
            Self::R9 => "r9",
            Self::R8 => "r8",
            Self::Rax => "rax",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::OrigRax => "orig_rax",
            Self::Rip => "rip",
            Self::Cs => "cs",
            Self::Eflags => "eflags",
            Self::Rsp => "rsp",
            Self::Ss => "ss",
        }
    }

    /// Byte offset of this register inside `struct pt_regs`
    #[must_use]
    pub fn pt_regs_offset(self) -> i16 {
        // The enum is declared in pt_regs order, one u64 per field
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let index = self as i16;
        index * 8
    }

    /// Map a decoded operand register onto the pt_regs set
    ///
    /// Only full-width registers map; `eax` or `bpl` are different operands
    /// as far as frame-link detection and call-target capture are concerned.
    #[must_use]
    pub fn from_iced(reg: iced_x86::Register) -> Option<Self> {
        use iced_x86::Register as R;
        let mapped = match reg {
            R::R15 => Self::R15,
            R::R14 => Self::R14,
            R::R13 => Self::R13,
            R::R12 => Self::R12,
            R::RBP => Self::Rbp,
            R::RBX => Self::Rbx,
            R::R11 => Self::R11,
            R::R10 => Self::R10,
            R::R9 => Self::R9,
            R::R8 => Self::R8,
            R::RAX => Self::Rax,
            R::RCX => Self::Rcx,
            R::RDX => Self::Rdx,
            R::RSI => Self::Rsi,
            R::RDI => Self::Rdi,
            R::RIP => Self::Rip,
            R::CS => Self::Cs,
            R::RSP => Self::Rsp,
            R::SS => Self::Ss,
            _ => return None,
        };
        Some(mapped)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
