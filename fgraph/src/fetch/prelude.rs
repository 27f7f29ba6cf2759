//! Per-probe fetch prelude
//!
//! Inserted at the first instruction of a kernel probe program. It evaluates
//! every fetch argument of the probe into the per-CPU `ARG_SCRATCH` record,
//! which the program then drains into the payload ring buffer:
//!
//! ```text
//!     r8 = r1                       save ctx
//!     *(u32 *)(r10 - 4) = 0         key
//!     r2 = r10
//!     r2 += -4
//!     r1 = ARG_SCRATCH ll           map relocation
//!     call bpf_map_lookup_elem
//!     if r0 == 0 goto out
//!     r6 = r0
//!     <fragment for each arg>       dest r6 + 8 + i * 64
//!     *(u64 *)(r6 + 0) = n          arg_count
//! out:
//!     r1 = r8                       restore ctx
//! ```

use fgraph_common::{ARG_COUNT_OFFSET, ARG_DATA_OFFSET, ARG_SLOT_SIZE, MAX_FETCH_ARGS};

use super::bpf::{Insn, HELPER_MAP_LOOKUP_ELEM, R0, R1, R10, R2, R6, R8};
use super::FetchArg;
use crate::domain::FetchError;

/// Top of the scratch area; `r10 - 4` holds the map key
pub const SCRATCH_BASE: i16 = -16;

/// Map the prelude loads into `r1`
pub const SCRATCH_MAP: &str = "ARG_SCRATCH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prelude {
    pub insns: Vec<Insn>,
    /// Index of the `ld_imm64` needing a relocation against [`SCRATCH_MAP`]
    pub map_load: usize,
}

/// Destination offset of argument `index` relative to `r6`
#[must_use]
pub fn arg_slot_offset(index: usize) -> i16 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let slot = (index * ARG_SLOT_SIZE) as i16;
    ARG_DATA_OFFSET + slot
}

/// Build the prelude for a probe's fetch args
///
/// # Errors
/// Returns `TooManyArgs` past the record's capacity
pub fn build(function: &str, args: &[FetchArg]) -> Result<Prelude, FetchError> {
    if args.len() > MAX_FETCH_ARGS {
        return Err(FetchError::TooManyArgs {
            function: function.to_string(),
            count: args.len(),
            max: MAX_FETCH_ARGS,
        });
    }

    let fragments: Vec<Insn> = args
        .iter()
        .enumerate()
        .flat_map(|(i, arg)| arg.compile(SCRATCH_BASE, arg_slot_offset(i)))
        .collect();
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let skip = (fragments.len() + 2) as i16;
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let count = args.len() as i32;

    let mut insns = vec![
        Insn::mov_reg(R8, R1),
        Insn::st_w(R10, -4, 0),
        Insn::mov_reg(R2, R10),
        Insn::add_imm(R2, -4),
    ];
    let map_load = insns.len();
    insns.extend(Insn::ld_imm64(R1));
    insns.push(Insn::call(HELPER_MAP_LOOKUP_ELEM));
    insns.push(Insn::jeq_imm(R0, 0, skip));
    insns.push(Insn::mov_reg(R6, R0));
    insns.extend(fragments);
    insns.push(Insn::st_dw(R6, ARG_COUNT_OFFSET, count));
    insns.push(Insn::mov_reg(R1, R8));

    Ok(Prelude { insns, map_load })
}
