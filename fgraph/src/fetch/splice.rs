//! Insert a bytecode fragment into an existing instruction stream
//!
//! Pure function over instruction lists. Every instruction at or after the
//! insertion point moves down by the fragment length, so relative branches
//! that cross the insertion point are rewritten:
//!
//! - from before `at` to a target at or after `at`: offset grows by delta
//! - from at or after `at` to a target before `at`: offset shrinks by delta
//!
//! A branch landing exactly on `at` keeps landing on the original
//! instruction, after the fragment. Branches inside the fragment are relative
//! to the fragment and untouched.

use super::bpf::Insn;
use crate::domain::SpliceError;

/// Insert `fragment` before `host[at]`, returning the new stream and the
/// number of inserted instructions
///
/// # Errors
/// Fails if `at` is out of range, splits an `ld_imm64`, or a rewritten
/// branch no longer fits its offset field
pub fn splice(host: &[Insn], at: usize, fragment: &[Insn]) -> Result<(Vec<Insn>, usize), SpliceError> {
    splice_with(host, at, fragment, |_| false)
}

/// Like [`splice`], leaving the branches at indices where `fixed` holds
/// untouched (calls the loader resolves through a relocation)
///
/// # Errors
/// See [`splice`]
pub fn splice_with<F>(
    host: &[Insn],
    at: usize,
    fragment: &[Insn],
    fixed: F,
) -> Result<(Vec<Insn>, usize), SpliceError>
where
    F: Fn(usize) -> bool,
{
    if at > host.len() {
        return Err(SpliceError::OutOfBounds { at, len: host.len() });
    }

    let delta = fragment.len();
    let mut out = Vec::with_capacity(host.len() + delta);
    let mut i = 0;
    while i < host.len() {
        if i == at {
            out.extend_from_slice(fragment);
        }

        let insn = host[i];
        let adjusted = match insn.branch_offset() {
            Some(rel) if !fixed(i) => {
                #[allow(clippy::cast_possible_wrap)]
                let (index, at, delta) = (i as i64, at as i64, delta as i64);
                let target = index + 1 + rel;
                let new_rel = if index < at && target >= at {
                    rel + delta
                } else if index >= at && target < at {
                    rel - delta
                } else {
                    rel
                };
                insn.with_branch_offset(new_rel)
                    .ok_or(SpliceError::OffsetOverflow { index: i })?
            }
            _ => insn,
        };
        out.push(adjusted);

        if insn.is_wide() {
            if at == i + 1 {
                return Err(SpliceError::SplitsWideInstruction { at });
            }
            if let Some(&second) = host.get(i + 1) {
                out.push(second);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    if at == host.len() {
        out.extend_from_slice(fragment);
    }

    Ok((out, delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::bpf::{R0, R1, R2};

    fn nop(n: i32) -> Insn {
        Insn::mov_imm(R2, n)
    }

    fn exit() -> Insn {
        Insn::new(0x95, 0, 0, 0, 0)
    }

    #[test]
    fn test_forward_branch_across_insertion_grows() {
        // 0: if r0 == 0 goto +2 (-> 3)
        let host = [Insn::jeq_imm(R0, 0, 2), nop(1), nop(2), exit()];
        let (out, delta) = splice(&host, 2, &[nop(10), nop(11)]).unwrap();
        assert_eq!(delta, 2);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].off, 4);
        assert_eq!(out[5], exit());
    }

    #[test]
    fn test_backward_branch_across_insertion_shrinks() {
        // 3: goto -4 (-> 0)
        let host = [nop(0), nop(1), nop(2), Insn::new(0x05, 0, 0, -4, 0), exit()];
        let (out, _) = splice(&host, 1, &[nop(10)]).unwrap();
        assert_eq!(out[4].off, -5);
        assert_eq!(out[0], nop(0));
        assert_eq!(out[1], nop(10));
    }

    #[test]
    fn test_branches_on_one_side_untouched() {
        let host = [Insn::jeq_imm(R0, 0, 0), nop(1), nop(2), Insn::jeq_imm(R0, 1, -1), exit()];
        let (out, _) = splice(&host, 2, &[nop(10)]).unwrap();
        assert_eq!(out[0].off, 0);
        assert_eq!(out[4].off, -1);
    }

    #[test]
    fn test_insert_at_start_and_end() {
        let host = [nop(1), exit()];
        let (out, _) = splice(&host, 0, &[nop(9)]).unwrap();
        assert_eq!(out, [nop(9), nop(1), exit()]);
        let (out, _) = splice(&host, 2, &[nop(9)]).unwrap();
        assert_eq!(out, [nop(1), exit(), nop(9)]);
    }

    #[test]
    fn test_wide_instruction_is_not_split() {
        let [lo, hi] = Insn::ld_imm64(R1);
        let host = [lo, hi, exit()];
        assert_eq!(
            splice(&host, 1, &[nop(0)]),
            Err(SpliceError::SplitsWideInstruction { at: 1 })
        );
        let (out, _) = splice(&host, 2, &[nop(0)]).unwrap();
        assert_eq!(out, [lo, hi, nop(0), exit()]);
    }

    #[test]
    fn test_out_of_bounds() {
        assert_eq!(
            splice(&[exit()], 2, &[]),
            Err(SpliceError::OutOfBounds { at: 2, len: 1 })
        );
    }

    #[test]
    fn test_overflow() {
        let host = [Insn::jeq_imm(R0, 0, i16::MAX), exit()];
        assert_eq!(
            splice(&host, 1, &[nop(0)]),
            Err(SpliceError::OffsetOverflow { index: 0 })
        );
    }

    #[test]
    fn test_fixed_calls_untouched() {
        // local call to 0 from 2, relocated by the loader
        let call = Insn::new(0x85, 0, 1, 0, -3);
        let host = [nop(0), nop(1), call, exit()];
        let (out, _) = splice_with(&host, 1, &[nop(9)], |i| i == 2).unwrap();
        assert_eq!(out[3].imm, -3);
        let (out, _) = splice(&host, 1, &[nop(9)]).unwrap();
        assert_eq!(out[3].imm, -4);
    }
}
