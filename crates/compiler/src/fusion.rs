//! Fuses a constant/immediate load into the single arithmetic or comparison
//! instruction that consumes it, eliminating the separate `LoadI`/`LoadK`.
//!
//! Runs after [`crate::peephole::run`] has compacted the stream, so indices
//! are stable and adjacent pairs are truly adjacent in the final code.
//!
//! Arithmetic (`ADD`/`SUB`/`MUL`) lays its operands out as `A=dst, B=left,
//! C=right`, so fusing replaces `C` with the immediate or constant index.
//! Comparisons have no destination register — `xr-compiler` emits them as
//! `A=left, B=right, C=k` (the branch-flag, always 0 since every branch site
//! jumps on false uniformly) — so fusing one instead replaces `B` with the
//! immediate/index and carries `k` into the fused instruction's own `B` slot,
//! giving `LTI A=left, B=k, C=imm` (or `EqK A=left, B=k, C=const_idx`).
//!
//! `LoadI R_k, imm` followed by a consuming `ADD`/`SUB`/`MUL`/`LT`/`LE`/`GT`/
//! `GE` fuses into that opcode's `I` variant. `LoadK R_k, K(idx)` fuses the
//! same way when the constant happens to be a small integer (no separate
//! `LTK`/`LEK`/... opcodes exist, so those consumers only ever fuse through
//! the `I` form); `ADD`/`SUB`/`MUL`/`EQ` additionally fuse any `LoadK` whose
//! pool index fits a byte into the `K` variant, embedding the index directly
//! and skipping the register load entirely.

use xr_core::opcode::{Instruction, OpCode};

#[derive(Debug, Default, Clone, Copy)]
pub struct FusionStats {
    pub arithmetic_fused: usize,
    pub comparisons_fused: usize,
    /// Adjacent `Test`+`Jmp` pairs seen; recognized but not currently
    /// rewritten into a single instruction.
    pub test_jmp_candidates: usize,
}

/// What a fusable load contributes. A `LoadK` of a small integer constant
/// offers both forms: the immediate (for consumers with an `I` variant) and
/// the constant index (for `EQ`, which has no `EqI` and only ever fuses
/// through `EqK`).
struct FusableOperand {
    immediate: Option<i8>,
    const_index: Option<u8>,
}

fn fusable_operand(load: Instruction, constants: &[Option<i64>]) -> Option<FusableOperand> {
    match load.opcode() {
        OpCode::LoadI => {
            let imm = load.sbx();
            if (-128..=127).contains(&imm) {
                Some(FusableOperand {
                    immediate: Some(imm as i8),
                    const_index: None,
                })
            } else {
                None
            }
        }
        OpCode::LoadK => {
            let idx = load.bx();
            let immediate = constants
                .get(idx as usize)
                .copied()
                .flatten()
                .filter(|value| (-128..=127).contains(value))
                .map(|value| value as i8);
            let const_index = u8::try_from(idx).ok();
            if immediate.is_none() && const_index.is_none() {
                None
            } else {
                Some(FusableOperand { immediate, const_index })
            }
        }
        _ => None,
    }
}

/// Runs the fusion pass. `constants` gives, for each constant-pool slot, the
/// integer value stored there (`None` for non-integer constants), so a
/// `LoadK` of a small int can still fuse into the cheaper `I` variant.
pub fn run(code: &mut [Instruction], constants: &[Option<i64>]) -> FusionStats {
    let mut stats = FusionStats::default();
    if code.len() < 2 {
        return stats;
    }
    for pc in 0..code.len() - 1 {
        let load = code[pc];
        let consumer = code[pc + 1];
        let Some(operand) = fusable_operand(load, constants) else {
            continue;
        };
        let loaded_reg = load.a();
        // Arithmetic carries its right operand in C; comparisons carry theirs
        // in B (their C slot holds k instead). Only fuse when the loaded
        // register is that right operand and isn't also the destination (for
        // arithmetic) so no later instruction can still observe the load.
        let opcode = consumer.opcode();
        let is_comparison = matches!(
            opcode,
            OpCode::Eq | OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge
        );
        let right_operand = if is_comparison {
            consumer.b()
        } else {
            consumer.c()
        };
        if right_operand != loaded_reg {
            continue;
        }
        // Prefer the cheaper `I` form (immediate embedded directly) when the
        // constant qualifies; only `ADD`/`SUB`/`MUL`/`EQ` have a `K` form to
        // fall back on for constants that don't.
        let fused = match (opcode, operand.immediate, operand.const_index) {
            (OpCode::Add, Some(imm), _) => Some((OpCode::AddI, true, imm as u8)),
            (OpCode::Sub, Some(imm), _) => Some((OpCode::SubI, true, imm as u8)),
            (OpCode::Mul, Some(imm), _) => Some((OpCode::MulI, true, imm as u8)),
            (OpCode::Lt, Some(imm), _) => Some((OpCode::LtI, false, imm as u8)),
            (OpCode::Le, Some(imm), _) => Some((OpCode::LeI, false, imm as u8)),
            (OpCode::Gt, Some(imm), _) => Some((OpCode::GtI, false, imm as u8)),
            (OpCode::Ge, Some(imm), _) => Some((OpCode::GeI, false, imm as u8)),
            (OpCode::Add, None, Some(idx)) => Some((OpCode::AddK, true, idx)),
            (OpCode::Sub, None, Some(idx)) => Some((OpCode::SubK, true, idx)),
            (OpCode::Mul, None, Some(idx)) => Some((OpCode::MulK, true, idx)),
            (OpCode::Eq, _, Some(idx)) => Some((OpCode::EqK, false, idx)),
            _ => None,
        };
        let Some((new_op, is_arith, embedded)) = fused else {
            continue;
        };
        if is_arith && consumer.a() == loaded_reg {
            continue;
        }
        // Arithmetic: A=dst, B=left, C=imm/const_idx. Comparisons have no
        // dst; carry k (originally in C) into the fused instruction's B slot
        // instead: A=left, B=k, C=imm/const_idx.
        let new_instr = if is_arith {
            Instruction::abc(new_op, consumer.a(), consumer.b(), embedded)
        } else {
            Instruction::abc(new_op, consumer.a(), consumer.c(), embedded)
        };
        code[pc] = Instruction::nop();
        code[pc + 1] = new_instr;
        if is_arith {
            stats.arithmetic_fused += 1;
        } else {
            stats.comparisons_fused += 1;
        }
    }
    for pc in 0..code.len() - 1 {
        if code[pc].opcode() == OpCode::Test && code[pc + 1].opcode() == OpCode::Jmp {
            stats.test_jmp_candidates += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuses_load_immediate_add() {
        let mut code = vec![
            Instruction::asbx(OpCode::LoadI, 1, 5),
            Instruction::abc(OpCode::Add, 2, 0, 1),
        ];
        let stats = run(&mut code, &[]);
        assert_eq!(stats.arithmetic_fused, 1);
        assert_eq!(code[1].opcode(), OpCode::AddI);
        assert_eq!(code[1].c() as i8, 5);
        assert!(code[0].is_nop());
    }

    #[test]
    fn does_not_fuse_when_register_still_live_as_destination() {
        let mut code = vec![
            Instruction::asbx(OpCode::LoadI, 1, 5),
            Instruction::abc(OpCode::Add, 1, 0, 1),
        ];
        let stats = run(&mut code, &[]);
        assert_eq!(stats.arithmetic_fused, 0);
    }

    #[test]
    fn fuses_load_immediate_into_comparison_right_operand() {
        // `Lt 0 1 0` compares R[0] < R[1] with k=0; R[1] was just loaded.
        let mut code = vec![
            Instruction::asbx(OpCode::LoadI, 1, 10),
            Instruction::abc(OpCode::Lt, 0, 1, 0),
        ];
        let stats = run(&mut code, &[]);
        assert_eq!(stats.comparisons_fused, 1);
        assert_eq!(code[1].opcode(), OpCode::LtI);
        assert_eq!(code[1].a(), 0);
        assert_eq!(code[1].b(), 0); // k carried through
        assert_eq!(code[1].c() as i8, 10);
    }

    #[test]
    fn fuses_load_constant_small_int_into_i_form() {
        // LoadK of a small integer constant still prefers the cheaper I form.
        let mut code = vec![
            Instruction::abx(OpCode::LoadK, 1, 0),
            Instruction::abc(OpCode::Add, 2, 0, 1),
        ];
        let stats = run(&mut code, &[Some(7)]);
        assert_eq!(stats.arithmetic_fused, 1);
        assert_eq!(code[1].opcode(), OpCode::AddI);
        assert_eq!(code[1].c() as i8, 7);
    }

    #[test]
    fn fuses_load_constant_into_k_form_when_not_a_small_int() {
        // A float (or large int) constant has no immediate form; ADD/SUB/MUL
        // fuse the LoadK directly into the K variant instead.
        let mut code = vec![
            Instruction::abx(OpCode::LoadK, 1, 3),
            Instruction::abc(OpCode::Mul, 2, 0, 1),
        ];
        let stats = run(&mut code, &[None, None, None, None]);
        assert_eq!(stats.arithmetic_fused, 1);
        assert_eq!(code[1].opcode(), OpCode::MulK);
        assert_eq!(code[1].a(), 2);
        assert_eq!(code[1].b(), 0);
        assert_eq!(code[1].c(), 3);
        assert!(code[0].is_nop());
    }

    #[test]
    fn fuses_load_constant_into_eqk() {
        // EQ has no EqI; any fusable LoadK (small int or not) goes to EqK.
        let mut code = vec![
            Instruction::abx(OpCode::LoadK, 1, 5),
            Instruction::abc(OpCode::Eq, 0, 1, 0),
        ];
        let stats = run(&mut code, &[]);
        assert_eq!(stats.comparisons_fused, 1);
        assert_eq!(code[1].opcode(), OpCode::EqK);
        assert_eq!(code[1].a(), 0);
        assert_eq!(code[1].b(), 0); // k carried through
        assert_eq!(code[1].c(), 5);
    }

    #[test]
    fn does_not_fuse_comparison_without_a_k_form() {
        // LT/LE/GT/GE have no K variant; a non-small-int LoadK can't fuse.
        let mut code = vec![
            Instruction::abx(OpCode::LoadK, 1, 0),
            Instruction::abc(OpCode::Lt, 0, 1, 0),
        ];
        let stats = run(&mut code, &[None]);
        assert_eq!(stats.comparisons_fused, 0);
        assert_eq!(code[1].opcode(), OpCode::Lt);
    }
}
