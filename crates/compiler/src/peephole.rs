//! Local rewrites over the freshly-lowered instruction stream for one Proto.
//!
//! Passes run in this order, deliberately: reachability elimination before
//! jump-chain collapse, so that a jump pointing into soon-to-be-dead code is
//! not rewritten before that code is recognized as dead.

use xr_core::opcode::{Instruction, OpCode};

const MAX_CHAIN_HOPS: usize = 100;

pub fn run(code: &mut Vec<Instruction>, lines: &mut Vec<u32>) {
    eliminate_unreachable(code);
    collapse_jump_chains(code);
    remove_redundant_stores(code);
    eliminate_self_moves(code);
    compact_nops(code, lines);
}

fn is_terminator(instr: Instruction) -> bool {
    matches!(
        instr.opcode(),
        OpCode::Return | OpCode::TailCall | OpCode::Jmp
    )
}

/// Computes reachability from pc 0 by walking unconditional jumps and
/// terminators; everything else falls through. Comparisons and `Test`/
/// `TestSet` are conditional branches with *two* successors: `pc + 1` (the
/// `Jmp` they may skip over) and `pc + 2` (the instruction the skip lands
/// on), since every `if`/`while` this compiler emits reaches its
/// then-block/loop-body only through the comparison's own PC++ skip, never
/// through a `Jmp` target. Both must be pushed or that block is wrongly
/// marked unreachable.
fn eliminate_unreachable(code: &mut Vec<Instruction>) {
    let len = code.len();
    if len == 0 {
        return;
    }
    let mut reachable = vec![false; len];
    let mut stack = vec![0usize];
    while let Some(pc) = stack.pop() {
        if pc >= len || reachable[pc] {
            continue;
        }
        reachable[pc] = true;
        let instr = code[pc];
        match instr.opcode() {
            OpCode::Jmp => {
                let target = (pc as i32 + 1 + instr.sj()) as usize;
                stack.push(target);
            }
            OpCode::Return | OpCode::TailCall => {}
            OpCode::Eq
            | OpCode::Ne
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Gt
            | OpCode::Ge
            | OpCode::EqK
            | OpCode::LtI
            | OpCode::LeI
            | OpCode::GtI
            | OpCode::GeI
            | OpCode::Test
            | OpCode::TestSet => {
                stack.push(pc + 1);
                stack.push(pc + 2);
            }
            _ => stack.push(pc + 1),
        }
    }
    for (pc, instr) in code.iter_mut().enumerate() {
        if !reachable[pc] && !instr.is_nop() && !is_terminator(*instr) {
            *instr = Instruction::nop();
        }
    }
}

fn collapse_jump_chains(code: &mut [Instruction]) {
    let len = code.len();
    for pc in 0..len {
        if code[pc].opcode() != OpCode::Jmp {
            continue;
        }
        let mut target = (pc as i32 + 1 + code[pc].sj()) as i64;
        let mut hops = 0;
        while hops < MAX_CHAIN_HOPS {
            if target < 0 || target as usize >= len {
                break;
            }
            let candidate = code[target as usize];
            if candidate.opcode() != OpCode::Jmp {
                break;
            }
            let next = target + 1 + candidate.sj() as i64;
            if next == target {
                break;
            }
            target = next;
            hops += 1;
        }
        let new_offset = (target - pc as i64 - 1) as i32;
        code[pc] = Instruction::sj_instr(OpCode::Jmp, new_offset);
    }
}

/// Two consecutive pure instructions writing the same destination register:
/// the first's result is dead, replace it with `Nop`.
fn remove_redundant_stores(code: &mut [Instruction]) {
    for pc in 0..code.len().saturating_sub(1) {
        let cur = code[pc];
        let next = code[pc + 1];
        if !is_pure_store(cur) || !is_pure_store(next) {
            continue;
        }
        if cur.a() == next.a() {
            code[pc] = Instruction::nop();
        }
    }
}

fn is_pure_store(instr: Instruction) -> bool {
    matches!(
        instr.opcode(),
        OpCode::LoadI
            | OpCode::LoadF
            | OpCode::LoadK
            | OpCode::LoadNil
            | OpCode::LoadTrue
            | OpCode::LoadFalse
            | OpCode::Move
    )
}

fn eliminate_self_moves(code: &mut [Instruction]) {
    for instr in code.iter_mut() {
        if instr.opcode() == OpCode::Move && instr.a() == instr.b() {
            *instr = Instruction::nop();
        }
    }
}

fn compact_nops(code: &mut Vec<Instruction>, lines: &mut Vec<u32>) {
    let len = code.len();
    let mut remap = vec![0usize; len];
    let mut new_code = Vec::with_capacity(len);
    let mut new_lines = Vec::with_capacity(len);
    for (pc, instr) in code.iter().enumerate() {
        if instr.is_nop() {
            remap[pc] = new_code.len();
            continue;
        }
        remap[pc] = new_code.len();
        new_code.push(*instr);
        new_lines.push(lines[pc]);
    }
    // Rewrite jump offsets using the remap table, computed over the
    // original (pre-compaction) indices.
    let mut old_pc = 0usize;
    let mut new_pc = 0usize;
    while old_pc < len {
        if !code[old_pc].is_nop() {
            if code[old_pc].opcode() == OpCode::Jmp {
                let old_target = (old_pc as i32 + 1 + code[old_pc].sj()) as usize;
                let new_target = if old_target >= len {
                    new_code.len()
                } else {
                    remap[old_target]
                };
                let new_offset = new_target as i32 - new_pc as i32 - 1;
                new_code[new_pc] = Instruction::sj_instr(OpCode::Jmp, new_offset);
            }
            new_pc += 1;
        }
        old_pc += 1;
    }
    *code = new_code;
    *lines = new_lines;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_move_becomes_nop() {
        let mut code = vec![Instruction::abc(OpCode::Move, 1, 1, 0)];
        let mut lines = vec![1];
        eliminate_self_moves(&mut code);
        assert!(code[0].is_nop());
        compact_nops(&mut code, &mut lines);
        assert!(code.is_empty());
    }

    #[test]
    fn redundant_store_is_dropped() {
        let mut code = vec![
            Instruction::abx(OpCode::LoadI, 0, 1),
            Instruction::abx(OpCode::LoadI, 0, 2),
        ];
        remove_redundant_stores(&mut code);
        assert!(code[0].is_nop());
        assert!(!code[1].is_nop());
    }

    #[test]
    fn comparison_keeps_both_branches_of_an_if_else_reachable() {
        // if (r0 < r1) { r2 = 111 } else { r2 = 222 }; return r2
        let mut code = vec![
            Instruction::abc(OpCode::Lt, 0, 1, 0), // 0: skip the Jmp at 1 iff r0 < r1
            Instruction::sj_instr(OpCode::Jmp, 2), // 1: -> pc 4 (else branch)
            Instruction::abx(OpCode::LoadI, 2, 111), // 2: then branch
            Instruction::sj_instr(OpCode::Jmp, 1), // 3: -> pc 5 (end)
            Instruction::abx(OpCode::LoadI, 2, 222), // 4: else branch
            Instruction::abc(OpCode::Return, 2, 1, 0), // 5
        ];
        eliminate_unreachable(&mut code);
        assert!(!code[2].is_nop(), "then-branch must stay reachable");
        assert!(!code[4].is_nop(), "else-branch must stay reachable");
    }

    #[test]
    fn idempotent_on_already_clean_stream() {
        let mut code = vec![
            Instruction::abc(OpCode::Add, 2, 0, 1),
            Instruction::abc(OpCode::Return, 2, 1, 0),
        ];
        let mut lines = vec![1, 1];
        let before = code.clone();
        run(&mut code, &mut lines);
        assert_eq!(code, before);
        let before2 = code.clone();
        run(&mut code, &mut lines);
        assert_eq!(code, before2);
    }
}
