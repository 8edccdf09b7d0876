//! Syscall Number Dispatch
//!
//! With the syscall number in `A`, control must reach the block of rules
//! for that number. The linear strategy tests every number in turn; the
//! binary search strategy splits the sorted numbers on `jge` until at most
//! [`LEAF_SIZE`] remain and finishes with a short `jeq` chain.

extern crate alloc;

use alloc::vec::Vec;

use super::Arm;
use super::lower::lower_rule;
use crate::bytecode::builder::{Label, ProgramBuilder};
use crate::bytecode::opcode::JmpOp;
use crate::verdict::Verdict;

/// Largest group of numbers resolved with a `jeq` chain.
pub const LEAF_SIZE: usize = 8;

/// One syscall number and its rules in priority order.
pub(super) type Group<'a> = (u32, &'a [Arm]);

/// Emit the rules for one syscall number. Never falls through.
pub(super) fn emit_block(b: &mut ProgramBuilder, arms: &[Arm], default: Verdict) {
    for arm in arms {
        if arm.rule.is_match_all() {
            b.ret(arm.verdict);
            return;
        }
        let (matched, next) = (b.new_label(), b.new_label());
        lower_rule(b, &arm.rule, matched, next);
        b.bind(matched).ret(arm.verdict).bind(next);
    }
    b.ret(default);
}

pub(super) fn emit_linear(b: &mut ProgramBuilder, groups: &[Group<'_>], default: Verdict) {
    let labels: Vec<Label> = groups.iter().map(|_| b.new_label()).collect();
    for (&(nr, _), &target) in groups.iter().zip(&labels) {
        let next = b.new_label();
        b.jump(JmpOp::Jeq, nr, target, next).bind(next);
    }
    b.ret(default);
    for (&(_, arms), &target) in groups.iter().zip(&labels) {
        b.bind(target);
        emit_block(b, arms, default);
    }
}

/// Binary search over `groups`, which are sorted by number and all lie in
/// `lo..=hi`.
pub(super) fn emit_tree(b: &mut ProgramBuilder, groups: &[Group<'_>], lo: u32, hi: u32, default: Verdict) {
    if groups.len() <= LEAF_SIZE {
        emit_leaf(b, groups, lo, hi, default);
        return;
    }

    let mid = groups.len() / 2;
    let pivot = groups[mid].0;
    let (left, right) = (b.new_label(), b.new_label());
    b.jump(JmpOp::Jge, pivot, right, left).bind(left);
    emit_tree(b, &groups[..mid], lo, pivot - 1, default);
    b.bind(right);
    emit_tree(b, &groups[mid..], pivot, hi, default);
}

fn emit_leaf(b: &mut ProgramBuilder, groups: &[Group<'_>], lo: u32, hi: u32, default: Verdict) {
    let Some(&(_, last_arms)) = groups.last() else {
        b.ret(default);
        return;
    };

    // Every number in range has rules: the last one needs no test.
    let dense = u64::from(hi) - u64::from(lo) + 1 == groups.len() as u64;

    let mut bodies: Vec<(&[Arm], Label)> = Vec::new();
    let targets: Vec<Label> = groups
        .iter()
        .map(|&(_, arms)| body_label(b, &mut bodies, arms))
        .collect();

    let tested = if dense { groups.len() - 1 } else { groups.len() };
    for (&(nr, _), &target) in groups[..tested].iter().zip(&targets) {
        let next = b.new_label();
        b.jump(JmpOp::Jeq, nr, target, next).bind(next);
    }

    if dense {
        let fall = body_label(b, &mut bodies, last_arms);
        bodies.sort_by_key(|&(_, label)| label != fall);
    } else {
        b.ret(default);
    }

    for (arms, label) in bodies {
        b.bind(label);
        emit_block(b, arms, default);
    }
}

/// Label of the block for `arms`, shared between identical blocks.
fn body_label<'a>(b: &mut ProgramBuilder, bodies: &mut Vec<(&'a [Arm], Label)>, arms: &'a [Arm]) -> Label {
    if let Some(&(_, label)) = bodies.iter().find(|(existing, _)| *existing == arms) {
        return label;
    }
    let label = b.new_label();
    bodies.push((arms, label));
    label
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::arch::Arch;
    use crate::bytecode::insn::Instruction;
    use crate::execution::{Interpreter, SeccompExecutor, SyscallInput};
    use crate::rule::SyscallRule;

    fn arm(verdict: Verdict) -> Arm {
        Arm {
            rule: SyscallRule::MatchAll,
            verdict,
        }
    }

    fn run_dispatch(groups: &[Group<'_>], tree: bool, nr: u32) -> u32 {
        let mut b = ProgramBuilder::new(Arch::X86_64, Verdict::KillThread);
        b.stmt(Instruction::load_abs(0));
        if tree {
            emit_tree(&mut b, groups, 0, u32::MAX, Verdict::KillThread);
        } else {
            emit_linear(&mut b, groups, Verdict::KillThread);
        }
        let program = b.build().unwrap();
        Interpreter::new()
            .execute(&program, &SyscallInput::new(Arch::X86_64, nr))
            .unwrap()
    }

    #[test]
    fn tree_and_linear_agree() {
        let arms: Vec<Vec<Arm>> = (0..40u16).map(|n| vec![arm(Verdict::Errno(n % 3))]).collect();
        let groups: Vec<Group<'_>> = arms
            .iter()
            .enumerate()
            .map(|(idx, arms)| (idx as u32 * 3 + 1, arms.as_slice()))
            .collect();

        for nr in 0..130 {
            assert_eq!(run_dispatch(&groups, true, nr), run_dispatch(&groups, false, nr), "nr {nr}");
        }
        assert_eq!(run_dispatch(&groups, true, 4), Verdict::Errno(1).to_raw());
        assert_eq!(run_dispatch(&groups, true, 5), Verdict::KillThread.to_raw());
    }

    #[test]
    fn dense_leaf_skips_last_test() {
        let allow = [arm(Verdict::Allow)];
        let deny = [arm(Verdict::Errno(1))];
        let groups: [Group<'_>; 3] = [(10, &allow), (11, &deny), (12, &allow)];

        let mut b = ProgramBuilder::new(Arch::X86_64, Verdict::KillThread);
        emit_leaf(&mut b, &groups, 10, 12, Verdict::KillThread);
        let insns = b.assemble().unwrap();

        // Two tests, then the shared allow block, then the deny block.
        assert_eq!(insns.len(), 4);
        assert_eq!(insns[2], Instruction::ret(Verdict::Allow.to_raw()));
        assert_eq!(insns[3], Instruction::ret(Verdict::Errno(1).to_raw()));
    }

    #[test]
    fn identical_blocks_are_shared() {
        let allow = [arm(Verdict::Allow)];
        let groups: [Group<'_>; 3] = [(1, &allow), (5, &allow), (9, &allow)];

        let mut b = ProgramBuilder::new(Arch::X86_64, Verdict::KillThread);
        emit_leaf(&mut b, &groups, 0, u32::MAX, Verdict::KillThread);
        // Three tests, the default, one shared block.
        assert_eq!(b.assemble().unwrap().len(), 5);
    }
}
