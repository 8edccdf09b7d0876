//! Dead-code elimination.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use super::{Node, Pass};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{Operation, Source};

/// Whether `A` may be read before it is written, on entry to each node.
/// The extra last entry stands for falling off the end.
pub(super) fn accumulator_live(nodes: &[Node]) -> Vec<bool> {
    let mut live = vec![false; nodes.len() + 1];
    for pc in (0..nodes.len()).rev() {
        live[pc] = match nodes[pc] {
            Node::Stmt(insn) => match insn.operation() {
                Some(op) if op.reads_a() => true,
                Some(op) if op.writes_a() => false,
                _ => live[pc + 1],
            },
            Node::Ret(insn) => insn.operation() == Some(Operation::RetA),
            Node::Ja(target) => live.get(target).copied().unwrap_or(true),
            Node::Cond { .. } => true,
        };
    }
    live
}

/// Whether `insn` only writes `A` and cannot end the program.
fn writes_only_a(insn: &Instruction) -> bool {
    match insn.operation() {
        Some(Operation::LoadAbs | Operation::LoadLen | Operation::LoadImm | Operation::LoadMem | Operation::Txa) => true,
        Some(Operation::Alu(alu, Source::K)) => alu.apply(0, insn.k).is_some(),
        Some(Operation::Neg) => true,
        _ => false,
    }
}

/// Turn writes to `A` that nothing reads into `ja 0`.
pub(super) struct DeadLoads;

impl Pass for DeadLoads {
    fn name(&self) -> &'static str {
        "dead-loads"
    }

    fn run(&self, nodes: &mut Vec<Node>) {
        let live = accumulator_live(nodes);
        for pc in 0..nodes.len() {
            if let Node::Stmt(insn) = nodes[pc] {
                if writes_only_a(&insn) && !live[pc + 1] {
                    nodes[pc] = Node::Ja(pc + 1);
                }
            }
        }
    }
}

/// Drop unreachable nodes and `ja 0`, then renumber every target.
pub(super) struct DeadCode;

impl Pass for DeadCode {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn run(&self, nodes: &mut Vec<Node>) {
        let len = nodes.len();
        let mut reachable = vec![false; len];
        if let Some(entry) = reachable.first_mut() {
            *entry = true;
        }
        for pc in 0..len {
            if !reachable[pc] {
                continue;
            }
            for succ in nodes[pc].successors(pc).into_iter().flatten() {
                if let Some(flag) = reachable.get_mut(succ) {
                    *flag = true;
                }
            }
        }

        let keep: Vec<bool> = (0..len)
            .map(|pc| reachable[pc] && nodes[pc] != Node::Ja(pc + 1))
            .collect();
        if keep.iter().all(|&kept| kept) {
            return;
        }

        // new_index[pc]: index of the first kept node at or after pc.
        let mut new_index = Vec::with_capacity(len + 1);
        let mut count = 0;
        for &kept in &keep {
            new_index.push(count);
            count += usize::from(kept);
        }
        new_index.push(count);
        let remap = |target: usize| new_index.get(target).copied().unwrap_or(count);

        let compacted = nodes
            .iter()
            .zip(&keep)
            .filter(|&(_, &kept)| kept)
            .map(|(node, _)| match *node {
                Node::Ja(target) => Node::Ja(remap(target)),
                Node::Cond {
                    op,
                    source,
                    k,
                    jt,
                    jf,
                } => Node::Cond {
                    op,
                    source,
                    k,
                    jt: remap(jt),
                    jf: remap(jf),
                },
                other => other,
            })
            .collect();
        *nodes = compacted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::{AluOp, JmpOp};
    use crate::optimizer::lift;

    #[test]
    fn removes_unreachable_and_nops() {
        let mut nodes = vec![
            Node::Stmt(Instruction::load_abs(0)),
            Node::Ja(2),
            Node::Cond {
                op: JmpOp::Jeq,
                source: Source::K,
                k: 1,
                jt: 4,
                jf: 5,
            },
            Node::Ret(Instruction::ret(9)),
            Node::Ret(Instruction::ret(1)),
            Node::Ret(Instruction::ret(2)),
        ];
        DeadCode.run(&mut nodes);
        assert_eq!(
            nodes,
            vec![
                Node::Stmt(Instruction::load_abs(0)),
                Node::Cond {
                    op: JmpOp::Jeq,
                    source: Source::K,
                    k: 1,
                    jt: 2,
                    jf: 3,
                },
                Node::Ret(Instruction::ret(1)),
                Node::Ret(Instruction::ret(2)),
            ]
        );
    }

    #[test]
    fn nothing_to_remove() {
        let mut nodes = vec![Node::Ret(Instruction::ret(0))];
        DeadCode.run(&mut nodes);
        assert_eq!(nodes, vec![Node::Ret(Instruction::ret(0))]);
    }

    #[test]
    fn overwritten_loads_are_dropped() {
        let mut nodes = lift(&[
            Instruction::load_abs(16),
            Instruction::load_abs(28),
            Instruction::jeq(1, 0, 1),
            Instruction::load_abs(24),
            Instruction::ret(1),
            Instruction::ret(2),
        ]);
        DeadLoads.run(&mut nodes);
        assert_eq!(nodes[0], Node::Ja(1));
        assert_eq!(nodes[1], Node::Stmt(Instruction::load_abs(28)));
        assert_eq!(nodes[3], Node::Ja(4));

        DeadCode.run(&mut nodes);
        assert_eq!(nodes.len(), 4);
    }

    #[test]
    fn loads_read_later_stay() {
        let mut nodes = lift(&[
            Instruction::load_abs(16),
            Instruction::alu_k(AluOp::Add, 1),
            Instruction::ret_a(),
        ]);
        let before = nodes.clone();
        DeadLoads.run(&mut nodes);
        assert_eq!(nodes, before);
    }

    #[test]
    fn division_by_zero_is_kept() {
        let mut nodes = lift(&[
            Instruction::load_abs(16),
            Instruction::alu_k(AluOp::Div, 0),
            Instruction::ret(1),
        ]);
        DeadLoads.run(&mut nodes);
        assert_eq!(nodes[0], Node::Ja(1));
        assert_eq!(nodes[1], Node::Stmt(Instruction::alu_k(AluOp::Div, 0)));
    }
}
