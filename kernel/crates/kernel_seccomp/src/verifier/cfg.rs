//! Control Flow Graph Construction
//!
//! Classic BPF only jumps forward, so the graph is acyclic and instruction
//! order is already a topological order. Analyses over it are single passes.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::bytecode::insn::Instruction;

/// Control flow graph for a classic BPF program.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    /// Successor edges per instruction
    successors: Vec<Vec<usize>>,

    /// Predecessor edges per instruction
    predecessors: Vec<Vec<usize>>,
}

impl ControlFlowGraph {
    /// Build a control flow graph from instructions.
    ///
    /// Edges that leave the program are dropped; the verifier reports them
    /// separately.
    pub fn build(insns: &[Instruction]) -> Self {
        let len = insns.len();
        let mut cfg = Self {
            successors: vec![Vec::new(); len],
            predecessors: vec![Vec::new(); len],
        };

        for (idx, insn) in insns.iter().enumerate() {
            let (taken, not_taken) = insn.successors(idx);
            for target in [taken, not_taken].into_iter().flatten() {
                if target < len && !cfg.successors[idx].contains(&target) {
                    cfg.successors[idx].push(target);
                    cfg.predecessors[target].push(idx);
                }
            }
        }

        cfg
    }

    /// Number of instructions in the graph.
    pub fn len(&self) -> usize {
        self.successors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        self.successors.get(idx).map_or(&[], Vec::as_slice)
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        self.predecessors.get(idx).map_or(&[], Vec::as_slice)
    }

    /// Instructions reachable from the entry point.
    pub fn reachable(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.len()];
        if let Some(entry) = reachable.first_mut() {
            *entry = true;
        }
        for idx in 0..self.len() {
            if !reachable[idx] {
                continue;
            }
            for &succ in &self.successors[idx] {
                reachable[succ] = true;
            }
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_program() {
        let insns = [Instruction::load_abs(0), Instruction::ret(0)];
        let cfg = ControlFlowGraph::build(&insns);

        assert_eq!(cfg.successors(0), &[1]);
        assert_eq!(cfg.predecessors(1), &[0]);
    }

    #[test]
    fn branch_and_unreachable() {
        let insns = [
            Instruction::jeq(1, 1, 0),
            Instruction::ret(1),
            Instruction::ret(2),
            Instruction::ret(3),
        ];
        let cfg = ControlFlowGraph::build(&insns);

        assert_eq!(cfg.successors(0), &[2, 1]);
        assert_eq!(cfg.reachable(), vec![true, true, true, false]);
    }

    #[test]
    fn equal_targets_yield_one_edge() {
        let insns = [Instruction::jeq(1, 0, 0), Instruction::ret(1)];
        let cfg = ControlFlowGraph::build(&insns);

        assert_eq!(cfg.successors(0), &[1]);
        assert_eq!(cfg.predecessors(1), &[0]);
    }
}
