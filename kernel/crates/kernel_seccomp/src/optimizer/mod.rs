//! Program Optimizer
//!
//! Shrinks a verified program without changing the value it returns for any
//! input. The program is lifted into [`Node`]s with absolute jump targets,
//! a fixed sequence of passes runs until none of them changes anything (or
//! [`MAX_ROUNDS`] is reached), and the result is lowered and verified again.
//!
//! Every pass rewrites nodes in place; only dead-code elimination removes
//! them. No pass ever adds a node, so the output is never longer than the
//! input.

extern crate alloc;

mod consolidate;
mod dataflow;
mod dce;
mod state;
mod thread;

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};
use thiserror::Error;

use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{JmpOp, Operation, Source};
use crate::bytecode::program::Program;
use crate::oracle::{Corpus, Fuzzee, Oracle, OracleError};
use crate::verifier::VerifyError;

/// Upper bound on pass rounds.
pub const MAX_ROUNDS: usize = 32;

/// Errors from the optimizer. Any of them is a bug in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizeError {
    #[error("jump at {pc} cannot encode target {target}")]
    UnencodableJump { pc: usize, target: usize },

    #[error("optimized program is invalid")]
    Invalid(#[source] VerifyError),

    #[error("pass {pass} changed the program's results")]
    Diverged {
        pass: &'static str,
        #[source]
        source: OracleError,
    },
}

/// One instruction with absolute jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Node {
    /// Falls through to the next node.
    Stmt(Instruction),
    Ret(Instruction),
    Ja(usize),
    Cond {
        op: JmpOp,
        source: Source,
        k: u32,
        jt: usize,
        jf: usize,
    },
}

impl Node {
    /// Successor indices of the node at `pc`.
    pub(crate) fn successors(&self, pc: usize) -> [Option<usize>; 2] {
        match *self {
            Self::Stmt(_) => [Some(pc + 1), None],
            Self::Ret(_) => [None, None],
            Self::Ja(target) => [Some(target), None],
            Self::Cond { jt, jf, .. } => [Some(jt), Some(jf)],
        }
    }

    /// Whether this is `ret #k`.
    pub(crate) fn is_ret_k(&self) -> bool {
        matches!(self, Self::Ret(insn) if insn.operation() == Some(Operation::RetK))
    }
}

/// Whether a conditional jump at `pc` can encode `target`.
pub(crate) fn reaches(pc: usize, target: usize) -> bool {
    target > pc && target - pc - 1 <= Instruction::MAX_COND_OFFSET
}

pub(crate) fn lift(insns: &[Instruction]) -> Vec<Node> {
    insns
        .iter()
        .enumerate()
        .map(|(pc, insn)| match insn.operation() {
            Some(Operation::Ja) => Node::Ja(pc + 1 + insn.k as usize),
            Some(Operation::Jump(op, source)) => Node::Cond {
                op,
                source,
                k: insn.k,
                jt: pc + 1 + insn.jt as usize,
                jf: pc + 1 + insn.jf as usize,
            },
            Some(Operation::RetK | Operation::RetA) => Node::Ret(*insn),
            _ => Node::Stmt(*insn),
        })
        .collect()
}

pub(crate) fn lower(nodes: &[Node]) -> Result<Vec<Instruction>, OptimizeError> {
    let offset = |pc: usize, target: usize| {
        target
            .checked_sub(pc + 1)
            .ok_or(OptimizeError::UnencodableJump { pc, target })
    };
    let cond_offset = |pc: usize, target: usize| {
        let off = offset(pc, target)?;
        u8::try_from(off).map_err(|_| OptimizeError::UnencodableJump { pc, target })
    };

    nodes
        .iter()
        .enumerate()
        .map(|(pc, node)| match *node {
            Node::Stmt(insn) | Node::Ret(insn) => Ok(insn),
            Node::Ja(target) => {
                let off = offset(pc, target)?;
                let off = u32::try_from(off).map_err(|_| OptimizeError::UnencodableJump { pc, target })?;
                Ok(Instruction::ja(off))
            }
            Node::Cond {
                op,
                source,
                k,
                jt,
                jf,
            } => Ok(Instruction::jump(op, source, k, cond_offset(pc, jt)?, cond_offset(pc, jf)?)),
        })
        .collect()
}

/// A rewrite over lifted nodes.
trait Pass: Sync {
    fn name(&self) -> &'static str;

    fn run(&self, nodes: &mut Vec<Node>);
}

static PASSES: [&dyn Pass; 7] = [
    &thread::ThreadJumps,
    &thread::MergeReturns,
    &dataflow::Dataflow,
    &consolidate::ConsolidateRanges,
    &consolidate::ConsolidateMasks,
    &dce::DeadLoads,
    &dce::DeadCode,
];

/// Result of a successful optimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimized {
    pub program: Program,
    /// Rounds run, including the final one that changed nothing.
    pub rounds: usize,
}

/// Optimizer configuration.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    corpus: Option<Corpus>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every pass against `corpus` in debug builds.
    pub fn with_corpus(mut self, corpus: Corpus) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub fn run(&self, program: &Program) -> Result<Optimized, OptimizeError> {
        let mut nodes = lift(program.instructions());
        let mut rounds = 0;

        while rounds < MAX_ROUNDS {
            rounds += 1;
            let mut changed = false;
            for pass in PASSES {
                let before = nodes.clone();
                pass.run(&mut nodes);
                if nodes == before {
                    continue;
                }
                changed = true;
                trace!(
                    "round {rounds}: {} {} -> {} nodes",
                    pass.name(),
                    before.len(),
                    nodes.len()
                );
                if cfg!(debug_assertions) {
                    if let Some(corpus) = &self.corpus {
                        Self::check_pass(pass.name(), program, &nodes, corpus)?;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let optimized = program
            .with_instructions(lower(&nodes)?)
            .map_err(OptimizeError::Invalid)?;
        Ok(Optimized {
            program: optimized,
            rounds,
        })
    }

    fn check_pass(
        pass: &'static str,
        original: &Program,
        nodes: &[Node],
        corpus: &Corpus,
    ) -> Result<(), OptimizeError> {
        let candidate = original
            .with_instructions(lower(nodes)?)
            .map_err(OptimizeError::Invalid)?;
        Oracle::new(vec![
            Fuzzee::new("input", original.clone()),
            Fuzzee::new(pass, candidate),
        ])
        .run(corpus)
        .map(|_| ())
        .map_err(|source| OptimizeError::Diverged { pass, source })
    }
}

/// Optimize `program` with the default configuration.
pub fn optimize(program: &Program) -> Result<Program, OptimizeError> {
    let optimized = Optimizer::new().run(program)?;
    debug!(
        "optimized {} -> {} instructions in {} rounds",
        program.insn_count(),
        optimized.program.insn_count(),
        optimized.rounds
    );
    Ok(optimized.program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::verdict::Verdict;

    fn program(insns: Vec<Instruction>) -> Program {
        Program::new(Arch::X86_64, Verdict::Allow, insns).unwrap()
    }

    #[test]
    fn lift_lower_identity() {
        let insns = vec![
            Instruction::load_abs(0),
            Instruction::jeq(1, 1, 0),
            Instruction::ja(1),
            Instruction::ret(1),
            Instruction::ret(2),
        ];
        assert_eq!(lower(&lift(&insns)).unwrap(), insns);
    }

    #[test]
    fn unencodable_jump() {
        let nodes = [
            Node::Cond {
                op: JmpOp::Jeq,
                source: Source::K,
                k: 0,
                jt: 300,
                jf: 1,
            },
        ];
        assert_eq!(
            lower(&nodes),
            Err(OptimizeError::UnencodableJump { pc: 0, target: 300 })
        );
    }

    #[test]
    fn removes_duplicate_comparison() {
        // Second test of nr == 5 is implied by the first.
        let p = program(vec![
            Instruction::load_abs(0),
            Instruction::jeq(5, 0, 3),
            Instruction::load_abs(0),
            Instruction::jeq(5, 0, 1),
            Instruction::ret(1),
            Instruction::ret(2),
        ]);
        let out = optimize(&p).unwrap();
        assert_eq!(
            out.instructions(),
            &[
                Instruction::load_abs(0),
                Instruction::jeq(5, 0, 1),
                Instruction::ret(1),
                Instruction::ret(2),
            ]
        );
    }

    #[test]
    fn optimize_matches_a_default_run() {
        let p = program(vec![
            Instruction::load_abs(16),
            Instruction::load_abs(0),
            Instruction::jeq(5, 0, 1),
            Instruction::ret(1),
            Instruction::ret(2),
        ]);
        let out: Result<Program, OptimizeError> = optimize(&p);
        assert_eq!(out, Ok(Optimizer::new().run(&p).unwrap().program));
        // The overwritten load is gone.
        assert_eq!(out.unwrap().insn_count(), 4);
    }

    #[test]
    fn fixpoint_is_reached() {
        let p = program(vec![Instruction::ret(0)]);
        let out = Optimizer::new().run(&p).unwrap();
        assert_eq!(out.rounds, 1);
        assert_eq!(out.program, p);
    }
}
