//! Label-Based Program Builder
//!
//! Code generators emit jumps against symbolic [`Label`]s and never compute
//! offsets themselves. [`ProgramBuilder::assemble`] resolves every label and,
//! when a conditional target lies beyond the 8-bit reach of `jt`/`jf`,
//! routes that side through a `ja` trampoline placed right after the jump.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use super::insn::Instruction;
use super::opcode::{JmpOp, Source};
use super::program::Program;
use crate::arch::Arch;
use crate::verdict::Verdict;
use crate::verifier::VerifyError;

/// A position in the program that is not known until assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(usize);

/// Errors produced while resolving labels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuilderError {
    #[error("label {0:?} is used but never bound")]
    UnboundLabel(Label),

    #[error("label {0:?} is bound more than once")]
    DuplicateLabel(Label),

    #[error("instruction {insn_idx} jumps backwards to label {label:?}")]
    BackwardJump { insn_idx: usize, label: Label },

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Clone, Copy)]
enum Item {
    Insn(Instruction),
    Jump {
        op: JmpOp,
        source: Source,
        k: u32,
        jt: Label,
        jf: Label,
    },
    Goto(Label),
    Bind(Label),
}

/// Builder for seccomp programs.
///
/// ```ignore
/// let mut b = ProgramBuilder::new(Arch::X86_64, Verdict::KillProcess);
/// let (allow, deny) = (b.new_label(), b.new_label());
/// b.stmt(Instruction::load_abs(0))
///     .jump(JmpOp::Jeq, 39, allow, deny)
///     .bind(allow)
///     .ret(Verdict::Allow)
///     .bind(deny)
///     .ret(Verdict::KillProcess);
/// let program = b.build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    arch: Arch,
    default_verdict: Verdict,
    items: Vec<Item>,
    next_label: usize,
}

impl ProgramBuilder {
    pub fn new(arch: Arch, default_verdict: Verdict) -> Self {
        Self {
            arch,
            default_verdict,
            items: Vec::new(),
            next_label: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn default_verdict(&self) -> Verdict {
        self.default_verdict
    }

    /// Allocate a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.items.push(Item::Bind(label));
        self
    }

    /// Emit a non-jump instruction.
    pub fn stmt(&mut self, insn: Instruction) -> &mut Self {
        self.items.push(Item::Insn(insn));
        self
    }

    /// Emit a conditional jump comparing `A` with the constant `k`.
    pub fn jump(&mut self, op: JmpOp, k: u32, jt: Label, jf: Label) -> &mut Self {
        self.items.push(Item::Jump {
            op,
            source: Source::K,
            k,
            jt,
            jf,
        });
        self
    }

    /// Emit an unconditional jump.
    pub fn goto(&mut self, target: Label) -> &mut Self {
        self.items.push(Item::Goto(target));
        self
    }

    /// Emit `ret` with the encoding of `verdict`.
    pub fn ret(&mut self, verdict: Verdict) -> &mut Self {
        self.stmt(Instruction::ret(verdict.to_raw()))
    }

    /// Resolve labels into a raw instruction stream.
    ///
    /// The stream is not verified and may exceed the instruction budget;
    /// callers that need a [`Program`] use [`ProgramBuilder::build`].
    pub fn assemble(&self) -> Result<Vec<Instruction>, BuilderError> {
        let mut items = self.items.clone();
        let mut next_label = self.next_label;

        loop {
            let positions = Self::resolve(&items, next_label)?;
            let mut expanded = Vec::with_capacity(items.len());
            let mut changed = false;
            let mut pc = 0usize;

            for item in &items {
                match *item {
                    Item::Jump {
                        op,
                        source,
                        k,
                        jt,
                        jf,
                    } => {
                        let far_t = Self::offset(&positions, pc, jt)? > Instruction::MAX_COND_OFFSET;
                        let far_f = Self::offset(&positions, pc, jf)? > Instruction::MAX_COND_OFFSET;
                        if !far_t && !far_f {
                            expanded.push(*item);
                            pc += 1;
                            continue;
                        }

                        changed = true;
                        let mut fresh = || {
                            next_label += 1;
                            Label(next_label - 1)
                        };
                        let near_t = if far_t { fresh() } else { jt };
                        let near_f = if far_f { fresh() } else { jf };
                        expanded.push(Item::Jump {
                            op,
                            source,
                            k,
                            jt: near_t,
                            jf: near_f,
                        });
                        if far_t {
                            expanded.push(Item::Bind(near_t));
                            expanded.push(Item::Goto(jt));
                        }
                        if far_f {
                            expanded.push(Item::Bind(near_f));
                            expanded.push(Item::Goto(jf));
                        }
                        pc += 1;
                    }
                    Item::Bind(_) => expanded.push(*item),
                    Item::Insn(_) | Item::Goto(_) => {
                        expanded.push(*item);
                        pc += 1;
                    }
                }
            }

            items = expanded;
            if !changed {
                return Self::emit(&items, &Self::resolve(&items, next_label)?);
            }
        }
    }

    /// Assemble and verify.
    pub fn build(&self) -> Result<Program, BuilderError> {
        let insns = self.assemble()?;
        Ok(Program::new(self.arch, self.default_verdict, insns)?)
    }

    /// Instruction index of every bound label.
    fn resolve(items: &[Item], label_count: usize) -> Result<Vec<Option<usize>>, BuilderError> {
        let mut positions = vec![None; label_count];
        let mut pc = 0usize;
        for item in items {
            match item {
                Item::Bind(label) => {
                    let slot = positions
                        .get_mut(label.0)
                        .ok_or(BuilderError::UnboundLabel(*label))?;
                    if slot.is_some() {
                        return Err(BuilderError::DuplicateLabel(*label));
                    }
                    *slot = Some(pc);
                }
                _ => pc += 1,
            }
        }
        Ok(positions)
    }

    /// Relative offset from the instruction at `pc` to `label`.
    fn offset(positions: &[Option<usize>], pc: usize, label: Label) -> Result<usize, BuilderError> {
        let target = positions
            .get(label.0)
            .copied()
            .flatten()
            .ok_or(BuilderError::UnboundLabel(label))?;
        target
            .checked_sub(pc + 1)
            .ok_or(BuilderError::BackwardJump { insn_idx: pc, label })
    }

    fn emit(items: &[Item], positions: &[Option<usize>]) -> Result<Vec<Instruction>, BuilderError> {
        let mut insns = Vec::with_capacity(items.len());
        for item in items {
            let pc = insns.len();
            match *item {
                Item::Insn(insn) => insns.push(insn),
                Item::Jump {
                    op,
                    source,
                    k,
                    jt,
                    jf,
                } => {
                    // Expansion guarantees both offsets fit.
                    let jt = Self::offset(positions, pc, jt)? as u8;
                    let jf = Self::offset(positions, pc, jf)? as u8;
                    insns.push(Instruction::jump(op, source, k, jt, jf));
                }
                Item::Goto(target) => {
                    let offset = Self::offset(positions, pc, target)?;
                    insns.push(Instruction::ja(offset as u32));
                }
                Item::Bind(_) => {}
            }
        }
        Ok(insns)
    }
}
