//! Program Verifier
//!
//! Checks the invariants the kernel enforces before it installs a filter:
//!
//! 1. **Basic checks**: length within `1..=BPF_MAXINSNS`
//! 2. **Instruction checks**: opcode subset, load alignment and bounds,
//!    scratch slot indices, constant divisors and shift amounts
//! 3. **Control flow**: every jump lands inside the program and the last
//!    instruction returns
//! 4. **Scratch memory**: no slot is read on a path that has not written it

use kernel_abi::{BPF_MAXINSNS, BPF_MEMWORDS, SECCOMP_DATA_SIZE};

use super::cfg::ControlFlowGraph;
use super::error::{VerifyError, VerifyResult};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{AluOp, Operation, Source};

/// Static verifier for seccomp programs.
pub struct Verifier;

impl Verifier {
    /// Verify an instruction stream.
    pub fn verify(insns: &[Instruction]) -> VerifyResult<()> {
        Self::check_basic(insns)?;
        for (idx, insn) in insns.iter().enumerate() {
            Self::check_instruction(idx, insn)?;
            Self::check_jumps(idx, insn, insns.len())?;
        }
        Self::check_last_returns(insns)?;
        Self::check_scratch_memory(insns)
    }

    fn check_basic(insns: &[Instruction]) -> VerifyResult<()> {
        if insns.is_empty() {
            return Err(VerifyError::EmptyProgram);
        }
        if insns.len() > BPF_MAXINSNS {
            return Err(VerifyError::TooLong {
                count: insns.len(),
                limit: BPF_MAXINSNS,
            });
        }
        Ok(())
    }

    fn check_instruction(insn_idx: usize, insn: &Instruction) -> VerifyResult<()> {
        let op = insn.operation().ok_or(VerifyError::InvalidOpcode {
            insn_idx,
            code: insn.code,
        })?;

        match op {
            Operation::LoadAbs => {
                if insn.k >= SECCOMP_DATA_SIZE {
                    return Err(VerifyError::OutOfBoundsLoad {
                        insn_idx,
                        offset: insn.k,
                    });
                }
                if insn.k % 4 != 0 {
                    return Err(VerifyError::MisalignedLoad {
                        insn_idx,
                        offset: insn.k,
                    });
                }
            }
            Operation::LoadMem | Operation::LoadXMem | Operation::Store | Operation::StoreX => {
                if insn.k as usize >= BPF_MEMWORDS {
                    return Err(VerifyError::InvalidScratchSlot {
                        insn_idx,
                        slot: insn.k,
                    });
                }
            }
            Operation::Alu(AluOp::Div, Source::K) if insn.k == 0 => {
                return Err(VerifyError::DivisionByZero { insn_idx });
            }
            Operation::Alu(AluOp::Lsh | AluOp::Rsh, Source::K) if insn.k >= 32 => {
                return Err(VerifyError::InvalidShift {
                    insn_idx,
                    amount: insn.k,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn check_jumps(insn_idx: usize, insn: &Instruction, len: usize) -> VerifyResult<()> {
        let (taken, not_taken) = insn.successors(insn_idx);
        for target in [taken, not_taken].into_iter().flatten() {
            if target >= len {
                return Err(VerifyError::JumpOutOfBounds { insn_idx, target });
            }
        }
        Ok(())
    }

    fn check_last_returns(insns: &[Instruction]) -> VerifyResult<()> {
        match insns.last() {
            Some(insn) if insn.is_ret() => Ok(()),
            _ => Err(VerifyError::NoReturn),
        }
    }

    /// Track which scratch slots are written on every path into each
    /// instruction. Unreachable code is treated as fully initialized, as the
    /// kernel does.
    fn check_scratch_memory(insns: &[Instruction]) -> VerifyResult<()> {
        const ALL: u16 = u16::MAX;

        let cfg = ControlFlowGraph::build(insns);
        let reachable = cfg.reachable();
        // written[idx]: slots written on every path once idx has run.
        let mut written = alloc::vec![ALL; insns.len()];

        for (idx, insn) in insns.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            let mut valid = if idx == 0 {
                0
            } else {
                cfg.predecessors(idx)
                    .iter()
                    .fold(ALL, |acc, &pred| acc & written[pred])
            };
            match insn.operation() {
                Some(Operation::LoadMem | Operation::LoadXMem) if valid & (1 << insn.k) == 0 => {
                    return Err(VerifyError::UninitializedScratch {
                        insn_idx: idx,
                        slot: insn.k,
                    });
                }
                Some(Operation::Store | Operation::StoreX) => valid |= 1 << insn.k,
                _ => {}
            }
            written[idx] = valid;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify(insns: &[Instruction]) -> VerifyResult<()> {
        Verifier::verify(insns)
    }

    #[test]
    fn minimal_program() {
        assert_eq!(verify(&[Instruction::ret(0)]), Ok(()));
    }

    #[test]
    fn empty_program_rejected() {
        assert_eq!(verify(&[]), Err(VerifyError::EmptyProgram));
    }

    #[test]
    fn too_long_rejected() {
        let insns = alloc::vec![Instruction::ret(0); BPF_MAXINSNS + 1];
        assert_eq!(
            verify(&insns),
            Err(VerifyError::TooLong {
                count: BPF_MAXINSNS + 1,
                limit: BPF_MAXINSNS
            })
        );
    }

    #[test]
    fn must_end_with_return() {
        assert_eq!(
            verify(&[Instruction::ret(0), Instruction::load_abs(0)]),
            Err(VerifyError::NoReturn)
        );
    }

    #[test]
    fn load_checks() {
        assert_eq!(
            verify(&[Instruction::load_abs(2), Instruction::ret_a()]),
            Err(VerifyError::MisalignedLoad {
                insn_idx: 0,
                offset: 2
            })
        );
        assert_eq!(
            verify(&[Instruction::load_abs(64), Instruction::ret_a()]),
            Err(VerifyError::OutOfBoundsLoad {
                insn_idx: 0,
                offset: 64
            })
        );
        assert_eq!(
            verify(&[Instruction::load_abs(60), Instruction::ret_a()]),
            Ok(())
        );
    }

    #[test]
    fn invalid_opcode_rejected() {
        // ld h [0]
        assert_eq!(
            verify(&[Instruction::stmt(0x28, 0), Instruction::ret(0)]),
            Err(VerifyError::InvalidOpcode {
                insn_idx: 0,
                code: 0x28
            })
        );
    }

    #[test]
    fn constant_operand_checks() {
        assert_eq!(
            verify(&[Instruction::alu_k(AluOp::Div, 0), Instruction::ret_a()]),
            Err(VerifyError::DivisionByZero { insn_idx: 0 })
        );
        assert_eq!(
            verify(&[Instruction::alu_k(AluOp::Lsh, 32), Instruction::ret_a()]),
            Err(VerifyError::InvalidShift {
                insn_idx: 0,
                amount: 32
            })
        );
    }

    #[test]
    fn jump_out_of_bounds() {
        assert_eq!(
            verify(&[Instruction::jeq(0, 0, 5), Instruction::ret(0)]),
            Err(VerifyError::JumpOutOfBounds {
                insn_idx: 0,
                target: 6
            })
        );
        assert_eq!(
            verify(&[Instruction::ja(1), Instruction::ret(0)]),
            Err(VerifyError::JumpOutOfBounds {
                insn_idx: 0,
                target: 2
            })
        );
    }

    #[test]
    fn scratch_memory_initialization() {
        assert_eq!(
            verify(&[Instruction::load_mem(3), Instruction::ret_a()]),
            Err(VerifyError::UninitializedScratch {
                insn_idx: 0,
                slot: 3
            })
        );
        assert_eq!(
            verify(&[
                Instruction::store(3),
                Instruction::load_mem(3),
                Instruction::ret_a()
            ]),
            Ok(())
        );
        assert_eq!(
            verify(&[Instruction::load_mem(16), Instruction::ret_a()]),
            Err(VerifyError::InvalidScratchSlot {
                insn_idx: 0,
                slot: 16
            })
        );
    }

    #[test]
    fn scratch_written_on_one_path_only() {
        // 0: jeq #1 -> 2 / 1
        // 1: st M[0]
        // 2: ld M[0]    <- reachable from 0 without the store
        let insns = [
            Instruction::jeq(1, 1, 0),
            Instruction::store(0),
            Instruction::load_mem(0),
            Instruction::ret_a(),
        ];
        assert_eq!(
            verify(&insns),
            Err(VerifyError::UninitializedScratch {
                insn_idx: 2,
                slot: 0
            })
        );
    }
}
