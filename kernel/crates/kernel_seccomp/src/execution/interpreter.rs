//! Classic BPF Interpreter
//!
//! Straight fetch-decode-execute over the seccomp subset. Jumps only move
//! forward, so a run executes at most `insn_count` instructions.

extern crate alloc;

use alloc::vec;

use kernel_abi::{BPF_MEMWORDS, SECCOMP_DATA_SIZE};

use super::{ExecError, ExecResult, ExecutionMetrics, SeccompData, SeccompExecutor, SyscallInput};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{Operation, Source};
use crate::bytecode::program::Program;

/// Machine state of one run.
struct Machine<'a> {
    data: &'a SeccompData,
    a: u32,
    x: u32,
    mem: [u32; BPF_MEMWORDS],
}

enum Step {
    Next,
    Jump(usize),
    Return(u32),
}

/// Seccomp program interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub const fn new() -> Self {
        Self
    }

    fn run(
        insns: &[Instruction],
        input: &SyscallInput,
        mut on_step: impl FnMut(usize),
    ) -> ExecResult {
        let data = input.seccomp_data();
        let mut machine = Machine {
            data: &data,
            a: 0,
            x: 0,
            mem: [0; BPF_MEMWORDS],
        };

        let mut pc = 0usize;
        loop {
            let insn = insns.get(pc).ok_or(ExecError::FellOffEnd { pc })?;
            on_step(pc);
            match machine.step(pc, insn)? {
                Step::Next => pc += 1,
                Step::Jump(offset) => pc += 1 + offset,
                Step::Return(value) => return Ok(value),
            }
        }
    }
}

impl Machine<'_> {
    fn step(&mut self, pc: usize, insn: &Instruction) -> Result<Step, ExecError> {
        let op = insn.operation().ok_or(ExecError::InvalidInstruction {
            pc,
            code: insn.code,
        })?;
        let k = insn.k;

        match op {
            Operation::LoadAbs => {
                self.a = self
                    .data
                    .word(k)
                    .ok_or(ExecError::OutOfBounds { pc, offset: k })?;
            }
            Operation::LoadLen => self.a = SECCOMP_DATA_SIZE,
            Operation::LoadImm => self.a = k,
            Operation::LoadMem => self.a = self.scratch(pc, k)?,
            Operation::LoadXLen => self.x = SECCOMP_DATA_SIZE,
            Operation::LoadXImm => self.x = k,
            Operation::LoadXMem => self.x = self.scratch(pc, k)?,
            Operation::Store => *self.scratch_mut(pc, k)? = self.a,
            Operation::StoreX => *self.scratch_mut(pc, k)? = self.x,
            Operation::Alu(alu, src) => {
                let operand = self.operand(src, k);
                // Division by zero aborts the filter with a zero return.
                match alu.apply(self.a, operand) {
                    Some(value) => self.a = value,
                    None => return Ok(Step::Return(0)),
                }
            }
            Operation::Neg => self.a = self.a.wrapping_neg(),
            Operation::Ja => return Ok(Step::Jump(k as usize)),
            Operation::Jump(jmp, src) => {
                let taken = jmp.eval(self.a, self.operand(src, k));
                let offset = if taken { insn.jt } else { insn.jf };
                return Ok(Step::Jump(offset as usize));
            }
            Operation::RetK => return Ok(Step::Return(k)),
            Operation::RetA => return Ok(Step::Return(self.a)),
            Operation::Tax => self.x = self.a,
            Operation::Txa => self.a = self.x,
        }
        Ok(Step::Next)
    }

    #[inline]
    fn operand(&self, src: Source, k: u32) -> u32 {
        match src {
            Source::K => k,
            Source::X => self.x,
        }
    }

    fn scratch(&self, pc: usize, slot: u32) -> Result<u32, ExecError> {
        self.mem
            .get(slot as usize)
            .copied()
            .ok_or(ExecError::OutOfBounds { pc, offset: slot })
    }

    fn scratch_mut(&mut self, pc: usize, slot: u32) -> Result<&mut u32, ExecError> {
        self.mem
            .get_mut(slot as usize)
            .ok_or(ExecError::OutOfBounds { pc, offset: slot })
    }
}

impl SeccompExecutor for Interpreter {
    fn execute(&self, program: &Program, input: &SyscallInput) -> ExecResult {
        Self::run(program.instructions(), input, |_| {})
    }

    fn execute_with_metrics(
        &self,
        program: &Program,
        input: &SyscallInput,
    ) -> Result<ExecutionMetrics, ExecError> {
        let mut coverage = vec![false; program.insn_count()];
        let mut steps = 0usize;
        let return_value = Self::run(program.instructions(), input, |pc| {
            coverage[pc] = true;
            steps += 1;
        })?;
        Ok(ExecutionMetrics {
            return_value,
            coverage,
            steps,
        })
    }
}
