//! Seccomp Program Execution
//!
//! The interpreter runs a [`Program`] the way the kernel would, over the
//! little-endian `struct seccomp_data` built from a [`SyscallInput`]. It is
//! the ground truth the oracle compares programs with.

extern crate alloc;

mod interpreter;

use alloc::vec::Vec;
use core::fmt;

pub use interpreter::Interpreter;
use kernel_abi::SECCOMP_DATA_ARGS;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::arch::Arch;
use crate::bytecode::program::Program;

/// One syscall invocation as seen by a filter.
///
/// `arch` is the raw audit value so that inputs for architectures this crate
/// does not know can still be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyscallInput {
    pub arch: u32,
    pub nr: u32,
    pub instruction_pointer: u64,
    pub args: [u64; SECCOMP_DATA_ARGS],
}

impl SyscallInput {
    /// Invocation of `nr` on `arch` with all arguments zero.
    pub const fn new(arch: Arch, nr: u32) -> Self {
        Self {
            arch: arch.audit_value(),
            nr,
            instruction_pointer: 0,
            args: [0; SECCOMP_DATA_ARGS],
        }
    }

    pub const fn with_args(mut self, args: [u64; SECCOMP_DATA_ARGS]) -> Self {
        self.args = args;
        self
    }

    pub const fn with_arg(mut self, slot: usize, value: u64) -> Self {
        self.args[slot] = value;
        self
    }

    pub const fn with_raw_arch(mut self, arch: u32) -> Self {
        self.arch = arch;
        self
    }

    pub fn seccomp_data(&self) -> SeccompData {
        SeccompData::from(self)
    }
}

impl fmt::Display for SyscallInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arch={:#x} nr={} args=[", self.arch, self.nr)?;
        for (slot, arg) in self.args.iter().enumerate() {
            if slot > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg:#x}")?;
        }
        write!(f, "]")
    }
}

/// `struct seccomp_data` in its little-endian wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SeccompData {
    pub nr: U32,
    pub arch: U32,
    pub instruction_pointer: U64,
    pub args: [U64; SECCOMP_DATA_ARGS],
}

impl From<&SyscallInput> for SeccompData {
    fn from(input: &SyscallInput) -> Self {
        Self {
            nr: U32::new(input.nr),
            arch: U32::new(input.arch),
            instruction_pointer: U64::new(input.instruction_pointer),
            args: input.args.map(U64::new),
        }
    }
}

impl SeccompData {
    /// The 32-bit word at byte `offset`, if it lies inside the structure.
    pub fn word(&self, offset: u32) -> Option<u32> {
        let start = offset as usize;
        let bytes = self.as_bytes().get(start..start.checked_add(4)?)?;
        U32::read_from_bytes(bytes).ok().map(U32::get)
    }
}

/// Per-run execution record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMetrics {
    /// Value the program returned
    pub return_value: u32,
    /// Which instructions executed
    pub coverage: Vec<bool>,
    /// Number of instructions executed
    pub steps: usize,
}

/// Result of program execution.
pub type ExecResult = Result<u32, ExecError>;

/// Errors that can occur during execution.
///
/// A verified program never produces one; they exist so that the
/// interpreter stays total on any instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Opcode outside the seccomp subset
    InvalidInstruction { pc: usize, code: u16 },

    /// Load outside `seccomp_data` or scratch memory
    OutOfBounds { pc: usize, offset: u32 },

    /// Control left the program without returning
    FellOffEnd { pc: usize },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInstruction { pc, code } => {
                write!(f, "invalid instruction {code:#06x} at {pc}")
            }
            Self::OutOfBounds { pc, offset } => {
                write!(f, "out of bounds access at offset {offset} at {pc}")
            }
            Self::FellOffEnd { pc } => write!(f, "control reached {pc} past the end"),
        }
    }
}

impl core::error::Error for ExecError {}

/// Trait for seccomp execution engines.
pub trait SeccompExecutor {
    /// Run `program` against `input` and return its 32-bit result.
    fn execute(&self, program: &Program, input: &SyscallInput) -> ExecResult;

    /// Run `program` and record which instructions executed.
    fn execute_with_metrics(
        &self,
        program: &Program,
        input: &SyscallInput,
    ) -> Result<ExecutionMetrics, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seccomp_data_layout() {
        assert_eq!(core::mem::size_of::<SeccompData>(), 64);

        let input = SyscallInput::new(Arch::X86_64, 257)
            .with_arg(0, 0x1111_2222_3333_4444)
            .with_arg(5, 0xdead_beef);
        let data = input.seccomp_data();

        assert_eq!(data.word(0), Some(257));
        assert_eq!(data.word(4), Some(Arch::X86_64.audit_value()));
        assert_eq!(data.word(16), Some(0x3333_4444));
        assert_eq!(data.word(20), Some(0x1111_2222));
        assert_eq!(data.word(56), Some(0xdead_beef));
        assert_eq!(data.word(60), Some(0));
        assert_eq!(data.word(61), None);
        assert_eq!(data.word(64), None);
    }
}
