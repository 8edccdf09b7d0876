//! Verification Errors
//!
//! Error types returned when a program breaks one of the rules the kernel
//! enforces in `seccomp_check_filter`.

use thiserror::Error;

/// Errors that can occur during program verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("program is empty")]
    EmptyProgram,

    #[error("program has {count} instructions, limit is {limit}")]
    TooLong { count: usize, limit: usize },

    #[error("instruction {insn_idx}: opcode {code:#06x} is not allowed in a seccomp filter")]
    InvalidOpcode { insn_idx: usize, code: u16 },

    #[error("instruction {insn_idx}: load offset {offset} is not 4-byte aligned")]
    MisalignedLoad { insn_idx: usize, offset: u32 },

    #[error("instruction {insn_idx}: load offset {offset} is outside seccomp_data")]
    OutOfBoundsLoad { insn_idx: usize, offset: u32 },

    #[error("instruction {insn_idx}: scratch slot {slot} does not exist")]
    InvalidScratchSlot { insn_idx: usize, slot: u32 },

    #[error("instruction {insn_idx}: scratch slot {slot} may be read before it is written")]
    UninitializedScratch { insn_idx: usize, slot: u32 },

    #[error("instruction {insn_idx}: division by constant zero")]
    DivisionByZero { insn_idx: usize },

    #[error("instruction {insn_idx}: shift by {amount} bits")]
    InvalidShift { insn_idx: usize, amount: u32 },

    #[error("instruction {insn_idx}: jump target {target} is past the end of the program")]
    JumpOutOfBounds { insn_idx: usize, target: usize },

    #[error("last instruction is not a return")]
    NoReturn,
}

/// Result type for verification operations.
pub type VerifyResult<T> = Result<T, VerifyError>;
