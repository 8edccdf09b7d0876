//! Classic BPF Bytecode Core
//!
//! This module implements the subset of the classic BPF instruction set that
//! seccomp accepts.
//!
//! # Machine Model
//!
//! - 32-bit accumulator `A` and index register `X`
//! - 16 words of scratch memory `M[0..16]`
//! - Read-only input: the 64-byte `struct seccomp_data`
//! - 8-byte instructions, forward-only jumps, at most 4096 per program

pub mod builder;
pub mod insn;
pub mod opcode;
pub mod program;

pub use builder::{BuilderError, Label, ProgramBuilder};
pub use insn::Instruction;
pub use opcode::{AluOp, JmpOp, OpcodeClass, Operation, Source};
pub use program::Program;
