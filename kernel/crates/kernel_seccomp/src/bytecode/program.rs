//! Seccomp Program Representation
//!
//! A [`Program`] is an instruction stream that has passed the verifier,
//! tagged with the architecture it filters and the verdict it falls back to.
//! There is no way to build one that skips verification.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use kernel_abi::BPF_MAXINSNS;

use super::insn::Instruction;
use crate::arch::Arch;
use crate::verdict::Verdict;
use crate::verifier::{Verifier, VerifyResult};

/// Validated seccomp program.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Program {
    arch: Arch,
    default_verdict: Verdict,
    insns: Vec<Instruction>,
}

impl Program {
    /// Maximum instruction count the kernel accepts.
    pub const MAX_INSN_COUNT: usize = BPF_MAXINSNS;

    /// Create a program, verifying the instruction stream.
    ///
    /// # Errors
    ///
    /// Returns the first [`VerifyError`](crate::verifier::VerifyError) found.
    pub fn new(arch: Arch, default_verdict: Verdict, insns: Vec<Instruction>) -> VerifyResult<Self> {
        Verifier::verify(&insns)?;
        Ok(Self {
            arch,
            default_verdict,
            insns,
        })
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[inline]
    pub fn default_verdict(&self) -> Verdict {
        self.default_verdict
    }

    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    #[inline]
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Replace the instruction stream, keeping the tags.
    pub fn with_instructions(&self, insns: Vec<Instruction>) -> VerifyResult<Self> {
        Self::new(self.arch, self.default_verdict, insns)
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.insns
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("arch", &self.arch)
            .field("default_verdict", &self.default_verdict)
            .field("insn_count", &self.insns.len())
            .finish()
    }
}

/// Disassembly listing, one instruction per line.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; arch={} default={} insns={}",
            self.arch,
            self.default_verdict,
            self.insns.len()
        )?;
        for (idx, insn) in self.insns.iter().enumerate() {
            writeln!(f, "{idx:4}: {insn}")?;
        }
        Ok(())
    }
}
