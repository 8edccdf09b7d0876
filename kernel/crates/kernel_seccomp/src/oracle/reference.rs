//! Direct evaluation of a policy, without compiling it.

extern crate alloc;

use alloc::vec::Vec;

use kernel_abi::__X32_SYSCALL_BIT;

use crate::arch::Arch;
use crate::execution::SyscallInput;
use crate::rule::{RuleEntry, first_match};
use crate::verdict::Verdict;

/// The verdict a compiled program must produce for every input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    arch: Arch,
    entries: Vec<RuleEntry>,
    default_verdict: Verdict,
    bad_arch_verdict: Verdict,
}

impl Reference {
    pub fn new(arch: Arch, entries: Vec<RuleEntry>, default_verdict: Verdict, bad_arch_verdict: Verdict) -> Self {
        Self {
            arch,
            entries,
            default_verdict,
            bad_arch_verdict,
        }
    }

    pub fn evaluate(&self, input: &SyscallInput) -> Verdict {
        if input.arch != self.arch.audit_value() {
            return self.bad_arch_verdict;
        }
        if self.arch.has_x32_abi() && input.nr >= __X32_SYSCALL_BIT {
            return self.bad_arch_verdict;
        }
        first_match(&self.entries, input.nr, &input.args).unwrap_or(self.default_verdict)
    }
}
