//! Seccomp-BPF Filter Compiler
//!
//! This crate turns a declarative syscall policy into a classic BPF program
//! that the host kernel's seccomp facility can enforce, and proves that every
//! transformation it applies along the way preserves the policy's verdicts.
//!
//! # Pipeline
//!
//! ```text
//! RuleSet[] ──compile──▶ Program ──optimize──▶ Program
//!                           │                     │
//!                           └──── Oracle (run both over a Corpus) ────┘
//!                                                 │
//!                                      codec::encode / registry
//! ```
//!
//! # Modules
//!
//! - [`matcher`] - Predicates over a single 64-bit syscall argument
//! - [`rule`] - Composition of matchers into per-syscall rules
//! - [`verdict`] - `SECCOMP_RET_*` actions
//! - [`arch`] - Architecture tags and their audit values
//! - [`bytecode`] - Classic BPF instructions, programs and the label assembler
//! - [`verifier`] - Static checks every program must pass before it exists
//! - [`compiler`] - Lowering of rules into a program under the instruction budget
//! - [`optimizer`] - Verdict-preserving program shrinking
//! - [`execution`] - Interpreter over `seccomp_data`
//! - [`oracle`] - Equivalence checking and corpus derivation
//! - [`precompiled`] - Binary codec, variable substitution and the program registry
//!
//! # Quick Start
//!
//! ```ignore
//! use kernel_abi::{x86_64, EPERM, O_ACCMODE, O_RDONLY};
//! use kernel_seccomp::arch::Arch;
//! use kernel_seccomp::compiler::{build_program, ProgramOptions};
//! use kernel_seccomp::matcher::ValueMatcher;
//! use kernel_seccomp::rule::{RuleSet, SyscallRule, SyscallRules};
//! use kernel_seccomp::verdict::Verdict;
//!
//! let mut rules = SyscallRules::new();
//! rules.add(
//!     x86_64::OPENAT,
//!     SyscallRule::PerArg(vec![
//!         ValueMatcher::AnyValue,
//!         ValueMatcher::AnyValue,
//!         ValueMatcher::MaskedEqual { mask: O_ACCMODE as u64, value: O_RDONLY as u64 },
//!     ]),
//! );
//!
//! let built = build_program(
//!     Arch::X86_64,
//!     &[RuleSet::new(rules, Verdict::Allow)],
//!     &ProgramOptions::new(Verdict::Errno(EPERM)),
//! )?;
//! ```

#![no_std]

extern crate alloc;

pub mod arch;
pub mod bytecode;
pub mod compiler;
pub mod execution;
pub mod matcher;
pub mod optimizer;
pub mod oracle;
pub mod precompiled;
pub mod rule;
pub mod verdict;
pub mod verifier;
