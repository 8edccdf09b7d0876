//! Rule Compiler
//!
//! Lowers a flattened policy into a verified [`Program`]:
//!
//! ```text
//!   ld  [arch]
//!   jeq AUDIT_ARCH        ; otherwise bad_arch_verdict
//!   ld  [nr]
//!   jge X32_SYSCALL_BIT   ; x86-64 only, otherwise bad_arch_verdict
//!   jeq hot syscalls      ; inlined blocks
//!   dispatch              ; linear or binary search
//!   blocks                ; one per syscall, first match wins
//! ```
//!
//! [`build_program`] wraps compilation with optimization and an equivalence
//! check of both programs against the rule semantics.

extern crate alloc;

mod dispatch;
mod lower;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

pub use dispatch::LEAF_SIZE;
use kernel_abi::{__X32_SYSCALL_BIT, BPF_MAXINSNS, SECCOMP_DATA_ARCH_OFFSET, SECCOMP_DATA_NR_OFFSET};
use log::{debug, trace};
use thiserror::Error;

use crate::arch::Arch;
use crate::bytecode::builder::{BuilderError, ProgramBuilder};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::JmpOp;
use crate::bytecode::program::Program;
use crate::optimizer::{OptimizeError, Optimizer};
use crate::oracle::{Corpus, Fuzzee, Oracle, OracleError, Reference};
use crate::rule::{RuleEntry, RuleError, RuleSet, SyscallRule, flatten};
use crate::verdict::Verdict;
use crate::verifier::VerifyError;

/// Errors produced by [`compile`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("invalid rule for syscall {sysno}")]
    InvalidRule {
        sysno: u32,
        #[source]
        source: RuleError,
    },

    #[error("program needs {count} instructions, the limit is {limit}")]
    BudgetExceeded { count: usize, limit: usize },

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Errors produced by [`build_program`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("optimization failed: {0}")]
    Optimize(#[from] OptimizeError),

    #[error("equivalence check failed: {0}")]
    Oracle(#[from] OracleError),
}

/// How the syscall number selects a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// One `jeq` per syscall number.
    Linear,
    /// `jge` tree down to short `jeq` chains.
    #[default]
    BinarySearch,
}

/// Options controlling program generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOptions {
    /// Verdict for syscalls no rule matches.
    pub default_verdict: Verdict,
    /// Verdict for a foreign architecture or, on x86-64, an x32 syscall.
    pub bad_arch_verdict: Verdict,
    /// Syscalls tested before dispatch, in this order.
    pub hot_syscalls: Vec<u32>,
    pub dispatch: DispatchStrategy,
    pub optimize: bool,
    /// Run the equivalence oracle in [`build_program`].
    pub verify: bool,
}

impl ProgramOptions {
    pub fn new(default_verdict: Verdict) -> Self {
        Self {
            default_verdict,
            bad_arch_verdict: Verdict::KillProcess,
            hot_syscalls: Vec::new(),
            dispatch: DispatchStrategy::default(),
            optimize: true,
            verify: true,
        }
    }

    pub fn bad_arch_verdict(mut self, verdict: Verdict) -> Self {
        self.bad_arch_verdict = verdict;
        self
    }

    pub fn hot_syscalls(mut self, sysnos: impl IntoIterator<Item = u32>) -> Self {
        self.hot_syscalls = sysnos.into_iter().collect();
        self
    }

    pub fn dispatch(mut self, strategy: DispatchStrategy) -> Self {
        self.dispatch = strategy;
        self
    }

    pub fn optimize(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    pub fn verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }
}

/// A simplified rule and the verdict it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Arm {
    rule: SyscallRule,
    verdict: Verdict,
}

/// Compile `entries`, in priority order, into a program for `arch`.
pub fn compile(arch: Arch, entries: &[RuleEntry], options: &ProgramOptions) -> Result<Program, CompileError> {
    let mut groups: BTreeMap<u32, Vec<Arm>> = BTreeMap::new();
    for entry in entries {
        entry
            .rule
            .validate()
            .map_err(|source| CompileError::InvalidRule {
                sysno: entry.sysno,
                source,
            })?;
        groups.entry(entry.sysno).or_default().push(Arm {
            rule: entry.rule.clone().simplify(),
            verdict: entry.verdict,
        });
    }

    let default = options.default_verdict;
    let mut b = ProgramBuilder::new(arch, default);
    let max_nr = emit_prologue(&mut b, arch, options.bad_arch_verdict);

    for &sysno in &options.hot_syscalls {
        let Some(arms) = groups.remove(&sysno) else {
            continue;
        };
        let (body, next) = (b.new_label(), b.new_label());
        b.jump(JmpOp::Jeq, sysno, body, next).bind(body);
        dispatch::emit_block(&mut b, &arms, default);
        b.bind(next);
    }

    // Numbers above max_nr never reach dispatch.
    let remaining: Vec<dispatch::Group<'_>> = groups
        .range(..=max_nr)
        .map(|(&sysno, arms)| (sysno, arms.as_slice()))
        .collect();
    match options.dispatch {
        DispatchStrategy::Linear => dispatch::emit_linear(&mut b, &remaining, default),
        DispatchStrategy::BinarySearch => dispatch::emit_tree(&mut b, &remaining, 0, max_nr, default),
    }

    let insns = b.assemble()?;
    if insns.len() > BPF_MAXINSNS {
        return Err(CompileError::BudgetExceeded {
            count: insns.len(),
            limit: BPF_MAXINSNS,
        });
    }
    trace!("compiled {} entries into {} instructions", entries.len(), insns.len());
    Ok(Program::new(arch, default, insns)?)
}

/// Check the architecture and leave the syscall number in `A`. Returns the
/// largest number that reaches dispatch.
fn emit_prologue(b: &mut ProgramBuilder, arch: Arch, bad_arch: Verdict) -> u32 {
    let (ok, bad) = (b.new_label(), b.new_label());
    b.stmt(Instruction::load_abs(SECCOMP_DATA_ARCH_OFFSET))
        .jump(JmpOp::Jeq, arch.audit_value(), ok, bad);

    if arch.has_x32_abi() {
        let dispatch = b.new_label();
        b.bind(ok)
            .stmt(Instruction::load_abs(SECCOMP_DATA_NR_OFFSET))
            .jump(JmpOp::Jge, __X32_SYSCALL_BIT, bad, dispatch)
            .bind(bad)
            .ret(bad_arch)
            .bind(dispatch);
        __X32_SYSCALL_BIT - 1
    } else {
        b.bind(bad)
            .ret(bad_arch)
            .bind(ok)
            .stmt(Instruction::load_abs(SECCOMP_DATA_NR_OFFSET));
        u32::MAX
    }
}

/// Size and optimization figures for one built program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildStats {
    pub unoptimized_len: usize,
    pub optimized_len: usize,
    pub optimizer_rounds: usize,
    /// Number of inputs the oracle ran, zero when verification is off.
    pub corpus_len: usize,
}

/// A built program together with how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltProgram {
    pub program: Program,
    pub stats: BuildStats,
}

/// A complete policy for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub arch: Arch,
    pub rule_sets: Vec<RuleSet>,
    pub options: ProgramOptions,
}

impl Policy {
    pub fn new(arch: Arch, rule_sets: Vec<RuleSet>, options: ProgramOptions) -> Self {
        Self {
            arch,
            rule_sets,
            options,
        }
    }

    /// Compile without optimizing or checking.
    pub fn compile(&self) -> Result<Program, CompileError> {
        compile(self.arch, &flatten(&self.rule_sets), &self.options)
    }

    /// See [`build_program`].
    pub fn build(&self) -> Result<BuiltProgram, BuildError> {
        build_program(self.arch, &self.rule_sets, &self.options)
    }
}

/// Flatten `rule_sets`, compile, optimize and check equivalence.
pub fn build_program(
    arch: Arch,
    rule_sets: &[RuleSet],
    options: &ProgramOptions,
) -> Result<BuiltProgram, BuildError> {
    let entries = flatten(rule_sets);
    let unoptimized = compile(arch, &entries, options)?;

    let mut stats = BuildStats {
        unoptimized_len: unoptimized.insn_count(),
        ..BuildStats::default()
    };

    let program = if options.optimize {
        let optimized = Optimizer::new().run(&unoptimized)?;
        stats.optimizer_rounds = optimized.rounds;
        optimized.program
    } else {
        unoptimized.clone()
    };
    stats.optimized_len = program.insn_count();

    if options.verify {
        let corpus = Corpus::derive(arch, &entries);
        stats.corpus_len = corpus.len();

        let reference = Reference::new(arch, entries, options.default_verdict, options.bad_arch_verdict);
        let mut fuzzees = alloc::vec![Fuzzee::new("unoptimized", unoptimized)];
        if options.optimize {
            fuzzees.push(Fuzzee::new("optimized", program.clone()));
        }
        Oracle::new(fuzzees)
            .with_reference(reference)
            .run(&corpus)?;
    }

    debug!(
        "built {arch} program: {} -> {} instructions in {} rounds, {} inputs checked",
        stats.unoptimized_len, stats.optimized_len, stats.optimizer_rounds, stats.corpus_len
    );
    Ok(BuiltProgram { program, stats })
}
