//! Optimizer Equivalence Tests
//!
//! Every policy here is compiled, optimized and run through the oracle over
//! its derived corpus, with the reference evaluation as the baseline.

use kernel_abi::{EPERM, O_ACCMODE, O_RDONLY, aarch64, x86_64};
use kernel_seccomp::arch::Arch;
use kernel_seccomp::bytecode::Program;
use kernel_seccomp::compiler::{DispatchStrategy, ProgramOptions, compile};
use kernel_seccomp::execution::SyscallInput;
use kernel_seccomp::matcher::ValueMatcher::{
    AnyValue, BitsAllowlist, BitsDenylist, EqualTo, GreaterThan, LessThanOrEqual, MaskedEqual,
    NonNegativeFd, NotEqualTo,
};
use kernel_seccomp::optimizer::{Optimizer, optimize};
use kernel_seccomp::oracle::{Corpus, CoverageReport, Fuzzee, Oracle, OracleError, Reference};
use kernel_seccomp::rule::{RuleEntry, SyscallRule};
use kernel_seccomp::verdict::Verdict;

fn entry(sysno: u32, rule: SyscallRule, verdict: Verdict) -> RuleEntry {
    RuleEntry {
        sysno,
        rule,
        verdict,
    }
}

/// Compile and optimize `entries`, then check both programs against the
/// policy over the derived corpus.
fn check(arch: Arch, entries: &[RuleEntry], options: &ProgramOptions, full_coverage: bool) -> CoverageReport {
    let unoptimized = compile(arch, entries, options).expect("policy compiles");
    let corpus = Corpus::derive(arch, entries);
    let optimized = Optimizer::new()
        .with_corpus(corpus.clone())
        .run(&unoptimized)
        .expect("optimizer succeeds")
        .program;
    assert!(
        optimized.insn_count() <= unoptimized.insn_count(),
        "optimizer grew the program from {} to {}",
        unoptimized.insn_count(),
        optimized.insn_count()
    );

    let mut optimized = Fuzzee::new("optimized", optimized);
    if full_coverage {
        optimized = optimized.with_full_coverage();
    }
    let reference = Reference::new(
        arch,
        entries.to_vec(),
        options.default_verdict,
        options.bad_arch_verdict,
    );
    Oracle::new(vec![Fuzzee::new("unoptimized", unoptimized), optimized])
        .with_reference(reference)
        .run(&corpus)
        .expect("programs agree with the policy")
}

fn sandbox_policy() -> Vec<RuleEntry> {
    vec![
        entry(x86_64::READ, SyscallRule::PerArg(vec![NonNegativeFd]), Verdict::Allow),
        entry(
            x86_64::WRITE,
            SyscallRule::Or(vec![
                SyscallRule::PerArg(vec![EqualTo(1)]),
                SyscallRule::PerArg(vec![EqualTo(2)]),
            ]),
            Verdict::Allow,
        ),
        entry(x86_64::WRITE, SyscallRule::MatchAll, Verdict::Errno(EPERM)),
        entry(
            x86_64::OPENAT,
            SyscallRule::PerArg(vec![
                AnyValue,
                AnyValue,
                MaskedEqual {
                    mask: O_ACCMODE.into(),
                    value: O_RDONLY.into(),
                },
            ]),
            Verdict::Allow,
        ),
        entry(
            x86_64::MMAP,
            SyscallRule::And(vec![
                SyscallRule::PerArg(vec![AnyValue, LessThanOrEqual(1 << 32)]),
                SyscallRule::PerArg(vec![AnyValue, AnyValue, BitsAllowlist(0x7)]),
            ]),
            Verdict::Allow,
        ),
        entry(x86_64::MPROTECT, SyscallRule::PerArg(vec![AnyValue, AnyValue, BitsDenylist(0x4)]), Verdict::Allow),
        entry(x86_64::MUNMAP, SyscallRule::PerArg(vec![NotEqualTo(0)]), Verdict::Allow),
        entry(x86_64::LSEEK, SyscallRule::PerArg(vec![AnyValue, GreaterThan(0xffff_ffff)]), Verdict::Trap(1)),
        entry(x86_64::CLOSE, SyscallRule::MatchAll, Verdict::Allow),
        entry(x86_64::FSTAT, SyscallRule::MatchAll, Verdict::Allow),
        entry(x86_64::BRK, SyscallRule::MatchAll, Verdict::Allow),
    ]
}

#[test]
fn sandbox_policy_binary_search() {
    let report = check(
        Arch::X86_64,
        &sandbox_policy(),
        &ProgramOptions::new(Verdict::Errno(EPERM)),
        true,
    );
    assert!(report.inputs > 100);
    let optimized = &report.programs[1];
    assert_eq!(optimized.covered, optimized.total);
}

#[test]
fn sandbox_policy_linear_with_hot_syscalls() {
    let options = ProgramOptions::new(Verdict::KillProcess)
        .dispatch(DispatchStrategy::Linear)
        .hot_syscalls([x86_64::WRITE, x86_64::READ]);
    check(Arch::X86_64, &sandbox_policy(), &options, true);
}

#[test]
fn openat_policy_is_fully_covered() {
    let entries = [entry(
        x86_64::OPENAT,
        SyscallRule::PerArg(vec![AnyValue, AnyValue, EqualTo(O_RDONLY.into())]),
        Verdict::Allow,
    )];
    let report = check(Arch::X86_64, &entries, &ProgramOptions::new(Verdict::Errno(EPERM)), true);
    let optimized = &report.programs[1];
    assert_eq!(optimized.covered, optimized.total);
}

#[test]
fn plain_allowlist_is_fully_covered() {
    let entries: Vec<_> = [aarch64::READ, aarch64::WRITE, aarch64::CLOSE, aarch64::OPENAT]
        .into_iter()
        .map(|sysno| entry(sysno, SyscallRule::MatchAll, Verdict::Allow))
        .collect();
    check(Arch::Aarch64, &entries, &ProgramOptions::new(Verdict::KillThread), true);
}

#[test]
fn contiguous_syscalls_are_consolidated() {
    // Ten neighbouring numbers with one verdict collapse into a range test.
    let entries: Vec<_> = (100..110)
        .map(|sysno| entry(sysno, SyscallRule::MatchAll, Verdict::Allow))
        .collect();
    let options = ProgramOptions::new(Verdict::Errno(EPERM)).dispatch(DispatchStrategy::Linear);
    let unoptimized = compile(Arch::Riscv64, &entries, &options).unwrap();
    let optimized = optimize(&unoptimized).unwrap();
    assert!(optimized.insn_count() < unoptimized.insn_count());
    check(Arch::Riscv64, &entries, &options, true);
}

#[test]
fn oracle_catches_a_wrong_program() {
    let entries = [entry(x86_64::READ, SyscallRule::MatchAll, Verdict::Allow)];
    let options = ProgramOptions::new(Verdict::Errno(EPERM));
    let good = compile(Arch::X86_64, &entries, &options).unwrap();
    let bad = compile(Arch::X86_64, &[], &options).unwrap();

    let result = Oracle::new(vec![Fuzzee::new("good", good), Fuzzee::new("bad", bad)])
        .run(&Corpus::derive(Arch::X86_64, &entries));
    match result {
        Err(OracleError::Mismatch { input, program, .. }) => {
            assert_eq!(input.nr, x86_64::READ);
            assert_eq!(program, "bad");
        }
        other => panic!("expected a mismatch, got {other:?}"),
    }
}

#[test]
fn single_inputs_can_be_checked() {
    let entries = sandbox_policy();
    let options = ProgramOptions::new(Verdict::Errno(EPERM));
    let program: Program = compile(Arch::X86_64, &entries, &options).unwrap();
    let mut oracle = Oracle::new(vec![
        Fuzzee::new("unoptimized", program.clone()),
        Fuzzee::new("optimized", optimize(&program).unwrap()),
    ]);

    let write = SyscallInput::new(Arch::X86_64, x86_64::WRITE);
    assert_eq!(oracle.check(&write.with_arg(0, 1)), Ok(Verdict::Allow.to_raw()));
    assert_eq!(oracle.check(&write.with_arg(0, 7)), Ok(Verdict::Errno(EPERM).to_raw()));
    assert_eq!(oracle.finish().unwrap().inputs, 2);
}
