//! Compiler Integration Tests
//!
//! End-to-end checks of policies compiled into programs and run through the
//! interpreter.

use kernel_abi::{EPERM, O_RDONLY, OpenFlags, x86_64};
use kernel_seccomp::arch::Arch;
use kernel_seccomp::bytecode::Program;
use kernel_seccomp::compiler::{
    BuildError, CompileError, DispatchStrategy, ProgramOptions, build_program, compile,
};
use kernel_seccomp::execution::{Interpreter, SeccompExecutor, SyscallInput};
use kernel_seccomp::matcher::ValueMatcher::{self, AnyValue, EqualTo};
use kernel_seccomp::rule::{RuleError, RuleEntry, RuleSet, SyscallRule, SyscallRules, flatten};
use kernel_seccomp::verdict::Verdict;

fn verdict_of(program: &Program, input: SyscallInput) -> Verdict {
    let raw = Interpreter::new().execute(program, &input).expect("program runs");
    Verdict::from_raw(raw).expect("known verdict")
}

fn openat_read_only() -> Vec<RuleSet> {
    let rules: SyscallRules = [(
        x86_64::OPENAT,
        SyscallRule::PerArg(vec![AnyValue, AnyValue, EqualTo(O_RDONLY.into())]),
    )]
    .into_iter()
    .collect();
    vec![RuleSet::new(rules, Verdict::Allow)]
}

#[test]
fn openat_read_only_policy() {
    let built = build_program(
        Arch::X86_64,
        &openat_read_only(),
        &ProgramOptions::new(Verdict::Errno(EPERM)),
    )
    .expect("policy builds");

    let openat = SyscallInput::new(Arch::X86_64, x86_64::OPENAT).with_arg(0, 5);
    assert_eq!(verdict_of(&built.program, openat.with_arg(2, O_RDONLY.into())), Verdict::Allow);
    assert_eq!(
        verdict_of(&built.program, openat.with_arg(2, OpenFlags::WRONLY.bits().into())),
        Verdict::Errno(EPERM)
    );
    assert_eq!(
        verdict_of(&built.program, SyscallInput::new(Arch::X86_64, x86_64::CLOSE)),
        Verdict::Errno(EPERM)
    );
    assert_eq!(
        verdict_of(&built.program, SyscallInput::new(Arch::Aarch64, x86_64::OPENAT)),
        Verdict::KillProcess
    );
    assert!(built.stats.optimized_len <= built.stats.unoptimized_len);
    assert!(built.stats.corpus_len > 0);
}

#[test]
fn masked_equal_policy() {
    let rules: SyscallRules = [(
        x86_64::IOCTL,
        SyscallRule::PerArg(vec![
            AnyValue,
            ValueMatcher::MaskedEqual {
                mask: 0xf0,
                value: 0x30,
            },
        ]),
    )]
    .into_iter()
    .collect();
    let built = build_program(
        Arch::X86_64,
        &[RuleSet::new(rules, Verdict::Allow)],
        &ProgramOptions::new(Verdict::Errno(EPERM)),
    )
    .unwrap();

    let ioctl = SyscallInput::new(Arch::X86_64, x86_64::IOCTL);
    assert_eq!(verdict_of(&built.program, ioctl.with_arg(1, 0x3a)), Verdict::Allow);
    assert_eq!(verdict_of(&built.program, ioctl.with_arg(1, 0x4a)), Verdict::Errno(EPERM));
    assert_eq!(verdict_of(&built.program, ioctl.with_arg(1, (1 << 40) | 0x3a)), Verdict::Allow);
}

#[test]
fn earlier_rule_set_wins() {
    let trap: SyscallRules = [(x86_64::WRITE, SyscallRule::PerArg(vec![EqualTo(2)]))]
        .into_iter()
        .collect();
    let allow: SyscallRules = [
        (x86_64::WRITE, SyscallRule::MatchAll),
        (x86_64::READ, SyscallRule::MatchAll),
    ]
    .into_iter()
    .collect();
    let sets = [RuleSet::new(trap, Verdict::Trap(7)), RuleSet::new(allow, Verdict::Allow)];

    for strategy in [DispatchStrategy::Linear, DispatchStrategy::BinarySearch] {
        let options = ProgramOptions::new(Verdict::KillThread).dispatch(strategy);
        let program = build_program(Arch::X86_64, &sets, &options).unwrap().program;

        let write = SyscallInput::new(Arch::X86_64, x86_64::WRITE);
        assert_eq!(verdict_of(&program, write.with_arg(0, 2)), Verdict::Trap(7));
        assert_eq!(verdict_of(&program, write.with_arg(0, 1)), Verdict::Allow);
        assert_eq!(
            verdict_of(&program, SyscallInput::new(Arch::X86_64, x86_64::READ)),
            Verdict::Allow
        );
        assert_eq!(
            verdict_of(&program, SyscallInput::new(Arch::X86_64, x86_64::MMAP)),
            Verdict::KillThread
        );
    }
}

#[test]
fn compilation_is_deterministic() {
    let mut rules = SyscallRules::new();
    rules
        .add(x86_64::MMAP, SyscallRule::PerArg(vec![AnyValue, ValueMatcher::LessThan(1 << 30)]))
        .add(x86_64::MPROTECT, SyscallRule::PerArg(vec![AnyValue, AnyValue, ValueMatcher::BitsAllowlist(0x3)]))
        .add(x86_64::CLOSE, SyscallRule::PerArg(vec![ValueMatcher::NonNegativeFd]));
    let sets = [RuleSet::new(rules, Verdict::Allow)];
    let options = ProgramOptions::new(Verdict::Errno(EPERM)).hot_syscalls([x86_64::CLOSE]);

    let first = build_program(Arch::X86_64, &sets, &options).unwrap();
    let second = build_program(Arch::X86_64, &sets, &options).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        kernel_seccomp::precompiled::encode(&first.program),
        kernel_seccomp::precompiled::encode(&second.program)
    );
}

fn match_all_entries(count: u32) -> Vec<RuleEntry> {
    (0..count)
        .map(|sysno| RuleEntry {
            sysno,
            rule: SyscallRule::MatchAll,
            verdict: Verdict::Allow,
        })
        .collect()
}

#[test]
fn two_thousand_syscalls_fit_with_binary_search() {
    let entries = match_all_entries(2000);
    let options = ProgramOptions::new(Verdict::Errno(EPERM));

    let program = compile(Arch::X86_64, &entries, &options).expect("fits the budget");
    assert!(program.insn_count() <= Program::MAX_INSN_COUNT);

    let interpreter = Interpreter::new();
    for nr in [0, 999, 1999] {
        let input = SyscallInput::new(Arch::X86_64, nr);
        assert_eq!(interpreter.execute(&program, &input), Ok(Verdict::Allow.to_raw()));
    }
    assert_eq!(
        interpreter.execute(&program, &SyscallInput::new(Arch::X86_64, 2000)),
        Ok(Verdict::Errno(EPERM).to_raw())
    );
}

#[test]
fn linear_dispatch_runs_out_of_budget() {
    let entries = match_all_entries(2000);
    let options = ProgramOptions::new(Verdict::Errno(EPERM)).dispatch(DispatchStrategy::Linear);

    match compile(Arch::X86_64, &entries, &options) {
        Err(CompileError::BudgetExceeded { count, limit }) => {
            assert_eq!(limit, Program::MAX_INSN_COUNT);
            assert!(count > limit);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
}

#[test]
fn malformed_rule_aborts_the_build() {
    let rules: SyscallRules = [(x86_64::READ, SyscallRule::PerArg(vec![AnyValue; 7]))]
        .into_iter()
        .collect();
    let result = build_program(
        Arch::X86_64,
        &[RuleSet::new(rules, Verdict::Allow)],
        &ProgramOptions::new(Verdict::KillProcess),
    );
    assert!(matches!(
        result,
        Err(BuildError::Compile(CompileError::InvalidRule {
            sysno: x86_64::READ,
            source: RuleError::TooManyArguments { .. },
        }))
    ));
}

#[test]
fn flatten_keeps_set_order() {
    let first: SyscallRules = [(x86_64::WRITE, SyscallRule::MatchAll)].into_iter().collect();
    let second: SyscallRules = [(x86_64::READ, SyscallRule::MatchAll)].into_iter().collect();
    let entries = flatten(&[
        RuleSet::new(first, Verdict::Log),
        RuleSet::new(second, Verdict::Allow),
    ]);
    let order: Vec<_> = entries.iter().map(|entry| (entry.sysno, entry.verdict)).collect();
    assert_eq!(order, vec![(x86_64::WRITE, Verdict::Log), (x86_64::READ, Verdict::Allow)]);
}
