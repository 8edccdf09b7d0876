//! Optimizer Properties
//!
//! Random policies over a few syscalls and a pool of boundary constants.
//! For each one the unoptimized and optimized programs must agree with the
//! reference evaluation on the derived corpus, the optimizer must not grow
//! the program, and the corpus must execute every optimized instruction.

use kernel_abi::EPERM;
use kernel_seccomp::arch::Arch;
use kernel_seccomp::compiler::{DispatchStrategy, ProgramOptions, compile};
use kernel_seccomp::matcher::ValueMatcher;
use kernel_seccomp::optimizer::Optimizer;
use kernel_seccomp::oracle::{Corpus, Fuzzee, Oracle, Reference};
use kernel_seccomp::rule::{RuleSet, SyscallRule, SyscallRules, flatten};
use kernel_seccomp::verdict::Verdict;
use proptest::prelude::*;

const SYSCALLS: [u32; 5] = [0, 1, 3, 9, 60];

const CONSTANTS: [u64; 9] = [0, 1, 2, 0x7f, 0x80, 0xffff_ffff, 1 << 32, (1 << 32) | 0x80, u64::MAX];

fn constant() -> impl Strategy<Value = u64> {
    prop::sample::select(CONSTANTS.to_vec())
}

fn matcher() -> impl Strategy<Value = ValueMatcher> {
    let compare = (0..6u8, constant()).prop_map(|(op, v)| match op {
        0 => ValueMatcher::EqualTo(v),
        1 => ValueMatcher::NotEqualTo(v),
        2 => ValueMatcher::GreaterThan(v),
        3 => ValueMatcher::GreaterThanOrEqual(v),
        4 => ValueMatcher::LessThan(v),
        _ => ValueMatcher::LessThanOrEqual(v),
    });
    prop_oneof![
        1 => Just(ValueMatcher::AnyValue),
        6 => compare,
        2 => (constant(), constant()).prop_map(|(mask, value)| ValueMatcher::MaskedEqual { mask, value }),
        1 => constant().prop_map(ValueMatcher::BitsAllowlist),
        1 => constant().prop_map(ValueMatcher::BitsDenylist),
        1 => Just(ValueMatcher::NonNegativeFd),
    ]
}

fn rule() -> impl Strategy<Value = SyscallRule> {
    let leaf = prop_oneof![
        1 => Just(SyscallRule::MatchAll),
        5 => prop::collection::vec(matcher(), 1..=3).prop_map(SyscallRule::PerArg),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..=3).prop_map(SyscallRule::Or),
            prop::collection::vec(inner, 0..=3).prop_map(SyscallRule::And),
        ]
    })
}

fn verdict() -> impl Strategy<Value = Verdict> {
    prop::sample::select(vec![
        Verdict::Allow,
        Verdict::Errno(EPERM),
        Verdict::Trap(1),
        Verdict::Log,
    ])
}

fn rule_set() -> impl Strategy<Value = RuleSet> {
    (
        prop::collection::vec((prop::sample::select(SYSCALLS.to_vec()), rule()), 1..=3),
        verdict(),
    )
        .prop_map(|(rules, action)| {
            let mut set = SyscallRules::new();
            for (sysno, rule) in rules {
                set.add(sysno, rule);
            }
            RuleSet::new(set, action)
        })
}

fn options() -> impl Strategy<Value = ProgramOptions> {
    (any::<bool>(), any::<bool>()).prop_map(|(linear, hot)| {
        let mut options = ProgramOptions::new(Verdict::KillThread);
        if linear {
            options = options.dispatch(DispatchStrategy::Linear);
        }
        if hot {
            options = options.hot_syscalls([SYSCALLS[1]]);
        }
        options
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn optimized_programs_match_the_policy(
        rule_sets in prop::collection::vec(rule_set(), 1..=3),
        options in options(),
        aarch64 in any::<bool>(),
    ) {
        let arch = if aarch64 { Arch::Aarch64 } else { Arch::X86_64 };
        let entries = flatten(&rule_sets);
        let unoptimized = compile(arch, &entries, &options).expect("policy compiles");
        let corpus = Corpus::derive(arch, &entries);
        let optimized = Optimizer::new()
            .with_corpus(corpus.clone())
            .run(&unoptimized)
            .expect("optimizer succeeds")
            .program;
        prop_assert!(
            optimized.insn_count() <= unoptimized.insn_count(),
            "optimizer grew the program from {} to {}",
            unoptimized.insn_count(),
            optimized.insn_count()
        );

        let reference = Reference::new(arch, entries, options.default_verdict, options.bad_arch_verdict);
        let result = Oracle::new(vec![
            Fuzzee::new("unoptimized", unoptimized),
            Fuzzee::new("optimized", optimized).with_full_coverage(),
        ])
        .with_reference(reference)
        .run(&corpus);
        prop_assert!(result.is_ok(), "{result:?}");
    }
}
