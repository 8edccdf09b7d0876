//! Corpus Derivation
//!
//! Inputs are chosen from the policy itself: every syscall number it names
//! and its neighbours, and for every matcher the values where its outcome
//! flips. Those values are tried one slot at a time on top of anchor
//! assignments, and crossed against each other when the product stays
//! small.
//!
//! Anchors follow the decision paths of a syscall's rules in priority
//! order: every way of failing the earlier rules, joined with every way
//! through the next one. Each path is a list of matcher outcomes per slot;
//! a small repair search turns it into concrete arguments or drops it as
//! infeasible.

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use itertools::Itertools;
use kernel_abi::{__X32_SYSCALL_BIT, AT_FDCWD, SECCOMP_DATA_ARGS};

use crate::arch::Arch;
use crate::execution::SyscallInput;
use crate::matcher::ValueMatcher;
use crate::rule::{RuleEntry, SyscallRule};

/// Largest cross product of per-slot values added for one syscall.
pub const MAX_CROSS_PRODUCT: usize = 4096;

/// Most decision paths followed per rule and per syscall.
pub const MAX_PATHS: usize = 64;

/// Repairs tried on one slot value before giving up.
const MAX_REPAIRS: usize = 8;

const HALF: u64 = 1 << 32;
const LO_HALF: u64 = HALF - 1;

/// Deduplicated, ordered set of inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    inputs: BTreeSet<SyscallInput>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `input`, returning whether it was new.
    pub fn insert(&mut self, input: SyscallInput) -> bool {
        self.inputs.insert(input)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyscallInput> {
        self.inputs.iter()
    }

    /// Inputs exercising every decision a program compiled from `entries`
    /// for `arch` makes.
    pub fn derive(arch: Arch, entries: &[RuleEntry]) -> Self {
        let mut corpus = Self::new();
        let sysnos: BTreeSet<u32> = entries.iter().map(|entry| entry.sysno).collect();

        let mut numbers = BTreeSet::from([0, u32::MAX]);
        for &nr in &sysnos {
            numbers.insert(nr);
            numbers.extend(nr.checked_sub(1));
            numbers.extend(nr.checked_add(1));
            if arch.has_x32_abi() {
                numbers.insert(nr | __X32_SYSCALL_BIT);
            }
        }
        for &nr in &numbers {
            corpus.insert(SyscallInput::new(arch, nr));
            corpus.insert(SyscallInput::new(arch.foreign(), nr));
        }

        for &sysno in &sysnos {
            corpus.derive_arguments(arch, sysno, entries);
        }
        corpus
    }

    fn derive_arguments(&mut self, arch: Arch, sysno: u32, entries: &[RuleEntry]) {
        let rules: Vec<SyscallRule> = entries
            .iter()
            .filter(|entry| entry.sysno == sysno)
            .map(|entry| entry.rule.clone().simplify())
            .collect();

        let mut candidates: [BTreeSet<u64>; SECCOMP_DATA_ARGS] = Default::default();
        for rule in &rules {
            for leaf in rule.per_arg_leaves() {
                for (slot, matcher) in leaf.iter().enumerate().take(SECCOMP_DATA_ARGS) {
                    candidates[slot].extend(probe_values(matcher));
                }
            }
        }
        if candidates.iter().all(BTreeSet::is_empty) {
            return;
        }

        let base = SyscallInput::new(arch, sysno);
        for (path, anchor) in anchors(&rules) {
            self.insert(base.with_args(anchor));
            for (slot, values) in candidates.iter().enumerate() {
                let constraints = slot_constraints(&path, slot);
                for &value in values {
                    let mut args = anchor;
                    args[slot] = value;
                    self.insert(base.with_args(args));
                    if let Some(repaired) = solve_slot(&constraints, value) {
                        args[slot] = repaired;
                        self.insert(base.with_args(args));
                    }
                }
            }
        }

        let slots: Vec<usize> = (0..SECCOMP_DATA_ARGS)
            .filter(|&slot| !candidates[slot].is_empty())
            .collect();
        let product = slots
            .iter()
            .try_fold(1usize, |acc, &slot| acc.checked_mul(candidates[slot].len()));
        if slots.is_empty() || product.is_none_or(|size| size > MAX_CROSS_PRODUCT) {
            return;
        }
        for combo in slots
            .iter()
            .map(|&slot| candidates[slot].iter().copied())
            .multi_cartesian_product()
        {
            let mut args = [0u64; SECCOMP_DATA_ARGS];
            for (&slot, value) in slots.iter().zip(combo) {
                args[slot] = value;
            }
            self.insert(base.with_args(args));
        }
    }
}

impl Extend<SyscallInput> for Corpus {
    fn extend<I: IntoIterator<Item = SyscallInput>>(&mut self, iter: I) {
        self.inputs.extend(iter);
    }
}

impl FromIterator<SyscallInput> for Corpus {
    fn from_iter<I: IntoIterator<Item = SyscallInput>>(iter: I) -> Self {
        Self {
            inputs: iter.into_iter().collect(),
        }
    }
}

/// Required matcher outcomes, as `(slot, matcher, outcome)`.
type Path = Vec<(usize, ValueMatcher, bool)>;

/// One solved assignment per feasible path through the prioritized
/// `rules`, starting with the all-zero one.
fn anchors(rules: &[SyscallRule]) -> Vec<(Path, [u64; SECCOMP_DATA_ARGS])> {
    let mut anchors = vec![(Path::new(), [0; SECCOMP_DATA_ARGS])];
    // Ways of failing every rule so far.
    let mut reach = vec![Path::new()];
    for rule in rules {
        let paths = rule_paths(rule);
        let mut next = Vec::new();
        for prefix in &reach {
            for (path, outcome) in &paths {
                let joined = concat(prefix, path);
                let Some(args) = solve(&joined) else {
                    continue;
                };
                if !outcome && next.len() < MAX_PATHS {
                    next.push(joined.clone());
                }
                anchors.push((joined, args));
            }
        }
        reach = next;
    }
    anchors
}

/// Every feasible way through `rule`, each with the rule's outcome.
fn rule_paths(rule: &SyscallRule) -> Vec<(Path, bool)> {
    match rule {
        SyscallRule::MatchAll => vec![(Path::new(), true)],
        SyscallRule::PerArg(matchers) => {
            let mut paths = Vec::new();
            let mut prefix = Path::new();
            for (slot, &matcher) in matchers.iter().enumerate().filter(|(_, m)| !m.is_any()) {
                let mut failed = prefix.clone();
                failed.push((slot, matcher, false));
                paths.push((failed, false));
                prefix.push((slot, matcher, true));
            }
            paths.push((prefix, true));
            paths.retain(|(path, _)| solve(path).is_some());
            paths
        }
        SyscallRule::Or(rules) => short_circuit(rules, true),
        SyscallRule::And(rules) => short_circuit(rules, false),
    }
}

/// Paths through `rules` evaluated in order until one yields `stop`.
fn short_circuit(rules: &[SyscallRule], stop: bool) -> Vec<(Path, bool)> {
    let mut done = Vec::new();
    let mut pending = vec![Path::new()];
    for rule in rules {
        let paths = rule_paths(rule);
        let mut next = Vec::new();
        for prefix in &pending {
            for (path, outcome) in &paths {
                let joined = concat(prefix, path);
                if solve(&joined).is_none() {
                    continue;
                }
                if *outcome == stop {
                    if done.len() < MAX_PATHS {
                        done.push((joined, stop));
                    }
                } else if next.len() < MAX_PATHS {
                    next.push(joined);
                }
            }
        }
        pending = next;
    }
    done.extend(pending.into_iter().map(|path| (path, !stop)));
    done
}

fn concat(prefix: &[(usize, ValueMatcher, bool)], path: &[(usize, ValueMatcher, bool)]) -> Path {
    prefix.iter().chain(path).copied().collect()
}

fn slot_constraints(path: &[(usize, ValueMatcher, bool)], slot: usize) -> Vec<(ValueMatcher, bool)> {
    path.iter()
        .filter(|&&(s, _, _)| s == slot)
        .map(|&(_, matcher, outcome)| (matcher, outcome))
        .collect()
}

/// Arguments meeting every outcome `path` requires, if any were found.
fn solve(path: &[(usize, ValueMatcher, bool)]) -> Option<[u64; SECCOMP_DATA_ARGS]> {
    let mut args = [0u64; SECCOMP_DATA_ARGS];
    for (slot, arg) in args.iter_mut().enumerate() {
        let constraints = slot_constraints(path, slot);
        if constraints.is_empty() {
            continue;
        }
        let mut starts = BTreeSet::from([0]);
        for (matcher, _) in &constraints {
            starts.extend(probe_values(matcher));
        }
        *arg = starts
            .into_iter()
            .find_map(|start| solve_slot(&constraints, start))?;
    }
    Some(args)
}

/// Walk from `start` towards a value meeting all `constraints`.
fn solve_slot(constraints: &[(ValueMatcher, bool)], start: u64) -> Option<u64> {
    let mut x = start;
    for _ in 0..MAX_REPAIRS {
        let Some(&(matcher, outcome)) = constraints
            .iter()
            .find(|(matcher, outcome)| matcher.matches(x) != *outcome)
        else {
            return Some(x);
        };
        x = repair(&matcher, outcome, x)?;
    }
    constraints
        .iter()
        .all(|(matcher, outcome)| matcher.matches(x) == *outcome)
        .then_some(x)
}

fn lowest_bit(bits: u64) -> Option<u64> {
    (bits != 0).then(|| bits & bits.wrapping_neg())
}

/// `x` changed as little as possible so that `matcher` yields `outcome`.
fn repair(matcher: &ValueMatcher, outcome: bool, x: u64) -> Option<u64> {
    match (*matcher, outcome) {
        (ValueMatcher::AnyValue, true) => Some(x),
        (ValueMatcher::AnyValue, false) => None,
        (ValueMatcher::EqualTo(v), true) | (ValueMatcher::NotEqualTo(v), false) => Some(v),
        (ValueMatcher::EqualTo(v), false) | (ValueMatcher::NotEqualTo(v), true) => Some(v ^ 1),
        (ValueMatcher::GreaterThan(v), true) | (ValueMatcher::LessThanOrEqual(v), false) => v.checked_add(1),
        (ValueMatcher::GreaterThan(v), false)
        | (ValueMatcher::LessThanOrEqual(v), true)
        | (ValueMatcher::GreaterThanOrEqual(v), true)
        | (ValueMatcher::LessThan(v), false) => Some(v),
        (ValueMatcher::GreaterThanOrEqual(v), false) | (ValueMatcher::LessThan(v), true) => v.checked_sub(1),
        (ValueMatcher::MaskedEqual { mask, value }, true) => Some((x & !mask) | (value & mask)),
        (ValueMatcher::MaskedEqual { mask, .. }, false) => lowest_bit(mask).map(|bit| x ^ bit),
        (ValueMatcher::BitsAllowlist(mask), true) => Some(x & mask),
        (ValueMatcher::BitsAllowlist(mask), false) => lowest_bit(!mask).map(|bit| x | bit),
        (ValueMatcher::BitsDenylist(mask), true) => Some(x & !mask),
        (ValueMatcher::BitsDenylist(mask), false) => lowest_bit(mask).map(|bit| x | bit),
        (ValueMatcher::NonNegativeFd, true) => Some(x & 0x7fff_ffff),
        (ValueMatcher::NonNegativeFd, false) => Some(x | 0x8000_0000),
    }
}

fn around(out: &mut Vec<u64>, v: u64) {
    out.push(v);
    out.extend(v.checked_add(1));
    out.extend(v.checked_sub(1));
    out.extend(v.checked_add(HALF));
    out.extend(v.checked_sub(HALF));
}

/// `value` with the lowest bit of `bits` flipped, once per 32-bit half.
fn half_flips(value: u64, bits: u64) -> impl Iterator<Item = u64> {
    [bits & LO_HALF, bits & !LO_HALF]
        .into_iter()
        .filter(|&half| half != 0)
        .map(move |half| value ^ (half & half.wrapping_neg()))
}

/// Values around which `matcher` changes its outcome.
fn probe_values(matcher: &ValueMatcher) -> Vec<u64> {
    let mut out = vec![0, u64::MAX];
    match *matcher {
        ValueMatcher::AnyValue => {}
        ValueMatcher::EqualTo(v)
        | ValueMatcher::NotEqualTo(v)
        | ValueMatcher::GreaterThan(v)
        | ValueMatcher::GreaterThanOrEqual(v)
        | ValueMatcher::LessThan(v)
        | ValueMatcher::LessThanOrEqual(v) => around(&mut out, v),
        ValueMatcher::MaskedEqual { mask, value } => {
            let base = value & mask;
            around(&mut out, base);
            out.push(base | !mask);
            out.extend(half_flips(base, mask));
        }
        ValueMatcher::BitsAllowlist(mask) => {
            out.push(mask);
            out.extend(half_flips(mask, !mask));
            out.extend(half_flips(0, mask));
        }
        ValueMatcher::BitsDenylist(mask) => {
            out.push(!mask);
            out.extend(half_flips(0, mask));
        }
        ValueMatcher::NonNegativeFd => {
            out.extend([0x7fff_ffff, 0x8000_0000, HALF, AT_FDCWD as i64 as u64]);
        }
    }
    out
}
