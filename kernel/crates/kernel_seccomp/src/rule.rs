//! Syscall Rules
//!
//! Rules combine [`ValueMatcher`]s into predicates over a whole syscall
//! invocation. A policy is an ordered list of [`RuleSet`]s; each maps syscall
//! numbers to rules and assigns one verdict to everything it matches.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use kernel_abi::SECCOMP_DATA_ARGS;
use thiserror::Error;

use crate::matcher::ValueMatcher;
use crate::verdict::Verdict;

/// Errors in a rule that make it impossible to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule names {count} arguments, a syscall has at most 6")]
    TooManyArguments { count: usize },
}

/// Predicate over a syscall's arguments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyscallRule {
    /// Matches every invocation.
    MatchAll,
    /// One matcher per argument slot; missing trailing slots match anything.
    PerArg(Vec<ValueMatcher>),
    /// Matches when any sub-rule matches. Empty matches nothing.
    Or(Vec<SyscallRule>),
    /// Matches when every sub-rule matches. Empty matches everything.
    And(Vec<SyscallRule>),
}

impl SyscallRule {
    /// Evaluate the rule against concrete argument values.
    pub fn matches(&self, args: &[u64; SECCOMP_DATA_ARGS]) -> bool {
        match self {
            Self::MatchAll => true,
            Self::PerArg(matchers) => matchers
                .iter()
                .zip(args.iter())
                .all(|(matcher, &arg)| matcher.matches(arg)),
            Self::Or(rules) => rules.iter().any(|rule| rule.matches(args)),
            Self::And(rules) => rules.iter().all(|rule| rule.matches(args)),
        }
    }

    /// Reject rules that cannot be lowered.
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            Self::MatchAll => Ok(()),
            Self::PerArg(matchers) if matchers.len() > SECCOMP_DATA_ARGS => {
                Err(RuleError::TooManyArguments {
                    count: matchers.len(),
                })
            }
            Self::PerArg(_) => Ok(()),
            Self::Or(rules) | Self::And(rules) => rules.iter().try_for_each(Self::validate),
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::MatchAll)
    }

    /// Rewrite into an equivalent, flatter rule.
    ///
    /// Nested `Or`/`And` are flattened, trailing `AnyValue` slots are dropped,
    /// an all-`AnyValue` `PerArg` becomes `MatchAll`, `Or` containing
    /// `MatchAll` collapses to it, and `And` of `PerArg`s that constrain
    /// disjoint slots merges into one `PerArg`.
    pub fn simplify(self) -> Self {
        match self {
            Self::MatchAll => Self::MatchAll,
            Self::PerArg(mut matchers) => {
                while matchers.last().is_some_and(ValueMatcher::is_any) {
                    matchers.pop();
                }
                if matchers.is_empty() {
                    Self::MatchAll
                } else {
                    Self::PerArg(matchers)
                }
            }
            Self::Or(rules) => {
                let mut flat = Vec::with_capacity(rules.len());
                for rule in rules.into_iter().map(Self::simplify) {
                    match rule {
                        Self::MatchAll => return Self::MatchAll,
                        Self::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                dedup_preserving_order(&mut flat);
                if flat.len() == 1 {
                    flat.pop().unwrap_or(Self::Or(Vec::new()))
                } else {
                    Self::Or(flat)
                }
            }
            Self::And(rules) => {
                let mut flat = Vec::with_capacity(rules.len());
                for rule in rules.into_iter().map(Self::simplify) {
                    match rule {
                        Self::MatchAll => {}
                        Self::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                dedup_preserving_order(&mut flat);
                let flat = merge_disjoint_per_args(flat);
                match flat.len() {
                    0 => Self::MatchAll,
                    1 => flat.into_iter().next().unwrap_or(Self::MatchAll),
                    _ => Self::And(flat),
                }
            }
        }
    }

    /// Every `PerArg` leaf of the rule tree, in order.
    pub fn per_arg_leaves(&self) -> Vec<&[ValueMatcher]> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a [ValueMatcher]>) {
        match self {
            Self::MatchAll => {}
            Self::PerArg(matchers) => leaves.push(matchers),
            Self::Or(rules) | Self::And(rules) => {
                rules.iter().for_each(|rule| rule.collect_leaves(leaves))
            }
        }
    }
}

fn dedup_preserving_order(rules: &mut Vec<SyscallRule>) {
    let mut idx = 0;
    while idx < rules.len() {
        if rules[..idx].contains(&rules[idx]) {
            rules.remove(idx);
        } else {
            idx += 1;
        }
    }
}

/// Fold `PerArg` conjuncts into the first `PerArg` when no slot is
/// constrained twice.
fn merge_disjoint_per_args(rules: Vec<SyscallRule>) -> Vec<SyscallRule> {
    let mut merged: Option<Vec<ValueMatcher>> = None;
    let mut rest = Vec::with_capacity(rules.len());

    for rule in rules {
        let SyscallRule::PerArg(matchers) = rule else {
            rest.push(rule);
            continue;
        };
        let Some(acc) = merged.as_mut() else {
            merged = Some(matchers);
            continue;
        };
        let disjoint = matchers
            .iter()
            .zip(acc.iter())
            .all(|(a, b)| a.is_any() || b.is_any());
        if !disjoint {
            rest.push(SyscallRule::PerArg(matchers));
            continue;
        }
        if acc.len() < matchers.len() {
            acc.resize(matchers.len(), ValueMatcher::AnyValue);
        }
        for (slot, matcher) in matchers.into_iter().enumerate() {
            if !matcher.is_any() {
                acc[slot] = matcher;
            }
        }
    }

    match merged {
        Some(acc) => {
            let mut out = Vec::with_capacity(rest.len() + 1);
            out.push(SyscallRule::PerArg(acc));
            out.extend(rest);
            out
        }
        None => rest,
    }
}

impl fmt::Display for SyscallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MatchAll => write!(f, "*"),
            Self::PerArg(matchers) => {
                write!(f, "(")?;
                for (slot, matcher) in matchers.iter().enumerate() {
                    if slot > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{matcher}")?;
                }
                write!(f, ")")
            }
            Self::Or(rules) | Self::And(rules) => {
                let sep = if matches!(self, Self::Or(_)) { " || " } else { " && " };
                write!(f, "[")?;
                for (idx, rule) in rules.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{rule}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Map from syscall number to rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallRules {
    rules: BTreeMap<u32, SyscallRule>,
}

impl SyscallRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for `sysno`. A second rule for the same number is merged
    /// with the first through `Or`.
    pub fn add(&mut self, sysno: u32, rule: SyscallRule) -> &mut Self {
        match self.rules.remove(&sysno) {
            None => {
                self.rules.insert(sysno, rule);
            }
            Some(SyscallRule::Or(mut existing)) => {
                existing.push(rule);
                self.rules.insert(sysno, SyscallRule::Or(existing));
            }
            Some(existing) => {
                self.rules
                    .insert(sysno, SyscallRule::Or(alloc::vec![existing, rule]));
            }
        }
        self
    }

    /// Merge every rule of `other` into `self`.
    pub fn merge(&mut self, other: SyscallRules) -> &mut Self {
        for (sysno, rule) in other.rules {
            self.add(sysno, rule);
        }
        self
    }

    pub fn get(&self, sysno: u32) -> Option<&SyscallRule> {
        self.rules.get(&sysno)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in ascending syscall number order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &SyscallRule)> {
        self.rules.iter().map(|(&sysno, rule)| (sysno, rule))
    }
}

impl FromIterator<(u32, SyscallRule)> for SyscallRules {
    fn from_iter<I: IntoIterator<Item = (u32, SyscallRule)>>(iter: I) -> Self {
        let mut rules = Self::new();
        for (sysno, rule) in iter {
            rules.add(sysno, rule);
        }
        rules
    }
}

/// Rules that share one verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub rules: SyscallRules,
    pub action: Verdict,
}

impl RuleSet {
    pub fn new(rules: SyscallRules, action: Verdict) -> Self {
        Self { rules, action }
    }
}

/// One `(syscall, rule, verdict)` triple of a flattened policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleEntry {
    pub sysno: u32,
    pub rule: SyscallRule,
    pub verdict: Verdict,
}

/// Flatten rule sets into entries, preserving priority order: every entry
/// of an earlier set precedes every entry of a later one.
pub fn flatten(rule_sets: &[RuleSet]) -> Vec<RuleEntry> {
    rule_sets
        .iter()
        .flat_map(|set| {
            set.rules.iter().map(move |(sysno, rule)| RuleEntry {
                sysno,
                rule: rule.clone(),
                verdict: set.action,
            })
        })
        .collect()
}

/// Reference evaluation: the verdict of the first matching entry.
pub fn first_match(
    entries: &[RuleEntry],
    sysno: u32,
    args: &[u64; SECCOMP_DATA_ARGS],
) -> Option<Verdict> {
    entries
        .iter()
        .find(|entry| entry.sysno == sysno && entry.rule.matches(args))
        .map(|entry| entry.verdict)
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::matcher::ValueMatcher::{AnyValue, EqualTo, GreaterThan};

    const ARGS: [u64; 6] = [1, 2, 3, 4, 5, 6];

    #[test]
    fn empty_combinators() {
        assert!(!SyscallRule::Or(vec![]).matches(&ARGS));
        assert!(SyscallRule::And(vec![]).matches(&ARGS));
        assert!(SyscallRule::PerArg(vec![]).matches(&ARGS));
    }

    #[test]
    fn per_arg_slots() {
        let rule = SyscallRule::PerArg(vec![EqualTo(1), AnyValue, EqualTo(3)]);
        assert!(rule.matches(&ARGS));
        assert!(!rule.matches(&[1, 2, 4, 0, 0, 0]));
    }

    #[test]
    fn too_many_arguments() {
        let rule = SyscallRule::Or(vec![SyscallRule::PerArg(vec![AnyValue; 7])]);
        assert_eq!(
            rule.validate(),
            Err(RuleError::TooManyArguments { count: 7 })
        );
    }

    #[test]
    fn simplify_flattens() {
        let rule = SyscallRule::Or(vec![
            SyscallRule::Or(vec![SyscallRule::PerArg(vec![EqualTo(1), AnyValue])]),
            SyscallRule::PerArg(vec![EqualTo(2)]),
            SyscallRule::PerArg(vec![EqualTo(2)]),
        ]);
        assert_eq!(
            rule.simplify(),
            SyscallRule::Or(vec![
                SyscallRule::PerArg(vec![EqualTo(1)]),
                SyscallRule::PerArg(vec![EqualTo(2)]),
            ])
        );
    }

    #[test]
    fn simplify_collapses_match_all() {
        let rule = SyscallRule::Or(vec![
            SyscallRule::PerArg(vec![EqualTo(1)]),
            SyscallRule::PerArg(vec![AnyValue, AnyValue]),
        ]);
        assert_eq!(rule.simplify(), SyscallRule::MatchAll);
        assert_eq!(SyscallRule::And(vec![]).simplify(), SyscallRule::MatchAll);
    }

    #[test]
    fn simplify_merges_disjoint_conjuncts() {
        let rule = SyscallRule::And(vec![
            SyscallRule::PerArg(vec![EqualTo(1)]),
            SyscallRule::PerArg(vec![AnyValue, GreaterThan(5)]),
            SyscallRule::PerArg(vec![EqualTo(9)]),
        ]);
        assert_eq!(
            rule.simplify(),
            SyscallRule::And(vec![
                SyscallRule::PerArg(vec![EqualTo(1), GreaterThan(5)]),
                SyscallRule::PerArg(vec![EqualTo(9)]),
            ])
        );
    }

    #[test]
    fn add_merges_with_or() {
        let mut rules = SyscallRules::new();
        rules
            .add(0, SyscallRule::PerArg(vec![EqualTo(1)]))
            .add(0, SyscallRule::PerArg(vec![EqualTo(2)]))
            .add(0, SyscallRule::PerArg(vec![EqualTo(3)]));
        assert_eq!(rules.len(), 1);
        let Some(SyscallRule::Or(merged)) = rules.get(0) else {
            panic!("expected an Or rule");
        };
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn flatten_keeps_set_order() {
        let deny: SyscallRules = [(5, SyscallRule::MatchAll)].into_iter().collect();
        let allow: SyscallRules = [(1, SyscallRule::MatchAll), (5, SyscallRule::MatchAll)]
            .into_iter()
            .collect();
        let entries = flatten(&[
            RuleSet::new(deny, Verdict::Errno(1)),
            RuleSet::new(allow, Verdict::Allow),
        ]);
        let order: Vec<_> = entries.iter().map(|e| (e.sysno, e.verdict)).collect();
        assert_eq!(
            order,
            vec![(5, Verdict::Errno(1)), (1, Verdict::Allow), (5, Verdict::Allow)]
        );
        assert_eq!(first_match(&entries, 5, &ARGS), Some(Verdict::Errno(1)));
        assert_eq!(first_match(&entries, 2, &ARGS), None);
    }
}
