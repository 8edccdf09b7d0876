//! Rule Lowering
//!
//! Every lowering routine emits code that ends in a jump to one of two
//! labels, `on_match` or `on_fail`, and never falls through. 64-bit
//! comparisons are split into a test on the high word followed by a test on
//! the low word.

use kernel_abi::{seccomp_data_arg_hi, seccomp_data_arg_lo};

use crate::bytecode::builder::{Label, ProgramBuilder};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{AluOp, JmpOp};
use crate::matcher::{ValueMatcher, hi32, lo32};
use crate::rule::SyscallRule;

/// Which half of a 64-bit argument an instruction looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Hi,
    Lo,
}

impl Half {
    fn offset(self, slot: usize) -> u32 {
        match self {
            Self::Hi => seccomp_data_arg_hi(slot),
            Self::Lo => seccomp_data_arg_lo(slot),
        }
    }

    fn of(self, value: u64) -> u32 {
        match self {
            Self::Hi => hi32(value),
            Self::Lo => lo32(value),
        }
    }
}

/// Lower `rule`, jumping to `on_match` when it holds and `on_fail` otherwise.
pub(super) fn lower_rule(b: &mut ProgramBuilder, rule: &SyscallRule, on_match: Label, on_fail: Label) {
    match rule {
        SyscallRule::MatchAll => {
            b.goto(on_match);
        }
        SyscallRule::PerArg(matchers) => {
            let constrained: alloc::vec::Vec<_> = matchers
                .iter()
                .enumerate()
                .filter(|(_, m)| !m.is_any())
                .collect();
            let Some(last) = constrained.len().checked_sub(1) else {
                b.goto(on_match);
                return;
            };
            for (idx, &(slot, matcher)) in constrained.iter().enumerate() {
                let next = if idx == last { on_match } else { b.new_label() };
                lower_matcher(b, slot, matcher, next, on_fail);
                if idx != last {
                    b.bind(next);
                }
            }
        }
        SyscallRule::Or(rules) => {
            let Some((tail, head)) = rules.split_last() else {
                b.goto(on_fail);
                return;
            };
            for rule in head {
                let next = b.new_label();
                lower_rule(b, rule, on_match, next);
                b.bind(next);
            }
            lower_rule(b, tail, on_match, on_fail);
        }
        SyscallRule::And(rules) => {
            let Some((tail, head)) = rules.split_last() else {
                b.goto(on_match);
                return;
            };
            for rule in head {
                let next = b.new_label();
                lower_rule(b, rule, next, on_fail);
                b.bind(next);
            }
            lower_rule(b, tail, on_match, on_fail);
        }
    }
}

/// Lower one matcher on argument `slot`.
pub(super) fn lower_matcher(
    b: &mut ProgramBuilder,
    slot: usize,
    matcher: &ValueMatcher,
    on_match: Label,
    on_fail: Label,
) {
    let load = |b: &mut ProgramBuilder, half: Half| {
        b.stmt(Instruction::load_abs(half.offset(slot)));
    };

    match *matcher {
        ValueMatcher::AnyValue => {
            b.goto(on_match);
        }
        ValueMatcher::EqualTo(v) => {
            let lo = b.new_label();
            load(b, Half::Hi);
            b.jump(JmpOp::Jeq, hi32(v), lo, on_fail).bind(lo);
            load(b, Half::Lo);
            b.jump(JmpOp::Jeq, lo32(v), on_match, on_fail);
        }
        ValueMatcher::NotEqualTo(v) => {
            let lo = b.new_label();
            load(b, Half::Hi);
            b.jump(JmpOp::Jeq, hi32(v), lo, on_match).bind(lo);
            load(b, Half::Lo);
            b.jump(JmpOp::Jeq, lo32(v), on_fail, on_match);
        }
        ValueMatcher::GreaterThan(v) => {
            lower_ordered(b, slot, v, JmpOp::Jgt, on_match, on_fail);
        }
        ValueMatcher::GreaterThanOrEqual(v) => {
            lower_ordered(b, slot, v, JmpOp::Jge, on_match, on_fail);
        }
        ValueMatcher::LessThan(v) => {
            // x < v  <=>  !(x >= v)
            lower_ordered(b, slot, v, JmpOp::Jge, on_fail, on_match);
        }
        ValueMatcher::LessThanOrEqual(v) => {
            // x <= v  <=>  !(x > v)
            lower_ordered(b, slot, v, JmpOp::Jgt, on_fail, on_match);
        }
        ValueMatcher::MaskedEqual { mask, value } => {
            let tests = [Half::Hi, Half::Lo].map(|half| (half, half.of(mask), half.of(value & mask)));
            lower_conjunction(b, slot, &tests, on_match, on_fail, |b, half_mask, expected, pass, fail| {
                b.stmt(Instruction::alu_k(AluOp::And, half_mask));
                b.jump(JmpOp::Jeq, expected, pass, fail);
            });
        }
        ValueMatcher::BitsAllowlist(mask) => {
            let tests = [Half::Hi, Half::Lo].map(|half| (half, half.of(!mask), 0));
            lower_conjunction(b, slot, &tests, on_match, on_fail, |b, forbidden, _, pass, fail| {
                b.jump(JmpOp::Jset, forbidden, fail, pass);
            });
        }
        ValueMatcher::BitsDenylist(mask) => {
            let tests = [Half::Hi, Half::Lo].map(|half| (half, half.of(mask), 0));
            lower_conjunction(b, slot, &tests, on_match, on_fail, |b, forbidden, _, pass, fail| {
                b.jump(JmpOp::Jset, forbidden, fail, pass);
            });
        }
        ValueMatcher::NonNegativeFd => {
            let lo = b.new_label();
            load(b, Half::Hi);
            b.jump(JmpOp::Jeq, 0, lo, on_fail).bind(lo);
            load(b, Half::Lo);
            b.jump(JmpOp::Jset, 0x8000_0000, on_fail, on_match);
        }
    }
}

/// `x <op> v` for `op` in {`>`, `>=`}, unsigned over 64 bits.
///
/// ```text
///   ld  hi
///   jgt hi(v)  -> on_true
///   jeq hi(v)  -> lo, on_false
/// lo:
///   ld  lo
///   <op> lo(v) -> on_true, on_false
/// ```
fn lower_ordered(
    b: &mut ProgramBuilder,
    slot: usize,
    v: u64,
    op: JmpOp,
    on_true: Label,
    on_false: Label,
) {
    let (hi_eq, lo) = (b.new_label(), b.new_label());
    b.stmt(Instruction::load_abs(seccomp_data_arg_hi(slot)))
        .jump(JmpOp::Jgt, hi32(v), on_true, hi_eq)
        .bind(hi_eq)
        .jump(JmpOp::Jeq, hi32(v), lo, on_false)
        .bind(lo)
        .stmt(Instruction::load_abs(seccomp_data_arg_lo(slot)))
        .jump(op, lo32(v), on_true, on_false);
}

/// Emit one test per half whose constant `k` is non-zero; all must pass.
fn lower_conjunction(
    b: &mut ProgramBuilder,
    slot: usize,
    tests: &[(Half, u32, u32)],
    on_match: Label,
    on_fail: Label,
    mut emit: impl FnMut(&mut ProgramBuilder, u32, u32, Label, Label),
) {
    let active: alloc::vec::Vec<_> = tests.iter().filter(|(_, k, _)| *k != 0).collect();
    let Some(last) = active.len().checked_sub(1) else {
        b.goto(on_match);
        return;
    };
    for (idx, &&(half, k, expected)) in active.iter().enumerate() {
        let pass = if idx == last { on_match } else { b.new_label() };
        b.stmt(Instruction::load_abs(half.offset(slot)));
        emit(b, k, expected, pass, on_fail);
        if idx != last {
            b.bind(pass);
        }
    }
}
