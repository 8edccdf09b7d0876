//! Accumulator State Tracking
//!
//! Abstract value of `A` at a program point: where it was loaded from, an
//! unsigned range, partially known bits, a few values it cannot hold and a
//! few bit sets of which it must hold at least one bit.
//!
//! `seccomp_data` never changes while a filter runs, so whatever a
//! comparison reveals about a loaded word stays true after `A` is
//! overwritten. Those facts are kept per `(offset, mask)` and come back when
//! the same word, or the same masked part of it, is loaded again.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use kernel_abi::SECCOMP_DATA_SIZE;

use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{AluOp, JmpOp, Operation, Source};

/// Most excluded values and required bit sets tracked per value.
const MAX_EXCLUDED: usize = 8;

/// Where the accumulator's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Origin {
    Unknown,
    /// `seccomp_data[offset] & mask` with nothing else written to `A` since.
    Word { offset: u32, mask: u32 },
}

impl Origin {
    const fn word(offset: u32) -> Self {
        Self::Word {
            offset,
            mask: u32::MAX,
        }
    }
}

/// Tracked number for partial bit knowledge.
///
/// - `value`: bits known to be set
/// - `mask`: bits that are unknown (1 = unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tnum {
    value: u32,
    mask: u32,
}

impl Tnum {
    const fn constant(value: u32) -> Self {
        Self { value, mask: 0 }
    }

    const fn unknown() -> Self {
        Self {
            value: 0,
            mask: u32::MAX,
        }
    }

    const fn known_ones(self) -> u32 {
        self.value & !self.mask
    }

    const fn known_zeros(self) -> u32 {
        !self.value & !self.mask
    }

    const fn contains(self, v: u32) -> bool {
        v & !self.mask == self.value
    }

    /// Smallest tnum containing both.
    const fn join(self, other: Self) -> Self {
        let mask = self.mask | other.mask | (self.value ^ other.value);
        Self {
            value: self.value & !mask,
            mask,
        }
    }

    const fn and(self, k: u32) -> Self {
        Self {
            value: self.value & k,
            mask: self.mask & k,
        }
    }

    /// Also know that the bits in `mask` equal those of `bits`, or `None`
    /// if that contradicts what is known.
    const fn with_bits(self, mask: u32, bits: u32) -> Option<Self> {
        let overlap = mask & !self.mask;
        if (self.value ^ bits) & overlap != 0 {
            return None;
        }
        Some(Self {
            value: self.value | (bits & mask),
            mask: self.mask & !mask,
        })
    }
}

/// Abstract 32-bit value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Value {
    min: u32,
    max: u32,
    tnum: Tnum,
    excluded: Vec<u32>,
    /// Masks of which at least one bit is set.
    any_set: Vec<u32>,
}

impl Value {
    fn unknown() -> Self {
        Self {
            min: 0,
            max: u32::MAX,
            tnum: Tnum::unknown(),
            excluded: Vec::new(),
            any_set: Vec::new(),
        }
    }

    fn constant(value: u32) -> Self {
        Self {
            min: value,
            max: value,
            tnum: Tnum::constant(value),
            excluded: Vec::new(),
            any_set: Vec::new(),
        }
    }

    fn as_constant(&self) -> Option<u32> {
        (self.min == self.max).then_some(self.min)
    }

    fn could_be(&self, v: u32) -> bool {
        (self.min..=self.max).contains(&v)
            && self.tnum.contains(v)
            && !self.excluded.contains(&v)
            && self.any_set.iter().all(|&m| v & m != 0)
    }

    fn meet(&self, other: &Self) -> Self {
        let common = |a: &[u32], b: &[u32]| a.iter().copied().filter(|v| b.contains(v)).collect();
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            tnum: self.tnum.join(other.tnum),
            excluded: common(&self.excluded, &other.excluded),
            any_set: common(&self.any_set, &other.any_set),
        }
    }

    fn and(&self, k: u32) -> Self {
        if let Some(a) = self.as_constant() {
            return Self::constant(a & k);
        }
        Self {
            min: 0,
            max: self.max.min(k),
            tnum: self.tnum.and(k),
            excluded: Vec::new(),
            any_set: self.any_set.iter().copied().filter(|&m| m & !k == 0).collect(),
        }
    }

    fn eval(&self, op: JmpOp, k: u32) -> Option<bool> {
        if let Some(a) = self.as_constant() {
            return Some(op.eval(a, k));
        }
        let possible = !self.tnum.known_zeros();
        match op {
            JmpOp::Jeq => (!self.could_be(k)).then_some(false),
            JmpOp::Jgt if self.min > k => Some(true),
            JmpOp::Jgt if self.max <= k => Some(false),
            JmpOp::Jge if self.min >= k => Some(true),
            JmpOp::Jge if self.max < k => Some(false),
            JmpOp::Jset if self.tnum.known_ones() & k != 0 => Some(true),
            JmpOp::Jset if self.tnum.known_zeros() & k == k => Some(false),
            // Every bit of k lies above the largest possible value.
            JmpOp::Jset if self.max < (k & k.wrapping_neg()) => Some(false),
            // k holds every bit from the top bit of min upwards.
            JmpOp::Jset if self.min != 0 && !k < 1 << (31 - self.min.leading_zeros()) => Some(true),
            // Some bit that must be set can only be one of k's.
            JmpOp::Jset if self.any_set.iter().any(|&m| m & possible & !k == 0) => Some(true),
            _ => None,
        }
    }

    fn refine(&self, op: JmpOp, k: u32, taken: bool) -> Option<Self> {
        if self.eval(op, k) == Some(!taken) {
            return None;
        }
        let mut next = self.clone();
        match (op, taken) {
            (JmpOp::Jeq, true) => {
                next.min = k;
                next.max = k;
            }
            (JmpOp::Jeq, false) => push_capped(&mut next.excluded, k),
            (JmpOp::Jgt, true) => next.min = next.min.max(k.checked_add(1)?),
            (JmpOp::Jgt, false) => next.max = next.max.min(k),
            (JmpOp::Jge, true) => next.min = next.min.max(k),
            (JmpOp::Jge, false) => next.max = next.max.min(k.checked_sub(1)?),
            (JmpOp::Jset, true) => push_capped(&mut next.any_set, k),
            (JmpOp::Jset, false) => next.tnum = next.tnum.with_bits(k, 0)?,
        }
        next.normalize()
    }

    /// Tighten the range and bits against each other.
    fn normalize(mut self) -> Option<Self> {
        if self.min > self.max {
            return None;
        }
        let possible = !self.tnum.known_zeros();
        for idx in 0..self.any_set.len() {
            let bits = self.any_set[idx] & possible;
            if bits == 0 {
                return None;
            }
            if bits.is_power_of_two() {
                self.tnum = self.tnum.with_bits(bits, bits)?;
            }
        }
        self.min = self.min.max(self.tnum.value);
        self.max = self.max.min(self.tnum.value | self.tnum.mask);
        if self.min > self.max {
            return None;
        }
        while self.min < self.max && self.excluded.contains(&self.min) {
            self.min += 1;
        }
        while self.max > self.min && self.excluded.contains(&self.max) {
            self.max -= 1;
        }
        if self.tnum.mask == 0 {
            let v = self.tnum.value;
            if !(self.min..=self.max).contains(&v) {
                return None;
            }
            self.min = v;
            self.max = v;
        }
        if self.min == self.max {
            if !self.could_be(self.min) {
                return None;
            }
            self.tnum = Tnum::constant(self.min);
            self.excluded.clear();
            self.any_set.clear();
        }
        Some(self)
    }
}

fn push_capped(list: &mut Vec<u32>, v: u32) {
    if list.len() < MAX_EXCLUDED && !list.contains(&v) {
        list.push(v);
    }
}

/// Abstract machine state: the accumulator plus what is known about the
/// input words read so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct AccState {
    pub origin: Origin,
    acc: Value,
    facts: BTreeMap<(u32, u32), Value>,
}

impl AccState {
    pub fn unknown() -> Self {
        Self {
            origin: Origin::Unknown,
            acc: Value::unknown(),
            facts: BTreeMap::new(),
        }
    }

    pub fn constant(value: u32) -> Self {
        Self {
            acc: Value::constant(value),
            ..Self::unknown()
        }
    }

    #[inline]
    pub fn as_constant(&self) -> Option<u32> {
        self.acc.as_constant()
    }

    /// State at a join point.
    pub fn meet(&self, other: &Self) -> Self {
        let origin = if self.origin == other.origin {
            self.origin
        } else {
            Origin::Unknown
        };
        let facts = self
            .facts
            .iter()
            .filter_map(|(key, fact)| Some((*key, fact.meet(other.facts.get(key)?))))
            .collect();
        Self {
            origin,
            acc: self.acc.meet(&other.acc),
            facts,
        }
    }

    /// Whether executing `insn` leaves `A` as it is.
    pub fn is_redundant_load(&self, insn: &Instruction) -> bool {
        match insn.operation() {
            Some(Operation::LoadAbs) => self.origin == Origin::word(insn.k),
            Some(Operation::LoadImm) => self.as_constant() == Some(insn.k),
            Some(Operation::LoadLen) => self.as_constant() == Some(SECCOMP_DATA_SIZE),
            _ => false,
        }
    }

    fn with_acc(&self, origin: Origin, acc: Value) -> Self {
        Self {
            origin,
            acc,
            facts: self.facts.clone(),
        }
    }

    fn fact(&self, offset: u32, mask: u32) -> Option<&Value> {
        self.facts.get(&(offset, mask))
    }

    /// State after a straight-line instruction.
    pub fn transfer(&self, insn: &Instruction) -> Self {
        let Some(op) = insn.operation() else {
            return self.with_acc(Origin::Unknown, Value::unknown());
        };
        if self.is_redundant_load(insn) {
            return self.clone();
        }
        match op {
            Operation::LoadAbs => {
                let acc = self.fact(insn.k, u32::MAX).cloned().unwrap_or_else(Value::unknown);
                self.with_acc(Origin::word(insn.k), acc)
            }
            Operation::LoadImm => self.with_acc(Origin::Unknown, Value::constant(insn.k)),
            Operation::LoadLen => self.with_acc(Origin::Unknown, Value::constant(SECCOMP_DATA_SIZE)),
            Operation::Alu(AluOp::And, Source::K) => {
                let computed = self.acc.and(insn.k);
                match self.origin {
                    Origin::Word { offset, mask } => {
                        let mask = mask & insn.k;
                        let acc = match self.fact(offset, mask) {
                            Some(fact) if computed.as_constant().is_none() => fact.clone(),
                            _ => computed,
                        };
                        self.with_acc(Origin::Word { offset, mask }, acc)
                    }
                    Origin::Unknown => self.with_acc(Origin::Unknown, computed),
                }
            }
            Operation::Alu(alu, Source::K) => {
                let acc = self
                    .as_constant()
                    .and_then(|a| alu.apply(a, insn.k))
                    .map_or_else(Value::unknown, Value::constant);
                self.with_acc(Origin::Unknown, acc)
            }
            op if op.writes_a() => self.with_acc(Origin::Unknown, Value::unknown()),
            _ => self.clone(),
        }
    }

    /// Outcome of `A <op> k` if it is the same for every value `A` may hold.
    pub fn eval(&self, op: JmpOp, k: u32) -> Option<bool> {
        let decided = self.acc.eval(op, k);
        if decided.is_some() || op != JmpOp::Jeq {
            return decided;
        }
        // A == k fixes every narrower masked view of the same word.
        let Origin::Word { offset, mask } = self.origin else {
            return None;
        };
        self.facts
            .range((offset, 0)..=(offset, u32::MAX))
            .any(|(&(_, narrow), fact)| narrow & !mask == 0 && !fact.could_be(k & narrow))
            .then_some(false)
    }

    /// State on the edge where `A <op> k` evaluated to `taken`, or `None`
    /// if that edge cannot be taken.
    pub fn refine(&self, op: JmpOp, k: u32, taken: bool) -> Option<Self> {
        if self.eval(op, k) == Some(!taken) {
            return None;
        }
        let acc = self.acc.refine(op, k, taken)?;
        let mut next = self.with_acc(self.origin, acc);
        if let Origin::Word { offset, mask } = self.origin {
            next.facts.insert((offset, mask), next.acc.clone());
            // A constant masked view pins those bits of the whole word.
            if let (Some(bits), true) = (next.acc.as_constant(), mask != u32::MAX) {
                let whole = next.fact(offset, u32::MAX).cloned().unwrap_or_else(Value::unknown);
                let tnum = whole.tnum.with_bits(mask, bits)?;
                let whole = Value { tnum, ..whole }.normalize()?;
                next.facts.insert((offset, u32::MAX), whole);
            }
        }
        Some(next)
    }
}
