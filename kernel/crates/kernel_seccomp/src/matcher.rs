//! Value Matchers
//!
//! A [`ValueMatcher`] is a predicate over one 64-bit syscall argument. The
//! compiler lowers every matcher into comparisons on the two 32-bit halves
//! the kernel exposes in `seccomp_data.args`; [`ValueMatcher::matches`] is the
//! reference semantics those comparisons must reproduce.

use core::fmt;

/// Low 32 bits of a value.
#[inline]
pub const fn lo32(value: u64) -> u32 {
    value as u32
}

/// High 32 bits of a value.
#[inline]
pub const fn hi32(value: u64) -> u32 {
    (value >> 32) as u32
}

/// Predicate over a single argument value. All comparisons are unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueMatcher {
    /// Matches every value.
    AnyValue,
    EqualTo(u64),
    NotEqualTo(u64),
    GreaterThan(u64),
    GreaterThanOrEqual(u64),
    LessThan(u64),
    LessThanOrEqual(u64),
    /// Matches an argument `x` when `x & mask == value & mask`.
    MaskedEqual { mask: u64, value: u64 },
    /// Matches when no bit outside the mask is set.
    BitsAllowlist(u64),
    /// Matches when no bit inside the mask is set.
    BitsDenylist(u64),
    /// Matches a file descriptor that is a non-negative `int`.
    NonNegativeFd,
}

impl ValueMatcher {
    pub fn matches(&self, value: u64) -> bool {
        match *self {
            Self::AnyValue => true,
            Self::EqualTo(v) => value == v,
            Self::NotEqualTo(v) => value != v,
            Self::GreaterThan(v) => value > v,
            Self::GreaterThanOrEqual(v) => value >= v,
            Self::LessThan(v) => value < v,
            Self::LessThanOrEqual(v) => value <= v,
            Self::MaskedEqual { mask, value: v } => value & mask == v & mask,
            Self::BitsAllowlist(mask) => value & !mask == 0,
            Self::BitsDenylist(mask) => value & mask == 0,
            Self::NonNegativeFd => value <= i32::MAX as u64,
        }
    }

    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::AnyValue)
    }

    /// A value this matcher accepts, if there is one.
    pub fn satisfying_value(&self) -> Option<u64> {
        let candidate = match *self {
            Self::AnyValue
            | Self::BitsAllowlist(_)
            | Self::BitsDenylist(_)
            | Self::NonNegativeFd => 0,
            Self::EqualTo(v) => v,
            Self::NotEqualTo(v) => v.wrapping_add(1),
            Self::GreaterThan(v) => v.checked_add(1)?,
            Self::GreaterThanOrEqual(v) => v,
            Self::LessThan(v) => v.checked_sub(1)?,
            Self::LessThanOrEqual(v) => v,
            Self::MaskedEqual { mask, value } => value & mask,
        };
        self.matches(candidate).then_some(candidate)
    }
}

impl fmt::Display for ValueMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyValue => write!(f, "*"),
            Self::EqualTo(v) => write!(f, "== {v:#x}"),
            Self::NotEqualTo(v) => write!(f, "!= {v:#x}"),
            Self::GreaterThan(v) => write!(f, "> {v:#x}"),
            Self::GreaterThanOrEqual(v) => write!(f, ">= {v:#x}"),
            Self::LessThan(v) => write!(f, "< {v:#x}"),
            Self::LessThanOrEqual(v) => write!(f, "<= {v:#x}"),
            Self::MaskedEqual { mask, value } => write!(f, "& {mask:#x} == {value:#x}"),
            Self::BitsAllowlist(mask) => write!(f, "& ~{mask:#x} == 0"),
            Self::BitsDenylist(mask) => write!(f, "& {mask:#x} == 0"),
            Self::NonNegativeFd => write!(f, "fd >= 0"),
        }
    }
}
