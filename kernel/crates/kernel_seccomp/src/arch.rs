//! Target architectures.

use core::fmt;

use kernel_abi::{AUDIT_ARCH_AARCH64, AUDIT_ARCH_RISCV64, AUDIT_ARCH_X86_64};

/// Architecture a program is compiled for.
///
/// Syscall numbers are only meaningful together with an architecture, so
/// every program carries one and checks `seccomp_data.arch` before anything
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub const ALL: [Arch; 3] = [Arch::X86_64, Arch::Aarch64, Arch::Riscv64];

    /// The `AUDIT_ARCH_*` value the kernel reports for this architecture.
    #[inline]
    pub const fn audit_value(self) -> u32 {
        match self {
            Self::X86_64 => AUDIT_ARCH_X86_64,
            Self::Aarch64 => AUDIT_ARCH_AARCH64,
            Self::Riscv64 => AUDIT_ARCH_RISCV64,
        }
    }

    #[inline]
    pub const fn from_audit_value(value: u32) -> Option<Self> {
        match value {
            AUDIT_ARCH_X86_64 => Some(Self::X86_64),
            AUDIT_ARCH_AARCH64 => Some(Self::Aarch64),
            AUDIT_ARCH_RISCV64 => Some(Self::Riscv64),
            _ => None,
        }
    }

    /// Whether a second syscall ABI shares this audit value and must be
    /// rejected by syscall number (x32 on x86_64).
    #[inline]
    pub const fn has_x32_abi(self) -> bool {
        matches!(self, Self::X86_64)
    }

    /// An architecture other than `self`, used to probe the arch check.
    #[inline]
    pub const fn foreign(self) -> Self {
        match self {
            Self::X86_64 => Self::Aarch64,
            Self::Aarch64 | Self::Riscv64 => Self::X86_64,
        }
    }

    /// The architecture this crate was built for, if it is a supported one.
    pub const fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Self::Riscv64)
        } else {
            None
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Riscv64 => write!(f, "riscv64"),
        }
    }
}
