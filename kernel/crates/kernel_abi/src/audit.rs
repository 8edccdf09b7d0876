//! `AUDIT_ARCH_*` values as reported in `seccomp_data.arch`.

pub const EM_X86_64: u32 = 62;
pub const EM_AARCH64: u32 = 183;
pub const EM_RISCV: u32 = 243;

pub const __AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
pub const __AUDIT_ARCH_LE: u32 = 0x4000_0000;

pub const AUDIT_ARCH_X86_64: u32 = EM_X86_64 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
pub const AUDIT_ARCH_AARCH64: u32 = EM_AARCH64 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
pub const AUDIT_ARCH_RISCV64: u32 = EM_RISCV | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;

/// Set in the syscall number by the x32 ABI on x86_64.
pub const __X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_values_match_uapi() {
        assert_eq!(AUDIT_ARCH_X86_64, 0xc000_003e);
        assert_eq!(AUDIT_ARCH_AARCH64, 0xc000_00b7);
        assert_eq!(AUDIT_ARCH_RISCV64, 0xc000_00f3);
    }
}
