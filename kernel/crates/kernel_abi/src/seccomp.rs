//! Seccomp filter return values and the `struct seccomp_data` layout.

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

pub const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
pub const SECCOMP_DATA_IP_OFFSET: u32 = 8;
pub const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;
pub const SECCOMP_DATA_SIZE: u32 = 64;

/// Number of syscall arguments carried in `seccomp_data.args`.
pub const SECCOMP_DATA_ARGS: usize = 6;

/// Offset of the low 32 bits of argument `index` (little-endian layout).
#[inline]
pub const fn seccomp_data_arg_lo(index: usize) -> u32 {
    SECCOMP_DATA_ARGS_OFFSET + 8 * index as u32
}

/// Offset of the high 32 bits of argument `index` (little-endian layout).
#[inline]
pub const fn seccomp_data_arg_hi(index: usize) -> u32 {
    seccomp_data_arg_lo(index) + 4
}
