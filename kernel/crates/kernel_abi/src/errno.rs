//! Error numbers, sized to fit `SECCOMP_RET_DATA`.

pub const EPERM: u16 = 1;
pub const ENOENT: u16 = 2;
pub const ESRCH: u16 = 3;
pub const EINTR: u16 = 4;
pub const EIO: u16 = 5;
pub const EBADF: u16 = 9;
pub const EAGAIN: u16 = 11;
pub const ENOMEM: u16 = 12;
pub const EACCES: u16 = 13;
pub const EFAULT: u16 = 14;
pub const EEXIST: u16 = 17;
pub const ENOTDIR: u16 = 20;
pub const EINVAL: u16 = 22;
pub const ENOSYS: u16 = 38;
pub const EOPNOTSUPP: u16 = 95;
