use bitflags::bitflags;

pub const O_RDONLY: u32 = 0;
pub const O_ACCMODE: u32 = 0o3;

pub const AT_FDCWD: i32 = -100;

bitflags! {
    /// `open(2)` flags with the generic (x86_64) encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const CREAT     = 0o100;
        const EXCL      = 0o200;
        const NOCTTY    = 0o400;
        const TRUNC     = 0o1000;
        const APPEND    = 0o2000;
        const NONBLOCK  = 0o4000;
        const DSYNC     = 0o10000;
        const ASYNC     = 0o20000;
        const DIRECT    = 0o40000;
        const LARGEFILE = 0o100000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW  = 0o400000;
        const NOATIME   = 0o1000000;
        const CLOEXEC   = 0o2000000;
        const PATH      = 0o10000000;
    }
}
