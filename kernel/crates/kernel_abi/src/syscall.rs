//! Syscall numbers for the architectures the filter compiler targets.
//!
//! Only the calls a sandbox policy commonly names are listed.

pub mod x86_64 {
    pub const READ: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const OPEN: u32 = 2;
    pub const CLOSE: u32 = 3;
    pub const STAT: u32 = 4;
    pub const FSTAT: u32 = 5;
    pub const LSEEK: u32 = 8;
    pub const MMAP: u32 = 9;
    pub const MPROTECT: u32 = 10;
    pub const MUNMAP: u32 = 11;
    pub const BRK: u32 = 12;
    pub const RT_SIGACTION: u32 = 13;
    pub const RT_SIGPROCMASK: u32 = 14;
    pub const RT_SIGRETURN: u32 = 15;
    pub const IOCTL: u32 = 16;
    pub const PREAD64: u32 = 17;
    pub const PWRITE64: u32 = 18;
    pub const READV: u32 = 19;
    pub const WRITEV: u32 = 20;
    pub const SCHED_YIELD: u32 = 24;
    pub const MADVISE: u32 = 28;
    pub const DUP: u32 = 32;
    pub const NANOSLEEP: u32 = 35;
    pub const GETPID: u32 = 39;
    pub const SOCKET: u32 = 41;
    pub const CONNECT: u32 = 42;
    pub const SENDMSG: u32 = 46;
    pub const RECVMSG: u32 = 47;
    pub const CLONE: u32 = 56;
    pub const FORK: u32 = 57;
    pub const EXECVE: u32 = 59;
    pub const EXIT: u32 = 60;
    pub const WAIT4: u32 = 61;
    pub const KILL: u32 = 62;
    pub const FCNTL: u32 = 72;
    pub const GETCWD: u32 = 79;
    pub const GETTID: u32 = 186;
    pub const FUTEX: u32 = 202;
    pub const GETDENTS64: u32 = 217;
    pub const CLOCK_GETTIME: u32 = 228;
    pub const EXIT_GROUP: u32 = 231;
    pub const EPOLL_WAIT: u32 = 232;
    pub const TGKILL: u32 = 234;
    pub const OPENAT: u32 = 257;
    pub const NEWFSTATAT: u32 = 262;
    pub const PPOLL: u32 = 271;
    pub const EPOLL_PWAIT: u32 = 281;
    pub const EVENTFD2: u32 = 290;
    pub const PIPE2: u32 = 293;
    pub const PRLIMIT64: u32 = 302;
    pub const GETRANDOM: u32 = 318;
    pub const MEMFD_CREATE: u32 = 319;
    pub const STATX: u32 = 332;
    pub const RSEQ: u32 = 334;
    pub const CLOSE_RANGE: u32 = 436;
    pub const OPENAT2: u32 = 437;
}

pub mod aarch64 {
    pub const GETCWD: u32 = 17;
    pub const EVENTFD2: u32 = 19;
    pub const EPOLL_PWAIT: u32 = 22;
    pub const DUP: u32 = 23;
    pub const FCNTL: u32 = 25;
    pub const IOCTL: u32 = 29;
    pub const OPENAT: u32 = 56;
    pub const CLOSE: u32 = 57;
    pub const PIPE2: u32 = 59;
    pub const GETDENTS64: u32 = 61;
    pub const LSEEK: u32 = 62;
    pub const READ: u32 = 63;
    pub const WRITE: u32 = 64;
    pub const READV: u32 = 65;
    pub const WRITEV: u32 = 66;
    pub const PREAD64: u32 = 67;
    pub const PWRITE64: u32 = 68;
    pub const PPOLL: u32 = 73;
    pub const NEWFSTATAT: u32 = 79;
    pub const FSTAT: u32 = 80;
    pub const EXIT: u32 = 93;
    pub const EXIT_GROUP: u32 = 94;
    pub const FUTEX: u32 = 98;
    pub const NANOSLEEP: u32 = 101;
    pub const CLOCK_GETTIME: u32 = 113;
    pub const SCHED_YIELD: u32 = 124;
    pub const KILL: u32 = 129;
    pub const TGKILL: u32 = 131;
    pub const RT_SIGACTION: u32 = 134;
    pub const RT_SIGPROCMASK: u32 = 135;
    pub const RT_SIGRETURN: u32 = 139;
    pub const GETPID: u32 = 172;
    pub const GETTID: u32 = 178;
    pub const SOCKET: u32 = 198;
    pub const CONNECT: u32 = 203;
    pub const SENDMSG: u32 = 211;
    pub const RECVMSG: u32 = 212;
    pub const BRK: u32 = 214;
    pub const MUNMAP: u32 = 215;
    pub const CLONE: u32 = 220;
    pub const EXECVE: u32 = 221;
    pub const MMAP: u32 = 222;
    pub const MPROTECT: u32 = 226;
    pub const MADVISE: u32 = 233;
    pub const WAIT4: u32 = 260;
    pub const PRLIMIT64: u32 = 261;
    pub const GETRANDOM: u32 = 278;
    pub const MEMFD_CREATE: u32 = 279;
    pub const STATX: u32 = 291;
    pub const RSEQ: u32 = 293;
    pub const CLOSE_RANGE: u32 = 436;
    pub const OPENAT2: u32 = 437;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openat_numbers() {
        assert_eq!(x86_64::OPENAT, 257);
        assert_eq!(aarch64::OPENAT, 56);
    }
}
