//! Seccomp verdicts.

use core::fmt;

use kernel_abi::{
    SECCOMP_RET_ACTION_FULL, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_ERRNO,
    SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_KILL_THREAD, SECCOMP_RET_LOG, SECCOMP_RET_TRACE,
    SECCOMP_RET_TRAP, SECCOMP_RET_USER_NOTIF,
};

/// The outcome of a filter for one syscall.
///
/// Each variant maps to exactly one `SECCOMP_RET_*` 32-bit value; the `u16`
/// payloads travel in the `SECCOMP_RET_DATA` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verdict {
    Allow,
    Errno(u16),
    Trap(u16),
    Trace(u16),
    Log,
    UserNotif,
    KillThread,
    KillProcess,
}

impl Verdict {
    /// Encode as the value a filter returns.
    #[inline]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Allow => SECCOMP_RET_ALLOW,
            Self::Errno(errno) => SECCOMP_RET_ERRNO | errno as u32,
            Self::Trap(data) => SECCOMP_RET_TRAP | data as u32,
            Self::Trace(data) => SECCOMP_RET_TRACE | data as u32,
            Self::Log => SECCOMP_RET_LOG,
            Self::UserNotif => SECCOMP_RET_USER_NOTIF,
            Self::KillThread => SECCOMP_RET_KILL_THREAD,
            Self::KillProcess => SECCOMP_RET_KILL_PROCESS,
        }
    }

    /// Decode a filter return value.
    ///
    /// Returns `None` for unknown actions and for data bits on actions that
    /// carry none, so that `from_raw(v.to_raw()) == Some(v)` and nothing else
    /// decodes.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        let data = (raw & SECCOMP_RET_DATA) as u16;
        let verdict = match raw & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_ALLOW => Self::Allow,
            SECCOMP_RET_ERRNO => return Some(Self::Errno(data)),
            SECCOMP_RET_TRAP => return Some(Self::Trap(data)),
            SECCOMP_RET_TRACE => return Some(Self::Trace(data)),
            SECCOMP_RET_LOG => Self::Log,
            SECCOMP_RET_USER_NOTIF => Self::UserNotif,
            SECCOMP_RET_KILL_THREAD => Self::KillThread,
            SECCOMP_RET_KILL_PROCESS => Self::KillProcess,
            _ => return None,
        };
        if data == 0 { Some(verdict) } else { None }
    }

    /// Whether the verdict terminates the calling thread or process.
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::KillThread | Self::KillProcess)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Errno(errno) => write!(f, "errno({errno})"),
            Self::Trap(data) => write!(f, "trap({data})"),
            Self::Trace(data) => write!(f, "trace({data})"),
            Self::Log => write!(f, "log"),
            Self::UserNotif => write!(f, "user_notif"),
            Self::KillThread => write!(f, "kill_thread"),
            Self::KillProcess => write!(f, "kill_process"),
        }
    }
}
