//! Linux ABI constants shared by the seccomp filter compiler.
//!
//! Everything here mirrors a value the host kernel defines in its uapi
//! headers. Nothing in this crate allocates or performs I/O.

#![no_std]

mod audit;
mod errno;
mod fcntl;
mod limits;
mod seccomp;
mod syscall;

pub use audit::*;
pub use errno::*;
pub use fcntl::*;
pub use limits::*;
pub use seccomp::*;
pub use syscall::*;
