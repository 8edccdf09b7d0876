//! Seccomp Program Verifier
//!
//! Every [`Program`](crate::bytecode::Program) passes through here on
//! construction, whether it was assembled, optimized or decoded, so an
//! invalid program can never be handed to the kernel.

pub mod cfg;
mod core;
pub mod error;

pub use self::core::Verifier;
pub use cfg::ControlFlowGraph;
pub use error::{VerifyError, VerifyResult};
