//! Precompiled Programs
//!
//! Compiling and checking a policy is too slow to repeat at every sandbox
//! start. This module stores finished programs as digest-protected blobs
//! ([`codec`]), leaves holes for values known only at install time
//! ([`vars`]) and collects every program the binary ships in one registry
//! ([`registry`]).

pub mod codec;
pub mod registry;
pub mod vars;

pub use codec::{CodecError, decode, encode};
pub use registry::{
    PRECOMPILED_PROGRAMS, ProgramRegistration, RegistryError, get_precompiled, list_precompiled,
};
pub use vars::{PrecompileError, PrecompiledProgram, VarValues, precompile};
