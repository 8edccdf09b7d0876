//! Precompiled Program Registry
//!
//! Programs are contributed from anywhere in the final binary through the
//! [`PRECOMPILED_PROGRAMS`] distributed slice. The registry is resolved on
//! first access: a registration's build-time blob is decoded if it has one,
//! and its policy is compiled otherwise or when the blob turns out to be
//! unusable. Failures are kept and reported per name.
//!
//! ```ignore
//! #[distributed_slice(PRECOMPILED_PROGRAMS)]
//! static SANDBOX: ProgramRegistration = ProgramRegistration {
//!     name: "sandbox",
//!     blob: None,
//!     compile: compile_sandbox,
//! };
//! ```

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use conquer_once::spin::Lazy;
use linkme::distributed_slice;
use log::{debug, log_enabled, trace, warn, Level};
use thiserror::Error;

use super::vars::{PrecompileError, PrecompiledProgram};

#[distributed_slice]
pub static PRECOMPILED_PROGRAMS: [ProgramRegistration] = [..];

/// One registered program.
pub struct ProgramRegistration {
    pub name: &'static str,
    /// Output of [`PrecompiledProgram::encode`] produced at build time.
    pub blob: Option<&'static [u8]>,
    /// Compiles the program from its source policy.
    pub compile: fn() -> Result<PrecompiledProgram, PrecompileError>,
}

/// Errors returned by [`get_precompiled`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no precompiled program named {0}")]
    NotFound(String),

    #[error("program {0} is registered more than once")]
    Duplicate(&'static str),

    #[error("program {name} failed to compile")]
    Compile {
        name: &'static str,
        #[source]
        source: PrecompileError,
    },

    #[error("registration {registered} compiled a program named {compiled}")]
    NameMismatch { registered: &'static str, compiled: String },
}

type Entries = BTreeMap<&'static str, Result<PrecompiledProgram, RegistryError>>;

static REGISTRY: Lazy<Entries> = Lazy::new(|| load(&PRECOMPILED_PROGRAMS));

/// The program registered as `name`.
///
/// # Errors
///
/// [`RegistryError::NotFound`] for unknown names, otherwise the error stored
/// when the registry was populated.
pub fn get_precompiled(name: &str) -> Result<&'static PrecompiledProgram, RegistryError> {
    let registry: &'static Entries = &REGISTRY;
    match registry.get(name) {
        Some(Ok(program)) => Ok(program),
        Some(Err(err)) => Err(err.clone()),
        None => Err(RegistryError::NotFound(name.to_string())),
    }
}

/// Names of every registration, sorted, including ones that failed.
pub fn list_precompiled() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

fn load(registrations: &[ProgramRegistration]) -> Entries {
    if log_enabled!(Level::Trace) {
        registrations
            .iter()
            .for_each(|registration| trace!("have precompiled program: {}", registration.name));
    }

    let mut entries = Entries::new();
    for registration in registrations {
        let name = registration.name;
        if let Some(existing) = entries.get_mut(name) {
            warn!("precompiled program {name} is registered more than once");
            *existing = Err(RegistryError::Duplicate(name));
            continue;
        }
        entries.insert(name, resolve(registration));
    }
    debug!("loaded {} precompiled programs", entries.len());
    entries
}

fn resolve(registration: &ProgramRegistration) -> Result<PrecompiledProgram, RegistryError> {
    let name = registration.name;
    if let Some(blob) = registration.blob {
        match PrecompiledProgram::decode(blob) {
            Ok(program) if program.name() == name => return Ok(program),
            Ok(program) => warn!("{name}: blob holds {}, recompiling", program.name()),
            Err(err) => warn!("{name}: unusable blob ({err}), recompiling"),
        }
    }

    let program = (registration.compile)().map_err(|source| RegistryError::Compile { name, source })?;
    if program.name() != name {
        return Err(RegistryError::NameMismatch {
            registered: name,
            compiled: program.name().to_string(),
        });
    }
    Ok(program)
}
