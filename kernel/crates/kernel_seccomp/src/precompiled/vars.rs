//! Precompiled Programs with Variables
//!
//! Some values in a filter, typically file descriptors, are only known when
//! the filter is installed. Such a program is compiled ahead of time with
//! placeholders: it is compiled twice with two different assignments of the
//! variables, and every instruction whose `k` differs between the builds is
//! recorded as a slot of the variable that produced the difference. Any
//! other difference means the program's shape depends on the values and it
//! cannot be precompiled. A third assignment must then compile to exactly
//! the substituted template.
//!
//! Templates are unoptimized. The optimizer folds tests on constants, so a
//! program optimized with placeholder values is only right for those
//! values; [`PrecompiledProgram::render`] optimizes after substituting.
//!
//! # Blob Format
//!
//! ```text
//! +--------+---------+-------+----------+-----------+-------------+
//! | "SCPC" | version | flags | name_len | var_count | program_len |
//! |   4    |    2    |   2   |    2     |     2     |      4      |
//! +--------+---------+-------+----------+-----------+-------------+
//! | name | var_count * (name_len u16, count u16, name, offsets u16..) |
//! +------------------------------------------------------------------+
//! | program blob (program_len bytes) | sha3-256 of everything before  |
//! +------------------------------------------------------------------+
//! ```
//!
//! Flag bit 0 means the rendered program is optimized.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::mem::size_of;

use log::trace;
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::codec::{self, CodecError, DIGEST_SIZE};
use crate::bytecode::Program;
use crate::compiler::{BuildError, Policy};
use crate::optimizer::{OptimizeError, Optimizer};
use crate::verifier::VerifyError;

/// Magic bytes for precompiled program blobs.
pub const MAGIC: &[u8; 4] = b"SCPC";

/// Current format version.
pub const VERSION: u16 = 1;

/// Header flag: optimize when rendering.
pub const FLAG_OPTIMIZE: u16 = 1 << 0;

/// Concrete values for a program's variables.
pub type VarValues = BTreeMap<String, u32>;

/// Errors produced while precompiling or rendering a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrecompileError {
    #[error("variable {0} is declared twice")]
    DuplicateVariable(String),

    #[error("variable {0} does not appear in the program")]
    UnusedVariable(String),

    #[error("instruction {index} changes with the variable values")]
    Unstable { index: usize },

    #[error("no value for variable {0}")]
    MissingVariable(String),

    #[error("program has no variable {0}")]
    UnknownVariable(String),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("rendered program is invalid")]
    Invalid(#[from] VerifyError),

    #[error("rendered program failed to optimize: {0}")]
    Optimize(#[from] OptimizeError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A program whose variable slots are filled in at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledProgram {
    name: String,
    program: Program,
    vars: BTreeMap<String, Vec<usize>>,
    optimize: bool,
}

/// Placeholder for variable `idx` in build `round`. Values of different
/// variables are far apart so that no optimization can merge them.
fn placeholder(round: u32, idx: usize) -> u32 {
    0x5ec0_0011 ^ (round << 20) ^ ((idx as u32) << 8)
}

fn assignment(vars: &[&str], round: u32) -> VarValues {
    vars.iter()
        .enumerate()
        .map(|(idx, var)| (var.to_string(), placeholder(round, idx)))
        .collect()
}

/// Compile the policy `policy` returns and locate the instructions holding
/// each of `vars`.
///
/// # Errors
///
/// Fails if a build fails, if builds with different values differ in
/// anything but the `k` of variable slots, or if a variable never reaches
/// the program.
pub fn precompile<F>(name: impl Into<String>, vars: &[&str], policy: F) -> Result<PrecompiledProgram, PrecompileError>
where
    F: Fn(&VarValues) -> Policy,
{
    let name = name.into();
    for (idx, var) in vars.iter().enumerate() {
        if vars[..idx].contains(var) {
            return Err(PrecompileError::DuplicateVariable(var.to_string()));
        }
    }

    let template = policy(&assignment(vars, 0));
    // Optimizer and oracle failures surface here rather than at render time.
    template.build()?;
    let first = template.compile().map_err(BuildError::from)?;
    let other = policy(&assignment(vars, 1));
    let second = other.compile().map_err(BuildError::from)?;
    let (a, b) = (first.instructions(), second.instructions());
    if first.arch() != second.arch()
        || first.default_verdict() != second.default_verdict()
        || template.options.optimize != other.options.optimize
    {
        return Err(PrecompileError::Unstable { index: 0 });
    }
    if a.len() != b.len() {
        return Err(PrecompileError::Unstable {
            index: a.len().min(b.len()),
        });
    }

    let mut slots: BTreeMap<String, Vec<usize>> = vars.iter().map(|var| (var.to_string(), Vec::new())).collect();
    for (index, (x, y)) in a.iter().zip(b).enumerate() {
        if (x.code, x.jt, x.jf) != (y.code, y.jt, y.jf) {
            return Err(PrecompileError::Unstable { index });
        }
        if x.k == y.k {
            continue;
        }
        let var = (0..vars.len())
            .find(|&idx| x.k == placeholder(0, idx) && y.k == placeholder(1, idx))
            .ok_or(PrecompileError::Unstable { index })?;
        if let Some(offsets) = slots.get_mut(vars[var]) {
            offsets.push(index);
        }
    }

    if let Some((var, _)) = slots.iter().find(|(_, offsets)| offsets.is_empty()) {
        return Err(PrecompileError::UnusedVariable(var.clone()));
    }
    let precompiled = PrecompiledProgram {
        name,
        program: first,
        vars: slots,
        optimize: template.options.optimize,
    };

    let check = assignment(vars, 2);
    let expected = policy(&check).compile().map_err(BuildError::from)?;
    let substituted = precompiled.substitute(&check)?;
    if expected != substituted {
        let (x, y) = (expected.instructions(), substituted.instructions());
        let index = x.iter().zip(y).position(|(x, y)| x != y).unwrap_or(x.len().min(y.len()));
        return Err(PrecompileError::Unstable { index });
    }

    trace!(
        "precompiled {}: {} instructions, {} variables",
        precompiled.name,
        precompiled.program.instructions().len(),
        precompiled.vars.len()
    );
    Ok(precompiled)
}

impl PrecompiledProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unoptimized program with placeholder values in its variable
    /// slots.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Whether [`render`](Self::render) optimizes.
    pub fn optimizes(&self) -> bool {
        self.optimize
    }

    pub fn vars(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Instruction indices holding `var`.
    pub fn offsets(&self, var: &str) -> Option<&[usize]> {
        self.vars.get(var).map(Vec::as_slice)
    }

    /// Substitute `values` into the variable slots and optimize the result
    /// if the policy asked for it.
    ///
    /// # Errors
    ///
    /// Every variable needs exactly one value; extra names are rejected.
    pub fn render(&self, values: &VarValues) -> Result<Program, PrecompileError> {
        let program = self.substitute(values)?;
        if !self.optimize {
            return Ok(program);
        }
        Ok(Optimizer::new().run(&program)?.program)
    }

    fn substitute(&self, values: &VarValues) -> Result<Program, PrecompileError> {
        if let Some(unknown) = values.keys().find(|var| !self.vars.contains_key(*var)) {
            return Err(PrecompileError::UnknownVariable(unknown.clone()));
        }
        let mut insns = self.program.instructions().to_vec();
        for (var, offsets) in &self.vars {
            let value = *values
                .get(var)
                .ok_or_else(|| PrecompileError::MissingVariable(var.clone()))?;
            for &offset in offsets {
                insns[offset].k = value;
            }
        }
        Ok(self.program.with_instructions(insns)?)
    }

    /// Serialize into a self-checking blob.
    ///
    /// # Errors
    ///
    /// Names, counts and offsets must fit the header's integer fields.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let program = codec::encode(&self.program);
        let header = PrecompiledHeader {
            magic: *MAGIC,
            version: U16::new(VERSION),
            flags: U16::new(if self.optimize { FLAG_OPTIMIZE } else { 0 }),
            name_len: U16::new(fit_u16("name length", self.name.len())?),
            var_count: U16::new(fit_u16("variable count", self.vars.len())?),
            program_len: U32::new(fit_u32("program length", program.len())?),
        };

        let mut out = Vec::new();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        for (var, offsets) in &self.vars {
            let entry = VarEntry {
                name_len: U16::new(fit_u16("variable name length", var.len())?),
                offset_count: U16::new(fit_u16("offset count", offsets.len())?),
            };
            out.extend_from_slice(entry.as_bytes());
            out.extend_from_slice(var.as_bytes());
            for &offset in offsets {
                out.extend_from_slice(U16::new(fit_u16("offset", offset)?).as_bytes());
            }
        }
        out.extend_from_slice(&program);
        codec::seal(&mut out);
        Ok(out)
    }

    /// Parse a blob produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (header, _) = PrecompiledHeader::read_from_prefix(bytes).map_err(|_| CodecError::Truncated {
            expected: size_of::<PrecompiledHeader>() + DIGEST_SIZE,
            actual: bytes.len(),
        })?;
        if header.magic != *MAGIC {
            return Err(CodecError::BadMagic {
                found: header.magic,
            });
        }
        if header.version.get() != VERSION {
            return Err(CodecError::UnsupportedVersion(header.version.get()));
        }
        let flags = header.flags.get();
        if flags & !FLAG_OPTIMIZE != 0 {
            return Err(CodecError::UnsupportedFlags(flags));
        }
        let sealed = bytes.len().max(size_of::<PrecompiledHeader>() + DIGEST_SIZE);
        let body = codec::unseal(bytes, sealed)?;

        let mut reader = Reader::new(&body[size_of::<PrecompiledHeader>()..]);
        let name = reader.string(header.name_len.get().into())?;
        let mut vars = BTreeMap::new();
        for _ in 0..header.var_count.get() {
            let entry: VarEntry = reader.read()?;
            let var = reader.string(entry.name_len.get().into())?;
            let offsets = reader.offsets(entry.offset_count.get().into())?;
            vars.insert(var, offsets);
        }
        let program = codec::decode(reader.take(header.program_len.get() as usize)?)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }

        let len = program.insn_count();
        for (var, offsets) in &vars {
            if let Some(&offset) = offsets.iter().find(|&&offset| offset >= len) {
                return Err(CodecError::VariableOutOfRange {
                    name: var.clone(),
                    offset,
                    len,
                });
            }
        }
        Ok(Self {
            name,
            program,
            vars,
            optimize: flags & FLAG_OPTIMIZE != 0,
        })
    }
}

fn fit_u16(field: &'static str, len: usize) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::Oversized { field, len })
}

fn fit_u32(field: &'static str, len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Oversized { field, len })
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct PrecompiledHeader {
    magic: [u8; 4],
    version: U16,
    flags: U16,
    name_len: U16,
    var_count: U16,
    program_len: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct VarEntry {
    name_len: U16,
    offset_count: U16,
}

/// Cursor over the digest-checked body of a blob.
struct Reader<'a> {
    bytes: &'a [u8],
    consumed: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, consumed: 0 }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.bytes.len() < len {
            return Err(CodecError::Truncated {
                expected: self.consumed + len,
                actual: self.consumed + self.bytes.len(),
            });
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        self.consumed += len;
        Ok(head)
    }

    fn read<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Result<T, CodecError> {
        let bytes = self.take(size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| CodecError::Truncated {
            expected: size_of::<T>(),
            actual: bytes.len(),
        })
    }

    fn string(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| CodecError::InvalidName)
    }

    fn offsets(&mut self, count: usize) -> Result<Vec<usize>, CodecError> {
        let bytes = self.take(count * size_of::<U16>())?;
        Ok(bytes
            .chunks_exact(size_of::<U16>())
            .map(|pair| usize::from(u16::from_le_bytes([pair[0], pair[1]])))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use kernel_abi::x86_64;

    use super::*;
    use crate::arch::Arch;
    use crate::compiler::ProgramOptions;
    use crate::execution::{Interpreter, SeccompExecutor, SyscallInput};
    use crate::matcher::ValueMatcher;
    use crate::rule::{RuleSet, SyscallRule, SyscallRules};
    use crate::verdict::Verdict;

    fn fd_policy(values: &VarValues, rule: impl Fn(u64) -> SyscallRule) -> Policy {
        let fd = values.get("out").copied().unwrap_or_default();
        let mut rules = SyscallRules::new();
        rules.add(x86_64::WRITE, rule(fd.into()));
        Policy::new(
            Arch::X86_64,
            vec![RuleSet::new(rules, Verdict::Allow)],
            ProgramOptions::new(Verdict::Errno(1)),
        )
    }

    /// `write` is allowed on the `out` descriptor only.
    fn write_to_out(values: &VarValues) -> Policy {
        fd_policy(values, |fd| SyscallRule::PerArg(vec![ValueMatcher::EqualTo(fd)]))
    }

    /// Like [`write_to_out`], but never for descriptors with bit 3 set.
    fn write_to_out_without_bit3(values: &VarValues) -> Policy {
        fd_policy(values, |fd| {
            SyscallRule::And(vec![
                SyscallRule::PerArg(vec![ValueMatcher::EqualTo(fd)]),
                SyscallRule::PerArg(vec![ValueMatcher::BitsDenylist(0x8)]),
            ])
        })
    }

    fn values(pairs: &[(&str, u32)]) -> VarValues {
        pairs.iter().map(|&(var, value)| (var.to_string(), value)).collect()
    }

    #[test]
    fn render_substitutes_values() {
        let precompiled = precompile("write-out", &["out"], write_to_out).unwrap();
        assert_eq!(precompiled.offsets("out").map(<[usize]>::len), Some(1));
        assert!(precompiled.optimizes());

        let program = precompiled.render(&values(&[("out", 3)])).unwrap();
        let write = SyscallInput::new(Arch::X86_64, x86_64::WRITE);
        let interpreter = Interpreter::new();
        assert_eq!(interpreter.execute(&program, &write.with_arg(0, 3)), Ok(Verdict::Allow.to_raw()));
        assert_eq!(interpreter.execute(&program, &write.with_arg(0, 4)), Ok(Verdict::Errno(1).to_raw()));

        let direct = write_to_out(&values(&[("out", 3)])).build().unwrap().program;
        assert_eq!(program, direct);
    }

    #[test]
    fn render_does_not_reuse_placeholder_folding() {
        // The placeholders have bit 3 clear, so an optimizer that saw them
        // would drop the bit test.
        let precompiled = precompile("write-out", &["out"], write_to_out_without_bit3).unwrap();
        let write = SyscallInput::new(Arch::X86_64, x86_64::WRITE);
        let interpreter = Interpreter::new();

        for fd in [3u32, 8, 9, 0x5ec0_0019] {
            let vals = values(&[("out", fd)]);
            let program = precompiled.render(&vals).unwrap();
            assert_eq!(program, write_to_out_without_bit3(&vals).build().unwrap().program);

            let expected = if fd & 0x8 == 0 { Verdict::Allow } else { Verdict::Errno(1) };
            assert_eq!(
                interpreter.execute(&program, &write.with_arg(0, fd.into())),
                Ok(expected.to_raw()),
                "fd {fd:#x}"
            );
        }
    }

    #[test]
    fn unoptimized_policies_render_unoptimized() {
        let precompiled = precompile("write-out", &["out"], |vals| {
            let mut policy = write_to_out(vals);
            policy.options = policy.options.optimize(false);
            policy
        })
        .unwrap();
        assert!(!precompiled.optimizes());
        let vals = values(&[("out", 5)]);
        assert_eq!(precompiled.render(&vals).unwrap(), write_to_out(&vals).compile().unwrap());
    }

    #[test]
    fn render_checks_names() {
        let precompiled = precompile("write-out", &["out"], write_to_out).unwrap();
        assert_eq!(
            precompiled.render(&VarValues::new()),
            Err(PrecompileError::MissingVariable("out".into()))
        );
        assert_eq!(
            precompiled.render(&values(&[("out", 1), ("err", 2)])),
            Err(PrecompileError::UnknownVariable("err".into()))
        );
    }

    #[test]
    fn unused_and_duplicate_variables() {
        assert_eq!(
            precompile("p", &["out", "unused"], write_to_out),
            Err(PrecompileError::UnusedVariable("unused".into()))
        );
        assert_eq!(
            precompile("p", &["out", "out"], write_to_out),
            Err(PrecompileError::DuplicateVariable("out".into()))
        );
    }

    #[test]
    fn shape_must_not_depend_on_values() {
        let result = precompile("p", &["out"], |values| {
            let fd = values.get("out").copied().unwrap_or_default();
            let mut rules = SyscallRules::new();
            // Only one of the two builds gets a second syscall.
            rules.add(x86_64::WRITE, SyscallRule::MatchAll);
            if fd & (1 << 20) != 0 {
                rules.add(x86_64::READ, SyscallRule::MatchAll);
            }
            Policy::new(
                Arch::X86_64,
                vec![RuleSet::new(rules, Verdict::Allow)],
                ProgramOptions::new(Verdict::Errno(1)),
            )
        });
        assert!(matches!(result, Err(PrecompileError::Unstable { .. })));
    }

    #[test]
    fn masked_variables_are_rejected() {
        let result = precompile("p", &["out"], |values| {
            fd_policy(values, |fd| {
                SyscallRule::PerArg(vec![ValueMatcher::MaskedEqual {
                    mask: 0xfff0_0000,
                    value: fd,
                }])
            })
        });
        assert!(matches!(result, Err(PrecompileError::Unstable { .. })));
    }

    #[test]
    fn blob_round_trip() {
        let precompiled = precompile("write-out", &["out"], write_to_out).unwrap();
        let blob = precompiled.encode().unwrap();
        assert_eq!(&blob[..4], MAGIC);
        assert_eq!(PrecompiledProgram::decode(&blob), Ok(precompiled));
    }

    #[test]
    fn oversized_names_do_not_encode() {
        let name = "n".repeat(usize::from(u16::MAX) + 1);
        let precompiled = precompile(name, &["out"], write_to_out).unwrap();
        assert_eq!(
            precompiled.encode(),
            Err(CodecError::Oversized {
                field: "name length",
                len: usize::from(u16::MAX) + 1,
            })
        );
    }

    #[test]
    fn blob_damage_is_detected() {
        let blob = precompile("write-out", &["out"], write_to_out).unwrap().encode().unwrap();

        let mut flipped = blob.clone();
        flipped[20] ^= 0x20;
        assert_eq!(PrecompiledProgram::decode(&flipped), Err(CodecError::DigestMismatch));

        let mut unknown_flag = blob.clone();
        unknown_flag[6] |= 0x2;
        assert_eq!(PrecompiledProgram::decode(&unknown_flag), Err(CodecError::UnsupportedFlags(0x3)));

        assert!(PrecompiledProgram::decode(&blob[..blob.len() - 1]).is_err());
        assert!(PrecompiledProgram::decode(&blob[..8]).is_err());
        let bare = codec::encode(&write_to_out(&values(&[("out", 3)])).compile().unwrap());
        assert!(matches!(PrecompiledProgram::decode(&bare), Err(CodecError::BadMagic { .. })));
    }
}
