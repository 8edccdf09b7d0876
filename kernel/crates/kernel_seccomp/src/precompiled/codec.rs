//! Program Blob Format
//!
//! ```text
//! +--------+---------+-------+------+---------+-------+-----------+---------+
//! | "SCBF" | version | flags | arch | default | count | records.. | sha3-256|
//! |   4    |    2    |   2   |  4   |    4    |   4   | 8 * count |   32    |
//! +--------+---------+-------+------+---------+-------+-----------+---------+
//! ```
//!
//! All integers are little-endian. The digest covers every byte before it.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use sha3::{Digest, Sha3_256};
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::arch::Arch;
use crate::bytecode::{Instruction, Program};
use crate::verdict::Verdict;
use crate::verifier::VerifyError;

/// Magic bytes for program blobs.
pub const MAGIC: &[u8; 4] = b"SCBF";

/// Current format version.
pub const VERSION: u16 = 1;

/// Encoded header size.
pub const HEADER_SIZE: usize = 4 + 2 + 2 + 4 + 4 + 4;

/// Trailing digest size.
pub const DIGEST_SIZE: usize = 32;

/// Errors produced while decoding a blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported flags {0:#06x}")]
    UnsupportedFlags(u16),

    #[error("unknown architecture {0:#010x}")]
    UnknownArch(u32),

    #[error("invalid default verdict {0:#010x}")]
    InvalidVerdict(u32),

    #[error("blob is {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("{0} bytes after the digest")]
    TrailingBytes(usize),

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("name is not valid UTF-8")]
    InvalidName,

    #[error("variable {name} points at instruction {offset}, program has {len}")]
    VariableOutOfRange { name: String, offset: usize, len: usize },

    #[error("{field} is {len}, too large for the blob format")]
    Oversized { field: &'static str, len: usize },

    #[error("decoded program is invalid")]
    Invalid(#[from] VerifyError),
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BlobHeader {
    magic: [u8; 4],
    version: U16,
    flags: U16,
    arch: U32,
    default_verdict: U32,
    insn_count: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawInsn {
    code: U16,
    jt: u8,
    jf: u8,
    k: U32,
}

impl From<&Instruction> for RawInsn {
    fn from(insn: &Instruction) -> Self {
        Self {
            code: U16::new(insn.code),
            jt: insn.jt,
            jf: insn.jf,
            k: U32::new(insn.k),
        }
    }
}

impl From<&RawInsn> for Instruction {
    fn from(raw: &RawInsn) -> Self {
        Instruction::new(raw.code.get(), raw.jt, raw.jf, raw.k.get())
    }
}

/// SHA3-256 of `bytes`.
pub(crate) fn digest(bytes: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Append `digest(out)` to `out`.
pub(crate) fn seal(out: &mut Vec<u8>) {
    let sum = digest(out);
    out.extend_from_slice(&sum);
}

/// Split a sealed buffer of exactly `expected` bytes into body and check its
/// digest.
pub(crate) fn unseal(bytes: &[u8], expected: usize) -> Result<&[u8], CodecError> {
    if bytes.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(CodecError::TrailingBytes(bytes.len() - expected));
    }
    let (body, sum) = bytes.split_at(expected - DIGEST_SIZE);
    if digest(body).as_slice() != sum {
        return Err(CodecError::DigestMismatch);
    }
    Ok(body)
}

/// Serialize `program`.
pub fn encode(program: &Program) -> Vec<u8> {
    let insns = program.instructions();
    let header = BlobHeader {
        magic: *MAGIC,
        version: U16::new(VERSION),
        flags: U16::new(0),
        arch: U32::new(program.arch().audit_value()),
        default_verdict: U32::new(program.default_verdict().to_raw()),
        insn_count: U32::new(insns.len() as u32),
    };

    let mut out = Vec::with_capacity(encoded_len(insns.len()));
    out.extend_from_slice(header.as_bytes());
    for insn in insns {
        out.extend_from_slice(RawInsn::from(insn).as_bytes());
    }
    seal(&mut out);
    out
}

/// Size of a blob holding `insn_count` instructions.
pub const fn encoded_len(insn_count: usize) -> usize {
    HEADER_SIZE + insn_count * Instruction::SIZE + DIGEST_SIZE
}

/// Parse and re-verify a blob produced by [`encode`].
///
/// # Errors
///
/// Header fields are checked first, then the length implied by the
/// instruction count, then the digest, and finally the program itself.
pub fn decode(bytes: &[u8]) -> Result<Program, CodecError> {
    let (header, _) = BlobHeader::read_from_prefix(bytes).map_err(|_| CodecError::Truncated {
        expected: HEADER_SIZE + DIGEST_SIZE,
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
    if header.flags.get() != 0 {
        return Err(CodecError::UnsupportedFlags(header.flags.get()));
    }
    let arch = Arch::from_audit_value(header.arch.get()).ok_or(CodecError::UnknownArch(header.arch.get()))?;
    let default_verdict = Verdict::from_raw(header.default_verdict.get())
        .ok_or(CodecError::InvalidVerdict(header.default_verdict.get()))?;

    let count = header.insn_count.get() as usize;
    let body = unseal(bytes, encoded_len(count))?;
    let records = <[RawInsn]>::ref_from_bytes(&body[HEADER_SIZE..]).map_err(|_| CodecError::Truncated {
        expected: encoded_len(count),
        actual: bytes.len(),
    })?;
    let insns = records.iter().map(Instruction::from).collect();
    Ok(Program::new(arch, default_verdict, insns)?)
}
