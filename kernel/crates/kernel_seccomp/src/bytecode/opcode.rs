//! Classic BPF Opcode Definitions
//!
//! Classic BPF packs an instruction's kind into a 16-bit code of which only
//! the low byte is used:
//!
//! ```text
//! +-----------------+------------------+----------------+
//! |    3 bits       |     2 bits       |    3 bits      |
//! | mode / op (hi)  | size / src (mid) |  class (low)   |
//! +-----------------+------------------+----------------+
//! ```
//!
//! Seccomp accepts a strict subset of the full socket-filter instruction set;
//! [`Operation::from_code`] decodes exactly that subset and nothing else.

use core::fmt;

pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;
pub const BPF_A: u16 = 0x10;

pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Instruction class (bits 0-2 of the code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpcodeClass {
    Ld = BPF_LD,
    Ldx = BPF_LDX,
    St = BPF_ST,
    Stx = BPF_STX,
    Alu = BPF_ALU,
    Jmp = BPF_JMP,
    Ret = BPF_RET,
    Misc = BPF_MISC,
}

impl OpcodeClass {
    /// Extract the class from a code. Every 3-bit value is a class.
    #[inline]
    pub const fn from_code(code: u16) -> Self {
        match code & 0x07 {
            BPF_LD => Self::Ld,
            BPF_LDX => Self::Ldx,
            BPF_ST => Self::St,
            BPF_STX => Self::Stx,
            BPF_ALU => Self::Alu,
            BPF_JMP => Self::Jmp,
            BPF_RET => Self::Ret,
            _ => Self::Misc,
        }
    }
}

/// Operand source for ALU and jump instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// The instruction's `k` field
    K,
    /// The index register
    X,
}

impl Source {
    #[inline]
    pub const fn from_code(code: u16) -> Self {
        if code & BPF_X != 0 { Self::X } else { Self::K }
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        match self {
            Self::K => BPF_K,
            Self::X => BPF_X,
        }
    }
}

/// ALU operations seccomp accepts. `BPF_MOD` is not among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AluOp {
    Add = BPF_ADD,
    Sub = BPF_SUB,
    Mul = BPF_MUL,
    Div = BPF_DIV,
    Or = BPF_OR,
    And = BPF_AND,
    Lsh = BPF_LSH,
    Rsh = BPF_RSH,
    Xor = BPF_XOR,
}

impl AluOp {
    #[inline]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code & 0xf0 {
            BPF_ADD => Some(Self::Add),
            BPF_SUB => Some(Self::Sub),
            BPF_MUL => Some(Self::Mul),
            BPF_DIV => Some(Self::Div),
            BPF_OR => Some(Self::Or),
            BPF_AND => Some(Self::And),
            BPF_LSH => Some(Self::Lsh),
            BPF_RSH => Some(Self::Rsh),
            BPF_XOR => Some(Self::Xor),
            _ => None,
        }
    }

    /// Apply the operation with 32-bit wrapping semantics.
    ///
    /// Returns `None` for a division by zero, which makes the kernel's
    /// filter return 0.
    #[inline]
    pub const fn apply(self, a: u32, operand: u32) -> Option<u32> {
        Some(match self {
            Self::Add => a.wrapping_add(operand),
            Self::Sub => a.wrapping_sub(operand),
            Self::Mul => a.wrapping_mul(operand),
            Self::Div => {
                if operand == 0 {
                    return None;
                }
                a / operand
            }
            Self::Or => a | operand,
            Self::And => a & operand,
            Self::Lsh => a.wrapping_shl(operand),
            Self::Rsh => a.wrapping_shr(operand),
            Self::Xor => a ^ operand,
        })
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Or => "or",
            Self::And => "and",
            Self::Lsh => "lsh",
            Self::Rsh => "rsh",
            Self::Xor => "xor",
        }
    }
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Conditional jump comparisons. All of them are unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum JmpOp {
    Jeq = BPF_JEQ,
    Jgt = BPF_JGT,
    Jge = BPF_JGE,
    Jset = BPF_JSET,
}

impl JmpOp {
    #[inline]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code & 0xf0 {
            BPF_JEQ => Some(Self::Jeq),
            BPF_JGT => Some(Self::Jgt),
            BPF_JGE => Some(Self::Jge),
            BPF_JSET => Some(Self::Jset),
            _ => None,
        }
    }

    /// Evaluate the comparison of `a` against `operand`.
    #[inline]
    pub const fn eval(self, a: u32, operand: u32) -> bool {
        match self {
            Self::Jeq => a == operand,
            Self::Jgt => a > operand,
            Self::Jge => a >= operand,
            Self::Jset => a & operand != 0,
        }
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            Self::Jeq => "jeq",
            Self::Jgt => "jgt",
            Self::Jge => "jge",
            Self::Jset => "jset",
        }
    }
}

impl fmt::Display for JmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Decoded form of every instruction code seccomp accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `A = seccomp_data[k]` (32-bit word)
    LoadAbs,
    /// `A = sizeof(seccomp_data)`
    LoadLen,
    /// `A = k`
    LoadImm,
    /// `A = M[k]`
    LoadMem,
    /// `X = sizeof(seccomp_data)`
    LoadXLen,
    /// `X = k`
    LoadXImm,
    /// `X = M[k]`
    LoadXMem,
    /// `M[k] = A`
    Store,
    /// `M[k] = X`
    StoreX,
    /// `A = A <op> src`
    Alu(AluOp, Source),
    /// `A = -A`
    Neg,
    /// `pc += k`
    Ja,
    /// `pc += (A <op> src) ? jt : jf`
    Jump(JmpOp, Source),
    /// Return `k`
    RetK,
    /// Return `A`
    RetA,
    /// `X = A`
    Tax,
    /// `A = X`
    Txa,
}

impl Operation {
    /// Decode a code, returning `None` for anything seccomp rejects.
    pub const fn from_code(code: u16) -> Option<Self> {
        if code > 0xff {
            return None;
        }
        let op = match code {
            c if c == BPF_LD | BPF_W | BPF_ABS => Self::LoadAbs,
            c if c == BPF_LD | BPF_W | BPF_LEN => Self::LoadLen,
            c if c == BPF_LD | BPF_IMM => Self::LoadImm,
            c if c == BPF_LD | BPF_MEM => Self::LoadMem,
            c if c == BPF_LDX | BPF_W | BPF_LEN => Self::LoadXLen,
            c if c == BPF_LDX | BPF_IMM => Self::LoadXImm,
            c if c == BPF_LDX | BPF_MEM => Self::LoadXMem,
            c if c == BPF_ST => Self::Store,
            c if c == BPF_STX => Self::StoreX,
            c if c == BPF_ALU | BPF_NEG => Self::Neg,
            c if c == BPF_JMP | BPF_JA => Self::Ja,
            c if c == BPF_RET | BPF_K => Self::RetK,
            c if c == BPF_RET | BPF_A => Self::RetA,
            c if c == BPF_MISC | BPF_TAX => Self::Tax,
            c if c == BPF_MISC | BPF_TXA => Self::Txa,
            c => match OpcodeClass::from_code(c) {
                OpcodeClass::Alu => match AluOp::from_code(c) {
                    Some(op) if c & 0x07 == BPF_ALU && c & !(0xf0 | BPF_X | 0x07) == 0 => {
                        Self::Alu(op, Source::from_code(c))
                    }
                    _ => return None,
                },
                OpcodeClass::Jmp => match JmpOp::from_code(c) {
                    Some(op) if c & !(0xf0 | BPF_X | 0x07) == 0 => {
                        Self::Jump(op, Source::from_code(c))
                    }
                    _ => return None,
                },
                _ => return None,
            },
        };
        Some(op)
    }

    /// Whether the operation overwrites the accumulator.
    #[inline]
    pub const fn writes_a(self) -> bool {
        matches!(
            self,
            Self::LoadAbs
                | Self::LoadLen
                | Self::LoadImm
                | Self::LoadMem
                | Self::Alu(..)
                | Self::Neg
                | Self::Txa
        )
    }

    /// Whether the operation observes the accumulator.
    #[inline]
    pub const fn reads_a(self) -> bool {
        matches!(
            self,
            Self::Store | Self::Alu(..) | Self::Neg | Self::Jump(..) | Self::RetA | Self::Tax
        )
    }

    /// Whether control never falls through to the next instruction.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ja | Self::Jump(..) | Self::RetK | Self::RetA)
    }
}
