//! Classic BPF Instruction Format
//!
//! Every instruction is the kernel's `struct sock_filter`:
//!
//! ```text
//! +----------+--------+--------+--------------+
//! |   code   |   jt   |   jf   |      k       |
//! | 16 bits  | 8 bits | 8 bits |   32 bits    |
//! +----------+--------+--------+--------------+
//! ```
//!
//! Jump offsets are relative to the next instruction and can only move
//! forward: `jt`/`jf` reach at most 255 instructions, `ja` uses all of `k`.

use core::fmt;

use super::opcode::{
    AluOp, BPF_A, BPF_ABS, BPF_ALU, BPF_IMM, BPF_JA, BPF_JMP, BPF_K, BPF_LD, BPF_LDX, BPF_MEM,
    BPF_MISC, BPF_RET, BPF_ST, BPF_STX, BPF_TAX, BPF_TXA, BPF_W, JmpOp, Operation, Source,
};

/// Single classic BPF instruction (8 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    /// Size of an encoded instruction in bytes.
    pub const SIZE: usize = 8;

    /// Maximum distance a conditional jump can cover.
    pub const MAX_COND_OFFSET: usize = u8::MAX as usize;

    #[inline]
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// Non-jump instruction.
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self::new(code, 0, 0, k)
    }

    /// Conditional jump.
    #[inline]
    pub const fn jump(op: JmpOp, source: Source, k: u32, jt: u8, jf: u8) -> Self {
        Self::new(BPF_JMP | op as u16 | source.bits(), jt, jf, k)
    }

    /// `ld [offset]`
    #[inline]
    pub const fn load_abs(offset: u32) -> Self {
        Self::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
    }

    /// `ld #k`
    #[inline]
    pub const fn load_imm(k: u32) -> Self {
        Self::stmt(BPF_LD | BPF_IMM, k)
    }

    /// `ld M[slot]`
    #[inline]
    pub const fn load_mem(slot: u32) -> Self {
        Self::stmt(BPF_LD | BPF_MEM, slot)
    }

    /// `ldx #k`
    #[inline]
    pub const fn load_x_imm(k: u32) -> Self {
        Self::stmt(BPF_LDX | BPF_IMM, k)
    }

    /// `st M[slot]`
    #[inline]
    pub const fn store(slot: u32) -> Self {
        Self::stmt(BPF_ST, slot)
    }

    /// `stx M[slot]`
    #[inline]
    pub const fn store_x(slot: u32) -> Self {
        Self::stmt(BPF_STX, slot)
    }

    /// `<op> #k`
    #[inline]
    pub const fn alu_k(op: AluOp, k: u32) -> Self {
        Self::stmt(BPF_ALU | op as u16 | BPF_K, k)
    }

    /// `<op> x`
    #[inline]
    pub const fn alu_x(op: AluOp) -> Self {
        Self::stmt(BPF_ALU | op as u16 | Source::X.bits(), 0)
    }

    #[inline]
    pub const fn tax() -> Self {
        Self::stmt(BPF_MISC | BPF_TAX, 0)
    }

    #[inline]
    pub const fn txa() -> Self {
        Self::stmt(BPF_MISC | BPF_TXA, 0)
    }

    /// `ja +offset`
    #[inline]
    pub const fn ja(offset: u32) -> Self {
        Self::stmt(BPF_JMP | BPF_JA, offset)
    }

    #[inline]
    pub const fn jeq(k: u32, jt: u8, jf: u8) -> Self {
        Self::jump(JmpOp::Jeq, Source::K, k, jt, jf)
    }

    #[inline]
    pub const fn jgt(k: u32, jt: u8, jf: u8) -> Self {
        Self::jump(JmpOp::Jgt, Source::K, k, jt, jf)
    }

    #[inline]
    pub const fn jge(k: u32, jt: u8, jf: u8) -> Self {
        Self::jump(JmpOp::Jge, Source::K, k, jt, jf)
    }

    #[inline]
    pub const fn jset(k: u32, jt: u8, jf: u8) -> Self {
        Self::jump(JmpOp::Jset, Source::K, k, jt, jf)
    }

    /// `ret #k`
    #[inline]
    pub const fn ret(k: u32) -> Self {
        Self::stmt(BPF_RET | BPF_K, k)
    }

    /// `ret a`
    #[inline]
    pub const fn ret_a() -> Self {
        Self::stmt(BPF_RET | BPF_A, 0)
    }

    /// Decode the code, `None` if seccomp would reject it.
    #[inline]
    pub const fn operation(&self) -> Option<Operation> {
        Operation::from_code(self.code)
    }

    #[inline]
    pub const fn is_ret(&self) -> bool {
        matches!(self.operation(), Some(Operation::RetK | Operation::RetA))
    }

    #[inline]
    pub const fn is_ja(&self) -> bool {
        matches!(self.operation(), Some(Operation::Ja))
    }

    #[inline]
    pub const fn is_conditional_jump(&self) -> bool {
        matches!(self.operation(), Some(Operation::Jump(..)))
    }

    /// Comparison of a conditional jump against the constant `k`.
    #[inline]
    pub const fn jmp_op_k(&self) -> Option<JmpOp> {
        match self.operation() {
            Some(Operation::Jump(op, Source::K)) => Some(op),
            _ => None,
        }
    }

    /// Absolute successor indices of the instruction at `pc`.
    ///
    /// Returns `(taken, not_taken)`. Returns have no successors, straight-line
    /// instructions and `ja` have only the first.
    pub fn successors(&self, pc: usize) -> (Option<usize>, Option<usize>) {
        match self.operation() {
            Some(Operation::RetK | Operation::RetA) | None => (None, None),
            Some(Operation::Ja) => (Some(pc + 1 + self.k as usize), None),
            Some(Operation::Jump(..)) => (
                Some(pc + 1 + self.jt as usize),
                Some(pc + 1 + self.jf as usize),
            ),
            Some(_) => (Some(pc + 1), None),
        }
    }
}

impl Instruction {
    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, src: Source) -> fmt::Result {
        match src {
            Source::K => write!(f, "#{:#x}", self.k),
            Source::X => write!(f, "x"),
        }
    }
}

impl Default for Instruction {
    fn default() -> Self {
        Self::ret(0)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("code", &format_args!("{:#06x}", self.code))
            .field("jt", &self.jt)
            .field("jf", &self.jf)
            .field("k", &format_args!("{:#x}", self.k))
            .finish()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(op) = self.operation() else {
            return write!(f, "invalid {:#06x}", self.code);
        };
        match op {
            Operation::LoadAbs => write!(f, "ld [{}]", self.k),
            Operation::LoadLen => write!(f, "ld #len"),
            Operation::LoadImm => write!(f, "ld #{:#x}", self.k),
            Operation::LoadMem => write!(f, "ld M[{}]", self.k),
            Operation::LoadXLen => write!(f, "ldx #len"),
            Operation::LoadXImm => write!(f, "ldx #{:#x}", self.k),
            Operation::LoadXMem => write!(f, "ldx M[{}]", self.k),
            Operation::Store => write!(f, "st M[{}]", self.k),
            Operation::StoreX => write!(f, "stx M[{}]", self.k),
            Operation::Alu(alu, src) => {
                write!(f, "{alu} ")?;
                self.fmt_operand(f, src)
            }
            Operation::Neg => write!(f, "neg"),
            Operation::Ja => write!(f, "ja +{}", self.k),
            Operation::Jump(jmp, src) => {
                write!(f, "{jmp} ")?;
                self.fmt_operand(f, src)?;
                write!(f, ", +{}, +{}", self.jt, self.jf)
            }
            Operation::RetK => write!(f, "ret #{:#x}", self.k),
            Operation::RetA => write!(f, "ret a"),
            Operation::Tax => write!(f, "tax"),
            Operation::Txa => write!(f, "txa"),
        }
    }
}
