//! Bytecode format for the tjit stack machine.
//!
//! Encoding:
//! - One opcode byte per instruction
//! - CONSTANT, GET, SET and JGT are followed by a 4-byte little-endian
//!   two's-complement signed operand
//! - All other opcodes carry no operand
//!
//! There is no header; a program is just the instruction stream.

use std::fmt;
use thiserror::Error;

/// Position within the bytecode stream. Doubles as the identity of a jump
/// target, so it is signed: a computed target may lie before the program.
pub type ByteOffset = i64;

/// Size of an instruction operand in bytes.
pub const OPERAND_SIZE: usize = 4;

/// Stack machine opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Constant = 0,
    Add = 1,
    Print = 2,
    Input = 3,
    Discard = 4,
    Get = 5,
    Set = 6,
    Cmp = 7,
    Jgt = 8,
    Halt = 9,
}

impl Op {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            0 => Op::Constant,
            1 => Op::Add,
            2 => Op::Print,
            3 => Op::Input,
            4 => Op::Discard,
            5 => Op::Get,
            6 => Op::Set,
            7 => Op::Cmp,
            8 => Op::Jgt,
            9 => Op::Halt,
            _ => return None,
        };
        Some(op)
    }

    /// Whether the opcode is followed by an imm32 operand.
    pub fn has_operand(self) -> bool {
        matches!(self, Op::Constant | Op::Get | Op::Set | Op::Jgt)
    }

    /// Encoded size of the instruction, opcode byte included.
    pub fn encoded_len(self) -> usize {
        if self.has_operand() {
            1 + OPERAND_SIZE
        } else {
            1
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Constant => "CONSTANT",
            Op::Add => "ADD",
            Op::Print => "PRINT",
            Op::Input => "INPUT",
            Op::Discard => "DISCARD",
            Op::Get => "GET",
            Op::Set => "SET",
            Op::Cmp => "CMP",
            Op::Jgt => "JGT",
            Op::Halt => "HALT",
        }
    }
}

/// Errors raised while decoding a bytecode stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: ByteOffset, byte: u8 },
    #[error("truncated operand for {} at offset {offset}", .op.mnemonic())]
    TruncatedOperand { offset: ByteOffset, op: Op },
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: ByteOffset,
    pub op: Op,
    pub operand: Option<i32>,
}

impl Instruction {
    /// Operand value, or 0 for opcodes without one.
    pub fn imm(&self) -> i32 {
        self.operand.unwrap_or(0)
    }

    /// Absolute branch target of a JGT (relative to the JGT itself).
    pub fn branch_target(&self) -> Option<ByteOffset> {
        match self.op {
            Op::Jgt => Some(self.offset + self.imm() as ByteOffset),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.op.encoded_len()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}: {}", self.offset, self.op.mnemonic())?;
        if let Some(operand) = self.operand {
            write!(f, " {}", operand)?;
        }
        if let Some(target) = self.branch_target() {
            write!(f, " (-> {:04})", target)?;
        }
        Ok(())
    }
}

/// Iterator over the instructions of a program, in address order.
pub struct Decoder<'a> {
    program: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(program: &'a [u8]) -> Self {
        Self { program, pos: 0 }
    }

    /// Offset of the next instruction to decode.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_operand(&self, at: usize) -> Option<i32> {
        let bytes = self.program.get(at..at + OPERAND_SIZE)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let byte = *self.program.get(self.pos)?;
        let offset = self.pos as ByteOffset;

        let Some(op) = Op::from_byte(byte) else {
            // Stop after the first error; the rest of the stream is meaningless.
            self.pos = self.program.len();
            return Some(Err(DecodeError::UnknownOpcode { offset, byte }));
        };

        let operand = if op.has_operand() {
            match self.read_operand(self.pos + 1) {
                Some(value) => Some(value),
                None => {
                    self.pos = self.program.len();
                    return Some(Err(DecodeError::TruncatedOperand { offset, op }));
                }
            }
        } else {
            None
        };

        self.pos += op.encoded_len();
        Some(Ok(Instruction {
            offset,
            op,
            operand,
        }))
    }
}

/// Decode a whole program.
pub fn decode(program: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    Decoder::new(program).collect()
}

/// Render a program as one instruction per line.
pub fn disassemble(program: &[u8]) -> Result<String, DecodeError> {
    let mut out = String::new();
    for insn in Decoder::new(program) {
        out.push_str(&insn?.to_string());
        out.push('\n');
    }
    Ok(out)
}

/// Incremental builder for bytecode programs.
#[derive(Debug, Default, Clone)]
pub struct ProgramBuilder {
    code: Vec<u8>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset at which the next instruction will start.
    pub fn here(&self) -> ByteOffset {
        self.code.len() as ByteOffset
    }

    fn op(&mut self, op: Op) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    fn op_imm(&mut self, op: Op, imm: i32) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn constant(&mut self, value: i32) -> &mut Self {
        self.op_imm(Op::Constant, value)
    }

    pub fn add(&mut self) -> &mut Self {
        self.op(Op::Add)
    }

    pub fn print(&mut self) -> &mut Self {
        self.op(Op::Print)
    }

    pub fn input(&mut self) -> &mut Self {
        self.op(Op::Input)
    }

    pub fn discard(&mut self) -> &mut Self {
        self.op(Op::Discard)
    }

    pub fn get(&mut self, depth: i32) -> &mut Self {
        self.op_imm(Op::Get, depth)
    }

    pub fn set(&mut self, depth: i32) -> &mut Self {
        self.op_imm(Op::Set, depth)
    }

    pub fn cmp(&mut self) -> &mut Self {
        self.op(Op::Cmp)
    }

    /// JGT with a raw relative operand.
    pub fn jgt(&mut self, rel: i32) -> &mut Self {
        self.op_imm(Op::Jgt, rel)
    }

    /// JGT to an absolute offset; the operand is computed from the position
    /// of this JGT.
    pub fn jgt_to(&mut self, target: ByteOffset) -> &mut Self {
        let rel = (target - self.here()) as i32;
        self.jgt(rel)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.op(Op::Halt)
    }

    /// Append a raw byte, for building deliberately malformed programs.
    pub fn raw(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.code.clone()
    }
}

/// Multiply two inputs by repeated addition and print the product.
///
/// Stack layout while looping: `[a, b, total]`. The loop body runs at least
/// once, adding `a` to `total` and decrementing `b`, and repeats while the
/// decremented `b` is still positive.
pub fn sample_multiply() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    b.input().input().constant(0);

    let head = b.here();
    // total += a
    b.get(0).get(3).add().set(0);
    // b -= 1
    b.get(1).constant(-1).add().set(1);
    // loop while b > 0
    b.get(1).constant(0).cmp().jgt_to(head);

    b.get(0).print().halt();
    b.build()
}
