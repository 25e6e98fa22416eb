//! Filter-program encoding and the compiler boundary.
//!
//! Policies arrive as a linear sequence of fixed-width instructions over a
//! one-accumulator, one-scratch-register machine that reads the syscall
//! record. The 8-byte-per-instruction encoding is an external ABI consumed
//! by existing policy compilers and is preserved bit-for-bit.
//!
//! This module owns the parts of the program pipeline that belong to the
//! policy engine: decoding raw bytes into instructions, checking that a
//! program stays inside the safe subset (only whitelisted opcodes, record
//! loads aligned and in bounds, scratch slots in range), and the
//! [`ProgramCompiler`] / [`CompiledProgram`] traits behind which the actual
//! virtual machine lives. Flow verification (jump targets, reachability)
//! and execution are the compiler's job, not ours.

pub mod testing;

use thiserror::Error;

use crate::action::RawVerdict;
use crate::record::{SyscallRecord, RECORD_SIZE};

/// Size of one encoded instruction in bytes.
pub const INSTRUCTION_SIZE: usize = 8;

/// Maximum instruction count for a single program.
pub const MAX_PROGRAM_LEN: usize = 4096;

/// Number of scratch-memory slots the abstract machine provides.
pub const SCRATCH_SLOTS: u32 = 16;

// Instruction class (low three bits of the opcode).
pub const CLASS_LD: u16 = 0x00;
pub const CLASS_LDX: u16 = 0x01;
pub const CLASS_ST: u16 = 0x02;
pub const CLASS_STX: u16 = 0x03;
pub const CLASS_ALU: u16 = 0x04;
pub const CLASS_JMP: u16 = 0x05;
pub const CLASS_RET: u16 = 0x06;
pub const CLASS_MISC: u16 = 0x07;

// Load width and addressing mode.
pub const SIZE_W: u16 = 0x00;
pub const MODE_IMM: u16 = 0x00;
pub const MODE_ABS: u16 = 0x20;
pub const MODE_MEM: u16 = 0x60;
pub const MODE_LEN: u16 = 0x80;

// ALU / jump operations.
pub const OP_ADD: u16 = 0x00;
pub const OP_SUB: u16 = 0x10;
pub const OP_MUL: u16 = 0x20;
pub const OP_DIV: u16 = 0x30;
pub const OP_OR: u16 = 0x40;
pub const OP_AND: u16 = 0x50;
pub const OP_LSH: u16 = 0x60;
pub const OP_RSH: u16 = 0x70;
pub const OP_NEG: u16 = 0x80;
pub const OP_XOR: u16 = 0xa0;
pub const OP_JA: u16 = 0x00;
pub const OP_JEQ: u16 = 0x10;
pub const OP_JGT: u16 = 0x20;
pub const OP_JGE: u16 = 0x30;
pub const OP_JSET: u16 = 0x40;

// Operand source and return source.
pub const SRC_K: u16 = 0x00;
pub const SRC_X: u16 = 0x08;
pub const RVAL_A: u16 = 0x10;

// Misc sub-ops.
pub const MISC_TAX: u16 = 0x00;
pub const MISC_TXA: u16 = 0x80;

/// One fixed-width filter instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    /// Packed opcode: class, width, mode, operation, operand source.
    pub code: u16,
    /// Jump-if-true displacement.
    pub jt: u8,
    /// Jump-if-false displacement.
    pub jf: u8,
    /// Immediate operand.
    pub k: u32,
}

impl RawInstruction {
    /// Convenience constructor for statements (`jt`/`jf` zero).
    #[must_use]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    /// Convenience constructor for conditional jumps.
    #[must_use]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// Encodes the instruction into its 8-byte native-endian image.
    #[must_use]
    pub fn encode(&self) -> [u8; INSTRUCTION_SIZE] {
        let mut buf = [0u8; INSTRUCTION_SIZE];
        buf[0..2].copy_from_slice(&self.code.to_ne_bytes());
        buf[2] = self.jt;
        buf[3] = self.jf;
        buf[4..8].copy_from_slice(&self.k.to_ne_bytes());
        buf
    }

    /// Decodes one instruction from its 8-byte image.
    #[must_use]
    pub fn decode(buf: &[u8; INSTRUCTION_SIZE]) -> Self {
        let mut code = [0u8; 2];
        code.copy_from_slice(&buf[0..2]);
        let mut k = [0u8; 4];
        k.copy_from_slice(&buf[4..8]);
        Self {
            code: u16::from_ne_bytes(code),
            jt: buf[2],
            jf: buf[3],
            k: u32::from_ne_bytes(k),
        }
    }
}

/// Reasons a program is rejected before ever reaching the compiler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgramError {
    /// The byte stream is empty.
    #[error("filter program is empty")]
    Empty,

    /// The byte stream is not a whole number of instructions.
    #[error("filter program length {len} is not a multiple of {}", INSTRUCTION_SIZE)]
    Truncated {
        /// Length of the rejected byte stream.
        len: usize,
    },

    /// The program exceeds the per-program instruction cap.
    #[error("filter program has {len} instructions, limit is {max}")]
    TooLong {
        /// Instruction count of the rejected program.
        len: usize,
        /// The per-program cap.
        max: usize,
    },

    /// An opcode outside the accepted safe subset.
    #[error("unsupported opcode {code:#06x} at instruction {pc}")]
    UnsupportedOpcode {
        /// Index of the offending instruction.
        pc: usize,
        /// The rejected opcode.
        code: u16,
    },

    /// A record load outside the 64-byte record.
    #[error("record load at instruction {pc} reads offset {offset}, record is {} bytes", RECORD_SIZE)]
    LoadOutOfBounds {
        /// Index of the offending instruction.
        pc: usize,
        /// The out-of-range byte offset.
        offset: u32,
    },

    /// A record load that is not 4-byte aligned.
    #[error("record load at instruction {pc} uses misaligned offset {offset}")]
    MisalignedLoad {
        /// Index of the offending instruction.
        pc: usize,
        /// The misaligned byte offset.
        offset: u32,
    },

    /// A scratch-memory access outside the machine's slot range.
    #[error("scratch access at instruction {pc} uses slot {slot}, machine has {}", SCRATCH_SLOTS)]
    ScratchOutOfBounds {
        /// Index of the offending instruction.
        pc: usize,
        /// The out-of-range slot index.
        slot: u32,
    },

    /// The compiler rejected the program for a reason of its own
    /// (typically flow verification).
    #[error("compiler rejected program: {reason}")]
    Rejected {
        /// Compiler-supplied reason.
        reason: String,
    },
}

/// Decodes a raw byte stream into instructions, applying the length rules.
///
/// # Errors
///
/// `Empty` for a zero-length stream, `Truncated` when the length is not a
/// multiple of [`INSTRUCTION_SIZE`], `TooLong` past [`MAX_PROGRAM_LEN`].
pub fn decode_program(bytes: &[u8]) -> Result<Vec<RawInstruction>, ProgramError> {
    if bytes.is_empty() {
        return Err(ProgramError::Empty);
    }
    if bytes.len() % INSTRUCTION_SIZE != 0 {
        return Err(ProgramError::Truncated { len: bytes.len() });
    }
    let len = bytes.len() / INSTRUCTION_SIZE;
    if len > MAX_PROGRAM_LEN {
        return Err(ProgramError::TooLong { len, max: MAX_PROGRAM_LEN });
    }
    Ok(bytes
        .chunks_exact(INSTRUCTION_SIZE)
        .map(|chunk| {
            let mut image = [0u8; INSTRUCTION_SIZE];
            image.copy_from_slice(chunk);
            RawInstruction::decode(&image)
        })
        .collect())
}

/// Checks that every instruction stays inside the accepted safe subset.
///
/// Record loads must be 32-bit, 4-byte aligned, and inside the record;
/// scratch accesses must name a real slot; everything else must be one of
/// the whitelisted arithmetic, jump, load, store, transfer, or return
/// forms.
///
/// # Errors
///
/// The first offending instruction is reported; nothing past it is
/// inspected.
pub fn check_program(insns: &[RawInstruction]) -> Result<(), ProgramError> {
    for (pc, insn) in insns.iter().enumerate() {
        let code = insn.code;
        let k = insn.k;
        match code {
            // Loads from the syscall record.
            c if c == CLASS_LD | SIZE_W | MODE_ABS => {
                if k as usize + 4 > RECORD_SIZE {
                    return Err(ProgramError::LoadOutOfBounds { pc, offset: k });
                }
                if k % 4 != 0 {
                    return Err(ProgramError::MisalignedLoad { pc, offset: k });
                }
            }
            // Record-length pseudo-loads.
            c if c == CLASS_LD | SIZE_W | MODE_LEN => {}
            c if c == CLASS_LDX | SIZE_W | MODE_LEN => {}
            // Scratch memory.
            c if c == CLASS_LD | MODE_MEM
                || c == CLASS_LDX | MODE_MEM
                || c == CLASS_ST
                || c == CLASS_STX =>
            {
                if k >= SCRATCH_SLOTS {
                    return Err(ProgramError::ScratchOutOfBounds { pc, slot: k });
                }
            }
            // Immediates, register transfer, returns.
            c if c == CLASS_LD | MODE_IMM => {}
            c if c == CLASS_LDX | MODE_IMM => {}
            c if c == CLASS_MISC | MISC_TAX => {}
            c if c == CLASS_MISC | MISC_TXA => {}
            c if c == CLASS_RET | SRC_K => {}
            c if c == CLASS_RET | RVAL_A => {}
            // Arithmetic and bitwise operations.
            c if c == CLASS_ALU | OP_ADD | SRC_K => {}
            c if c == CLASS_ALU | OP_ADD | SRC_X => {}
            c if c == CLASS_ALU | OP_SUB | SRC_K => {}
            c if c == CLASS_ALU | OP_SUB | SRC_X => {}
            c if c == CLASS_ALU | OP_MUL | SRC_K => {}
            c if c == CLASS_ALU | OP_MUL | SRC_X => {}
            c if c == CLASS_ALU | OP_DIV | SRC_K => {}
            c if c == CLASS_ALU | OP_DIV | SRC_X => {}
            c if c == CLASS_ALU | OP_AND | SRC_K => {}
            c if c == CLASS_ALU | OP_AND | SRC_X => {}
            c if c == CLASS_ALU | OP_OR | SRC_K => {}
            c if c == CLASS_ALU | OP_OR | SRC_X => {}
            c if c == CLASS_ALU | OP_XOR | SRC_K => {}
            c if c == CLASS_ALU | OP_XOR | SRC_X => {}
            c if c == CLASS_ALU | OP_LSH | SRC_K => {}
            c if c == CLASS_ALU | OP_LSH | SRC_X => {}
            c if c == CLASS_ALU | OP_RSH | SRC_K => {}
            c if c == CLASS_ALU | OP_RSH | SRC_X => {}
            c if c == CLASS_ALU | OP_NEG => {}
            // Jumps.
            c if c == CLASS_JMP | OP_JA => {}
            c if c == CLASS_JMP | OP_JEQ | SRC_K => {}
            c if c == CLASS_JMP | OP_JEQ | SRC_X => {}
            c if c == CLASS_JMP | OP_JGE | SRC_K => {}
            c if c == CLASS_JMP | OP_JGE | SRC_X => {}
            c if c == CLASS_JMP | OP_JGT | SRC_K => {}
            c if c == CLASS_JMP | OP_JGT | SRC_X => {}
            c if c == CLASS_JMP | OP_JSET | SRC_K => {}
            c if c == CLASS_JMP | OP_JSET | SRC_X => {}
            _ => return Err(ProgramError::UnsupportedOpcode { pc, code }),
        }
    }
    Ok(())
}

/// A verified, executable filter program.
///
/// Implementations live behind the compiler boundary; the engine only ever
/// runs them as a pure function of the record.
pub trait CompiledProgram: Send + Sync {
    /// Evaluates the program against one syscall record.
    fn evaluate(&self, record: &SyscallRecord) -> RawVerdict;

    /// Instruction count, used for the per-chain instruction budget.
    fn instruction_count(&self) -> usize;
}

/// The external compiler/verifier boundary.
pub trait ProgramCompiler: Send + Sync {
    /// Compiles a decoded, subset-checked program.
    ///
    /// # Errors
    ///
    /// `ProgramError::Rejected` when the compiler's own verification
    /// (flow checks, jump bounds) fails.
    fn compile(
        &self,
        insns: &[RawInstruction],
    ) -> Result<Box<dyn CompiledProgram>, ProgramError>;
}

/// Full intake pipeline: decode, subset-check, compile.
///
/// # Errors
///
/// Any decode, subset, or compiler rejection, in that order.
pub fn prepare(
    compiler: &dyn ProgramCompiler,
    bytes: &[u8],
) -> Result<Box<dyn CompiledProgram>, ProgramError> {
    let insns = decode_program(bytes)?;
    check_program(&insns)?;
    compiler.compile(&insns)
}

#[cfg(test)]
mod tests;
