//! Test-support compiler for exercising the engine without a real VM.
//!
//! The stub honors the real intake pipeline (decode + subset check) and
//! executes the one program shape tests actually need: a single
//! return-constant instruction. Anything richer is delegated to a caller
//! closure, so a test can script verdicts per record while the encoding
//! path stays honest.

use std::sync::Arc;

use crate::action::RawVerdict;
use crate::record::SyscallRecord;

use super::{
    CompiledProgram, ProgramCompiler, ProgramError, RawInstruction, CLASS_RET,
    INSTRUCTION_SIZE, SRC_K,
};

type VerdictFn = dyn Fn(&SyscallRecord) -> u32 + Send + Sync;

/// Compiler stub: literal single-`RET` programs, closure fallback.
pub struct StubCompiler {
    fallback: Option<Arc<VerdictFn>>,
}

impl StubCompiler {
    /// A stub that only accepts single return-constant programs.
    #[must_use]
    pub fn new() -> Self {
        Self { fallback: None }
    }

    /// A stub that evaluates non-trivial programs with `f`.
    #[must_use]
    pub fn with_fallback<F>(f: F) -> Self
    where
        F: Fn(&SyscallRecord) -> u32 + Send + Sync + 'static,
    {
        Self { fallback: Some(Arc::new(f)) }
    }
}

impl Default for StubCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCompiler for StubCompiler {
    fn compile(
        &self,
        insns: &[RawInstruction],
    ) -> Result<Box<dyn CompiledProgram>, ProgramError> {
        if insns.len() == 1 && insns[0].code == CLASS_RET | SRC_K {
            return Ok(Box::new(FixedProgram { verdict: insns[0].k, len: 1 }));
        }
        match &self.fallback {
            Some(f) => Ok(Box::new(ScriptedProgram {
                f: Arc::clone(f),
                len: insns.len(),
            })),
            None => Err(ProgramError::Rejected {
                reason: "stub compiler only executes single-return programs".to_string(),
            }),
        }
    }
}

struct FixedProgram {
    verdict: u32,
    len: usize,
}

impl CompiledProgram for FixedProgram {
    fn evaluate(&self, _record: &SyscallRecord) -> RawVerdict {
        RawVerdict(self.verdict)
    }

    fn instruction_count(&self) -> usize {
        self.len
    }
}

struct ScriptedProgram {
    f: Arc<VerdictFn>,
    len: usize,
}

impl CompiledProgram for ScriptedProgram {
    fn evaluate(&self, record: &SyscallRecord) -> RawVerdict {
        RawVerdict((self.f)(record))
    }

    fn instruction_count(&self) -> usize {
        self.len
    }
}

/// Encodes a one-instruction program returning `verdict` unconditionally.
#[must_use]
pub fn ret_program(verdict: u32) -> Vec<u8> {
    RawInstruction::stmt(CLASS_RET | SRC_K, verdict).encode().to_vec()
}

/// Encodes `len` copies of a return-constant instruction; with the stub
/// this needs a fallback closure to run, but it exercises real length
/// accounting.
#[must_use]
pub fn padded_program(verdict: u32, len: usize) -> Vec<u8> {
    let insn = RawInstruction::stmt(CLASS_RET | SRC_K, verdict).encode();
    let mut bytes = Vec::with_capacity(len * INSTRUCTION_SIZE);
    for _ in 0..len {
        bytes.extend_from_slice(&insn);
    }
    bytes
}
