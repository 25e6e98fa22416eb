//! Encoding and subset-checker tests.

use proptest::prelude::*;

use super::testing::{ret_program, StubCompiler};
use super::*;
use crate::action::{RET_ALLOW, RET_ERRNO};
use crate::record::{OFF_ARCH, OFF_NR};

fn load_nr() -> RawInstruction {
    RawInstruction::stmt(CLASS_LD | SIZE_W | MODE_ABS, OFF_NR as u32)
}

fn ret_k(k: u32) -> RawInstruction {
    RawInstruction::stmt(CLASS_RET | SRC_K, k)
}

#[test]
fn decode_rejects_empty() {
    assert!(matches!(decode_program(&[]), Err(ProgramError::Empty)));
}

#[test]
fn decode_rejects_partial_instruction() {
    let mut bytes = ret_program(RET_ALLOW);
    bytes.pop();
    assert!(matches!(
        decode_program(&bytes),
        Err(ProgramError::Truncated { len: 7 })
    ));
}

#[test]
fn decode_rejects_oversized_program() {
    let bytes = vec![0u8; (MAX_PROGRAM_LEN + 1) * INSTRUCTION_SIZE];
    assert!(matches!(
        decode_program(&bytes),
        Err(ProgramError::TooLong { len, max: MAX_PROGRAM_LEN }) if len == MAX_PROGRAM_LEN + 1
    ));
}

#[test]
fn decode_accepts_maximum_length() {
    let bytes = vec![0u8; MAX_PROGRAM_LEN * INSTRUCTION_SIZE];
    assert_eq!(decode_program(&bytes).unwrap().len(), MAX_PROGRAM_LEN);
}

#[test]
fn instruction_image_round_trips() {
    let insn = RawInstruction::jump(CLASS_JMP | OP_JEQ | SRC_K, 0xdead_beef, 3, 7);
    assert_eq!(RawInstruction::decode(&insn.encode()), insn);
}

#[test]
fn checker_accepts_a_typical_allowlist_program() {
    // Load nr, compare against one syscall, allow or errno.
    let program = [
        load_nr(),
        RawInstruction::jump(CLASS_JMP | OP_JEQ | SRC_K, 2, 0, 1),
        ret_k(RET_ALLOW),
        ret_k(RET_ERRNO | 5),
    ];
    assert!(check_program(&program).is_ok());
}

#[test]
fn checker_accepts_arithmetic_and_scratch() {
    let program = [
        RawInstruction::stmt(CLASS_LD | MODE_IMM, 41),
        RawInstruction::stmt(CLASS_ALU | OP_ADD | SRC_K, 1),
        RawInstruction::stmt(CLASS_ST, 0),
        RawInstruction::stmt(CLASS_LDX | MODE_MEM, 0),
        RawInstruction::stmt(CLASS_MISC | MISC_TXA, 0),
        RawInstruction::stmt(CLASS_RET | RVAL_A, 0),
    ];
    assert!(check_program(&program).is_ok());
}

#[test]
fn checker_rejects_misaligned_record_load() {
    let program = [
        RawInstruction::stmt(CLASS_LD | SIZE_W | MODE_ABS, OFF_ARCH as u32 + 1),
        ret_k(RET_ALLOW),
    ];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::MisalignedLoad { pc: 0, offset }) if offset == OFF_ARCH as u32 + 1
    ));
}

#[test]
fn checker_rejects_record_load_past_the_record() {
    let program = [
        RawInstruction::stmt(CLASS_LD | SIZE_W | MODE_ABS, 64),
        ret_k(RET_ALLOW),
    ];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::LoadOutOfBounds { pc: 0, offset: 64 })
    ));
}

#[test]
fn checker_rejects_wide_load_straddling_the_end() {
    // Offset 61 is both misaligned and straddles the boundary; the bounds
    // check runs first.
    let program = [RawInstruction::stmt(CLASS_LD | SIZE_W | MODE_ABS, 61)];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::LoadOutOfBounds { pc: 0, offset: 61 })
    ));
}

#[test]
fn checker_rejects_scratch_slot_out_of_range() {
    let program = [RawInstruction::stmt(CLASS_ST, SCRATCH_SLOTS)];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::ScratchOutOfBounds { pc: 0, slot }) if slot == SCRATCH_SLOTS
    ));
}

#[test]
fn checker_rejects_byte_wide_record_loads() {
    // A byte-wide absolute load (width bits 0x10) is outside the subset.
    let program = [RawInstruction::stmt(CLASS_LD | 0x10 | MODE_ABS, 0)];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::UnsupportedOpcode { pc: 0, .. })
    ));
}

#[test]
fn checker_reports_first_offender_only() {
    let program = [
        load_nr(),
        RawInstruction::stmt(0x00ff, 0),
        RawInstruction::stmt(0x00fe, 0),
    ];
    assert!(matches!(
        check_program(&program),
        Err(ProgramError::UnsupportedOpcode { pc: 1, code: 0x00ff })
    ));
}

#[test]
fn stub_compiler_runs_single_return_programs() {
    let compiler = StubCompiler::new();
    let program = prepare(&compiler, &ret_program(RET_ERRNO | 9)).unwrap();
    assert_eq!(program.evaluate(&crate::record::SyscallRecord::default()).0, RET_ERRNO | 9);
    assert_eq!(program.instruction_count(), 1);
}

#[test]
fn stub_compiler_without_fallback_rejects_rich_programs() {
    let compiler = StubCompiler::new();
    let bytes: Vec<u8> = [load_nr(), ret_k(RET_ALLOW)]
        .iter()
        .flat_map(|i| i.encode())
        .collect();
    assert!(matches!(
        prepare(&compiler, &bytes),
        Err(ProgramError::Rejected { .. })
    ));
}

proptest! {
    /// The intake pipeline must never panic, whatever bytes arrive.
    #[test]
    fn intake_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let compiler = StubCompiler::with_fallback(|_| RET_ALLOW);
        let _ = prepare(&compiler, &bytes);
    }

    /// Any decoded program re-encodes to the original bytes.
    #[test]
    fn decode_preserves_bytes(insns in proptest::collection::vec(any::<(u16, u8, u8, u32)>(), 1..64)) {
        let bytes: Vec<u8> = insns
            .iter()
            .flat_map(|&(code, jt, jf, k)| RawInstruction { code, jt, jf, k }.encode())
            .collect();
        let decoded = decode_program(&bytes).unwrap();
        let reencoded: Vec<u8> = decoded.iter().flat_map(RawInstruction::encode).collect();
        prop_assert_eq!(reencoded, bytes);
    }
}
